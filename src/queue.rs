//! Bounded ring queue between producers and one shard worker.
//!
//! The fast path is single-producer/single-consumer: each side keeps its
//! own index plus a cached copy of the other side's, so steady-state pushes
//! and pops touch one atomic store each. Indices grow monotonically and are
//! masked on slot access (capacity is a power of two). A successful push
//! publishes with a release store on the producer index; a consumer whose
//! cache looks empty refreshes it with an acquire load, which establishes
//! happens-before between the slot write and the slot read. Symmetrically
//! for the consumer index.
//!
//! Queues built with [`RingBuffer::multi_producer`] serialise the push path
//! behind an internal spinlock so arbitrary caller threads can share the
//! producer role; the consumer side never locks in either mode.

use std::cell::{Cell, UnsafeCell};
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Default queue capacity (slots).
pub const DEFAULT_QUEUE_CAPACITY: usize = 65_536;

/// Test-and-test-and-set spinlock guarding shared-producer pushes.
pub struct SpinLock {
    locked: AtomicBool,
}

impl SpinLock {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn lock(&self) {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                std::hint::spin_loop();
            }
        }
    }

    #[inline]
    pub fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Producer-side state. The cached consumer index lives here so a push that
/// finds room in the cache never touches the consumer's cache line.
#[repr(align(64))]
struct ProducerSide {
    tail: AtomicUsize,
    cached_head: Cell<usize>,
    lock: SpinLock,
}

/// Consumer-side state, one cache line away from the producer's.
#[repr(align(64))]
struct ConsumerSide {
    head: AtomicUsize,
    cached_tail: Cell<usize>,
}

/// Fixed-capacity command queue.
///
/// Contract: at most one consumer thread. At most one producer thread
/// unless constructed with [`RingBuffer::multi_producer`], in which case
/// the spinlock serialises pushes and whole batches stay contiguous.
pub struct RingBuffer<T> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    mask: usize,
    shared_producers: bool,
    prod: ProducerSide,
    cons: ConsumerSide,
}

// The Cells are confined to their own side of the queue: the producer side
// is either single-threaded or serialised by the spinlock, the consumer
// side is single-threaded by contract.
unsafe impl<T: Send> Send for RingBuffer<T> {}
unsafe impl<T: Send> Sync for RingBuffer<T> {}

impl<T: Copy> RingBuffer<T> {
    /// Single-producer queue with `capacity` slots (a power of two).
    pub fn new(capacity: usize) -> Self {
        Self::build(capacity, false)
    }

    /// Queue whose producer side may be shared across threads.
    pub fn multi_producer(capacity: usize) -> Self {
        Self::build(capacity, true)
    }

    fn build(capacity: usize, shared_producers: bool) -> Self {
        assert!(
            capacity.is_power_of_two() && capacity > 0,
            "queue capacity must be a nonzero power of two"
        );
        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect();
        Self {
            slots,
            mask: capacity - 1,
            shared_producers,
            prod: ProducerSide {
                tail: AtomicUsize::new(0),
                cached_head: Cell::new(0),
                lock: SpinLock::new(),
            },
            cons: ConsumerSide {
                head: AtomicUsize::new(0),
                cached_tail: Cell::new(0),
            },
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Items currently enqueued. Approximate under concurrent use.
    #[inline]
    pub fn len(&self) -> usize {
        self.prod
            .tail
            .load(Ordering::Relaxed)
            .wrapping_sub(self.cons.head.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue one item; false if the queue is full.
    #[inline]
    pub fn push(&self, item: T) -> bool {
        self.push_batch(std::slice::from_ref(&item))
    }

    /// Enqueue one item, spin-yielding until space is available.
    pub fn push_block(&self, item: T) {
        while !self.push(item) {
            std::thread::yield_now();
        }
    }

    /// Enqueue all of `items` as one contiguous run, or nothing.
    ///
    /// The consumer observes either the whole batch or none of it: the
    /// producer index is published once, after every slot is written.
    pub fn push_batch(&self, items: &[T]) -> bool {
        if items.is_empty() {
            return true;
        }
        if self.shared_producers {
            self.prod.lock.lock();
            let ok = self.push_batch_unlocked(items);
            self.prod.lock.unlock();
            ok
        } else {
            self.push_batch_unlocked(items)
        }
    }

    #[inline]
    fn push_batch_unlocked(&self, items: &[T]) -> bool {
        let tail = self.prod.tail.load(Ordering::Relaxed);
        let mut head = self.prod.cached_head.get();

        if self.capacity() - tail.wrapping_sub(head) < items.len() {
            head = self.cons.head.load(Ordering::Acquire);
            self.prod.cached_head.set(head);
            if self.capacity() - tail.wrapping_sub(head) < items.len() {
                return false;
            }
        }

        for (i, item) in items.iter().enumerate() {
            let slot = tail.wrapping_add(i) & self.mask;
            unsafe {
                (*self.slots[slot].get()).write(*item);
            }
        }
        self.prod
            .tail
            .store(tail.wrapping_add(items.len()), Ordering::Release);
        true
    }

    /// Dequeue one item. Consumer thread only.
    pub fn pop(&self) -> Option<T> {
        let head = self.cons.head.load(Ordering::Relaxed);
        if !self.refresh_tail(head) {
            return None;
        }
        let item = unsafe { (*self.slots[head & self.mask].get()).assume_init() };
        self.cons.head.store(head.wrapping_add(1), Ordering::Release);
        Some(item)
    }

    /// Dequeue up to `max` items into `dst` in one sweep, returning the
    /// count. Consumer thread only.
    pub fn pop_batch(&self, dst: &mut Vec<T>, max: usize) -> usize {
        let head = self.cons.head.load(Ordering::Relaxed);
        if !self.refresh_tail(head) {
            return 0;
        }
        let tail = self.cons.cached_tail.get();
        let count = max.min(tail.wrapping_sub(head));

        dst.reserve(count);
        for i in 0..count {
            let slot = head.wrapping_add(i) & self.mask;
            dst.push(unsafe { (*self.slots[slot].get()).assume_init() });
        }
        self.cons
            .head
            .store(head.wrapping_add(count), Ordering::Release);
        count
    }

    /// Ensure the cached producer index is ahead of `head`, reloading it
    /// with acquire ordering when it is not. False means truly empty.
    #[inline]
    fn refresh_tail(&self, head: usize) -> bool {
        let mut tail = self.cons.cached_tail.get();
        if tail == head {
            tail = self.prod.tail.load(Ordering::Acquire);
            self.cons.cached_tail.set(tail);
            if tail == head {
                return false;
            }
        }
        true
    }
}
