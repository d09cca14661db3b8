//! Sharded execution engine.
//!
//! Symbols are pinned to shards at registration; each shard owns one
//! multi-producer ring queue and one worker thread, so every book is
//! mutated by exactly one thread and the matcher runs without contention.
//! Producers batch commands in thread-local buckets and hand whole batches
//! to the queues, which keeps the per-order cost of submission to a couple
//! of branches on the hot path.
//!
//! Ordering guarantees: commands from one producer thread to one shard are
//! consumed in submission order; commands from different producers
//! interleave at batch boundaries only; nothing is ordered across shards.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use tracing::{debug, info};

use crate::book::OrderBook;
use crate::command::{Command, Order, OrderId, SymbolId, Trade};
use crate::matching::match_order;
use crate::queue::{RingBuffer, DEFAULT_QUEUE_CAPACITY};

/// Commands a producer accumulates locally before touching a shard queue.
pub const BATCH_PRODUCER: usize = 256;

/// Commands a worker drains from its queue per iteration.
pub const BATCH_CONSUMER: usize = 256;

/// Trade sink invoked from worker threads; it must tolerate concurrent
/// invocation from every shard.
pub type TradeCallback = Arc<dyn Fn(&[Trade]) + Send + Sync>;

type SharedBook = Arc<RwLock<OrderBook>>;

// Producer-side batch buckets, keyed by (engine instance, shard). Living in
// a thread-local keeps submission free of cross-thread traffic until a
// bucket actually spills into its queue.
thread_local! {
    static BATCHES: RefCell<FxHashMap<(usize, usize), Vec<Command>>> =
        RefCell::new(FxHashMap::default());
}

static NEXT_ENGINE_ID: AtomicUsize = AtomicUsize::new(0);

fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// One shard: a queue, the books assigned to it, and progress counters the
/// quiesce barrier compares.
struct ShardState {
    queue: RingBuffer<Command>,
    // Sparse, indexed by symbol id; grown under the write lock at
    // registration. The worker only ever takes the read lock.
    books: RwLock<Vec<Option<SharedBook>>>,
    submitted: AtomicU64,
    processed: AtomicU64,
}

#[derive(Default)]
struct SymbolRegistry {
    ids: FxHashMap<String, SymbolId>,
    names: Vec<String>,
    shard_of: Vec<usize>,
}

/// The engine façade: symbol registry, shard workers, producer batching.
pub struct Engine {
    engine_id: usize,
    shards: Vec<Arc<ShardState>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    registry: RwLock<SymbolRegistry>,
    on_trade: Arc<RwLock<Option<TradeCallback>>>,
    stopped: AtomicBool,
}

impl Engine {
    /// Spawn an engine with `n_workers` shards; `0` means one per
    /// available core.
    pub fn new(n_workers: usize) -> Self {
        let n = if n_workers == 0 {
            thread::available_parallelism().map_or(1, |p| p.get())
        } else {
            n_workers
        };

        let cores = core_affinity::get_core_ids().unwrap_or_default();
        let on_trade: Arc<RwLock<Option<TradeCallback>>> = Arc::new(RwLock::new(None));

        let shards: Vec<Arc<ShardState>> = (0..n)
            .map(|_| {
                Arc::new(ShardState {
                    queue: RingBuffer::multi_producer(DEFAULT_QUEUE_CAPACITY),
                    books: RwLock::new(Vec::new()),
                    submitted: AtomicU64::new(0),
                    processed: AtomicU64::new(0),
                })
            })
            .collect();

        let workers = shards
            .iter()
            .enumerate()
            .map(|(i, state)| {
                let state = Arc::clone(state);
                let on_trade = Arc::clone(&on_trade);
                let core = if cores.is_empty() {
                    None
                } else {
                    Some(cores[i % cores.len()])
                };
                thread::Builder::new()
                    .name(format!("shard-{i}"))
                    .spawn(move || worker_loop(i, &state, &on_trade, core))
                    .expect("failed to spawn shard worker")
            })
            .collect();

        info!(shards = n, "engine started");
        Self {
            engine_id: NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed),
            shards,
            workers: Mutex::new(workers),
            registry: RwLock::new(SymbolRegistry::default()),
            on_trade,
            stopped: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    // ========================================================================
    // Symbols
    // ========================================================================

    /// Register `name`, returning its id. Idempotent: re-registering an
    /// existing symbol returns the original id and changes nothing.
    ///
    /// The symbol is pinned to `shard_hint` when it names a valid shard,
    /// otherwise to `id % num_shards`, and its book is created there.
    /// Registration must not race submissions for the id being created.
    pub fn register_symbol(&self, name: &str, shard_hint: i32) -> SymbolId {
        let mut reg = write_lock(&self.registry);
        if let Some(&id) = reg.ids.get(name) {
            return id;
        }

        let id = reg.names.len() as SymbolId;
        let shard = if shard_hint >= 0 && (shard_hint as usize) < self.shards.len() {
            shard_hint as usize
        } else {
            id as usize % self.shards.len()
        };
        reg.ids.insert(name.to_owned(), id);
        reg.names.push(name.to_owned());
        reg.shard_of.push(shard);

        let mut books = write_lock(&self.shards[shard].books);
        if books.len() <= id as usize {
            books.resize(id as usize + 1, None);
        }
        books[id as usize] = Some(Arc::new(RwLock::new(OrderBook::new())));

        debug!(symbol = name, id, shard, "symbol registered");
        id
    }

    /// Name registered for `symbol_id`, or `"UNKNOWN"`.
    pub fn symbol_name(&self, symbol_id: SymbolId) -> String {
        if symbol_id < 0 {
            return "UNKNOWN".to_owned();
        }
        read_lock(&self.registry)
            .names
            .get(symbol_id as usize)
            .cloned()
            .unwrap_or_else(|| "UNKNOWN".to_owned())
    }

    /// Id for a registered symbol name.
    pub fn symbol_id(&self, name: &str) -> Option<SymbolId> {
        read_lock(&self.registry).ids.get(name).copied()
    }

    /// Shared handle to a symbol's book, for observation. The owning shard
    /// worker remains the only writer.
    pub fn get_order_book(&self, symbol_id: SymbolId) -> Option<SharedBook> {
        let shard = self.shard_of(symbol_id)?;
        let books = read_lock(&self.shards[shard].books);
        books.get(symbol_id as usize)?.clone()
    }

    fn shard_of(&self, symbol_id: SymbolId) -> Option<usize> {
        if symbol_id < 0 {
            return None;
        }
        read_lock(&self.registry)
            .shard_of
            .get(symbol_id as usize)
            .copied()
    }

    // ========================================================================
    // Submission
    // ========================================================================

    /// Submit one order. Unknown symbols are dropped silently.
    pub fn submit_order(&self, order: &Order) {
        let _ = self.submit_order_hinted(order, -1);
    }

    /// Submit one order, optionally overriding the target shard. Returns
    /// the time spent spin-yielding on a full queue, for observability;
    /// zero unless this submission spilled a full bucket into a full queue.
    pub fn submit_order_hinted(&self, order: &Order, shard_hint: i32) -> Duration {
        let shard = if shard_hint >= 0 && (shard_hint as usize) < self.shards.len() {
            shard_hint as usize
        } else {
            match self.shard_of(order.symbol_id) {
                Some(shard) => shard,
                None => return Duration::ZERO,
            }
        };
        self.enqueue(shard, Command::Add(*order))
    }

    /// Submit a slice of orders with [`Engine::submit_order`] semantics.
    pub fn submit_orders(&self, orders: &[Order]) {
        self.submit_orders_hinted(orders, -1);
    }

    /// Submit a slice of orders, all routed through the same shard hint.
    pub fn submit_orders_hinted(&self, orders: &[Order], shard_hint: i32) {
        for order in orders {
            let _ = self.submit_order_hinted(order, shard_hint);
        }
    }

    /// Request a best-effort cancel; a no-op once the order has filled.
    pub fn cancel_order(&self, symbol_id: SymbolId, order_id: OrderId) {
        if let Some(shard) = self.shard_of(symbol_id) {
            let _ = self.enqueue(
                shard,
                Command::Cancel {
                    symbol_id,
                    order_id,
                },
            );
        }
    }

    /// Push the calling thread's partially filled batch buckets into their
    /// shard queues, spin-yielding until each shard accepts its batch.
    ///
    /// A producer must flush before any synchronisation point that expects
    /// its commands to have reached the shards.
    pub fn flush(&self) {
        BATCHES.with(|cell| {
            let mut map = cell.borrow_mut();
            for ((engine_id, shard), bucket) in map.iter_mut() {
                if *engine_id == self.engine_id && !bucket.is_empty() {
                    let _ = self.push_bucket(*shard, bucket);
                }
            }
        });
    }

    /// Flush, then wait until every shard has processed everything
    /// submitted to it. Trades for those commands have been delivered to
    /// the callback by the time this returns.
    pub fn quiesce(&self) {
        self.flush();
        for state in &self.shards {
            loop {
                let submitted = state.submitted.load(Ordering::Acquire);
                let processed = state.processed.load(Ordering::Acquire);
                if processed >= submitted {
                    break;
                }
                thread::yield_now();
            }
        }
    }

    /// Empty every book on every shard. Testing and benchmarks only.
    pub fn reset(&self) {
        self.flush();
        for state in &self.shards {
            state.queue.push_block(Command::Reset);
            state.submitted.fetch_add(1, Ordering::Release);
        }
        self.quiesce();
    }

    /// Flush, stop the workers after the commands already queued, and join
    /// them. Idempotent; also runs on drop. Submitting after `stop` is a
    /// caller error.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.flush();
        for state in &self.shards {
            state.queue.push_block(Command::Stop);
        }
        let mut workers = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
        info!("engine stopped");
    }

    /// Install the trade sink. Invoked from every worker thread, once per
    /// drained batch carrying at least one trade.
    pub fn set_trade_callback<F>(&self, callback: F)
    where
        F: Fn(&[Trade]) + Send + Sync + 'static,
    {
        *write_lock(&self.on_trade) = Some(Arc::new(callback));
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn enqueue(&self, shard: usize, cmd: Command) -> Duration {
        BATCHES.with(|cell| {
            let mut map = cell.borrow_mut();
            let bucket = map
                .entry((self.engine_id, shard))
                .or_insert_with(|| Vec::with_capacity(BATCH_PRODUCER));
            bucket.push(cmd);
            if bucket.len() >= BATCH_PRODUCER {
                self.push_bucket(shard, bucket)
            } else {
                Duration::ZERO
            }
        })
    }

    /// Hand a whole bucket to the shard queue, spin-yielding through
    /// backpressure. Returns the time spent waiting.
    fn push_bucket(&self, shard: usize, bucket: &mut Vec<Command>) -> Duration {
        let state = &self.shards[shard];
        let mut waited = Duration::ZERO;
        if !state.queue.push_batch(bucket) {
            let start = Instant::now();
            loop {
                thread::yield_now();
                if state.queue.push_batch(bucket) {
                    break;
                }
            }
            waited = start.elapsed();
        }
        state.submitted.fetch_add(bucket.len() as u64, Ordering::Release);
        bucket.clear();
        waited
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}

#[inline]
fn lookup_book(books: &[Option<SharedBook>], symbol_id: SymbolId) -> Option<&SharedBook> {
    if symbol_id < 0 {
        return None;
    }
    books.get(symbol_id as usize)?.as_ref()
}

fn worker_loop(
    shard_id: usize,
    state: &ShardState,
    on_trade: &RwLock<Option<TradeCallback>>,
    core: Option<core_affinity::CoreId>,
) {
    // Best effort only; a platform without affinity support still works.
    if let Some(core) = core {
        core_affinity::set_for_current(core);
    }
    debug!(shard_id, "shard worker running");

    let mut local: Vec<Command> = Vec::with_capacity(BATCH_CONSUMER);
    let mut scratch: Vec<Trade> = Vec::with_capacity(1024);

    loop {
        local.clear();
        let n = state.queue.pop_batch(&mut local, BATCH_CONSUMER);
        if n == 0 {
            thread::yield_now();
            continue;
        }

        let mut stop = false;
        {
            let books = read_lock(&state.books);
            for cmd in &local {
                match *cmd {
                    Command::Add(ref order) => {
                        if let Some(book) = lookup_book(&books, order.symbol_id) {
                            match_order(&mut write_lock(book), order, &mut scratch);
                        }
                    }
                    Command::Cancel {
                        symbol_id,
                        order_id,
                    } => {
                        if let Some(book) = lookup_book(&books, symbol_id) {
                            write_lock(book).cancel_order(order_id);
                        }
                    }
                    Command::Reset => {
                        for book in books.iter().flatten() {
                            write_lock(book).reset();
                        }
                    }
                    Command::Stop => {
                        stop = true;
                        break;
                    }
                }
            }
        }

        // One callback per drained batch, whatever it matched.
        if !scratch.is_empty() {
            let callback = read_lock(on_trade).clone();
            if let Some(callback) = callback {
                callback(&scratch);
            }
            scratch.clear();
        }

        state.processed.fetch_add(n as u64, Ordering::Release);
        if stop {
            break;
        }
    }
    debug!(shard_id, "shard worker exited");
}
