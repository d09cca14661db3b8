//! Per-symbol order book over a dense price grid.
//!
//! Every price tick owns a singly linked FIFO of order nodes (head/tail
//! index pairs into the shared [`NodePool`]); two [`PriceBitset`]s summarise
//! which ticks hold active orders so best-price discovery is a word scan
//! rather than a grid walk. Cancellation tombstones the node in place and
//! leaves reclamation to the matcher.
//!
//! Exactly one thread mutates a book at a time (the owning shard worker);
//! the structure itself is single-threaded.

use crate::arena::{NodePool, OrderNode, NULL_INDEX};
use crate::bitset::PriceBitset;
use crate::command::{Order, OrderId, Price, Quantity, Side, MAX_PRICE};

const INITIAL_POOL_CAPACITY: usize = 4096;
const INITIAL_ID_CAPACITY: usize = 1024;

/// Aggregated top-of-book view, best levels first on both sides. Level
/// quantities are summed in 64 bits since a level can hold many orders.
#[derive(Clone, Debug, Default)]
pub struct BookSnapshot {
    pub bids: Vec<(Price, u64)>,
    pub asks: Vec<(Price, u64)>,
}

/// A single symbol's resting orders.
///
/// `best_bid`/`best_ask` are maintained monotonically on add and left stale
/// on cancel and fill; they are hints, and the authoritative values are
/// re-derived through [`OrderBook::next_bid`] / [`OrderBook::next_ask`].
pub struct OrderBook {
    bid_heads: Vec<i32>,
    ask_heads: Vec<i32>,
    bid_tails: Vec<i32>,
    ask_tails: Vec<i32>,

    // Active (non-tombstoned) orders per level; the masks mirror these.
    bid_active: Vec<u32>,
    ask_active: Vec<u32>,

    bid_mask: PriceBitset,
    ask_mask: PriceBitset,

    best_bid: Price,
    best_ask: Price,

    pool: NodePool,
    id_index: Vec<i32>,
    live: usize,
}

impl OrderBook {
    pub fn new() -> Self {
        let grid = MAX_PRICE as usize;
        Self {
            bid_heads: vec![NULL_INDEX; grid],
            ask_heads: vec![NULL_INDEX; grid],
            bid_tails: vec![NULL_INDEX; grid],
            ask_tails: vec![NULL_INDEX; grid],
            bid_active: vec![0; grid],
            ask_active: vec![0; grid],
            bid_mask: PriceBitset::new(grid),
            ask_mask: PriceBitset::new(grid),
            best_bid: 0,
            best_ask: MAX_PRICE,
            pool: NodePool::with_capacity(INITIAL_POOL_CAPACITY),
            id_index: vec![NULL_INDEX; INITIAL_ID_CAPACITY],
            live: 0,
        }
    }

    // ========================================================================
    // Resting orders
    // ========================================================================

    /// Append `order` to the tail of its `(side, price)` level.
    ///
    /// Orders priced outside `[0, MAX_PRICE)` are dropped silently. The
    /// caller is responsible for id uniqueness among live orders; the
    /// matcher rejects duplicates before they reach this point.
    pub fn add_order(&mut self, order: &Order) {
        if order.price < 0 || order.price >= MAX_PRICE {
            return;
        }
        let p = order.price as usize;
        let idx = self.pool.alloc(*order);

        match order.side {
            Side::Buy => {
                if self.bid_heads[p] == NULL_INDEX {
                    self.bid_heads[p] = idx;
                } else {
                    let tail = self.bid_tails[p];
                    self.pool.node_mut(tail).next = idx;
                }
                self.bid_tails[p] = idx;
                self.bid_active[p] += 1;
                self.bid_mask.set(p);
                if order.price > self.best_bid {
                    self.best_bid = order.price;
                }
            }
            Side::Sell => {
                if self.ask_heads[p] == NULL_INDEX {
                    self.ask_heads[p] = idx;
                } else {
                    let tail = self.ask_tails[p];
                    self.pool.node_mut(tail).next = idx;
                }
                self.ask_tails[p] = idx;
                self.ask_active[p] += 1;
                self.ask_mask.set(p);
                if order.price < self.best_ask {
                    self.best_ask = order.price;
                }
            }
        }

        self.index_order(order.id, idx);
        self.live += 1;
    }

    /// Tombstone the order with `order_id`, if live.
    ///
    /// The node is not spliced out; the matcher frees it the next time it
    /// surfaces at the head of its level. The best-price hints are left
    /// stale on purpose.
    pub fn cancel_order(&mut self, order_id: OrderId) {
        let Some(idx) = self.lookup(order_id) else {
            return;
        };
        let (p, side) = {
            let node = self.pool.node_mut(idx);
            debug_assert!(node.active);
            node.active = false;
            (node.order.price as usize, node.order.side)
        };
        self.id_index[order_id as usize] = NULL_INDEX;
        self.live -= 1;
        self.retire_at_level(p, side);
    }

    /// Arena index of the live order with `order_id`, if any.
    #[inline]
    pub fn lookup(&self, order_id: OrderId) -> Option<i32> {
        let idx = *self.id_index.get(order_id as usize)?;
        (idx != NULL_INDEX).then_some(idx)
    }

    /// True if an active node for `order_id` is in the book.
    #[inline]
    pub fn is_live(&self, order_id: OrderId) -> bool {
        self.lookup(order_id).is_some()
    }

    /// Remaining quantity of the live order with `order_id`, if any.
    pub fn order_qty(&self, order_id: OrderId) -> Option<Quantity> {
        self.lookup(order_id)
            .map(|idx| self.pool.node(idx).order.quantity)
    }

    /// Number of live (active) orders.
    #[inline]
    pub fn order_count(&self) -> usize {
        self.live
    }

    // ========================================================================
    // Matcher interface
    // ========================================================================

    /// Best-bid hint. Exact after an add, possibly stale-high after removals.
    #[inline]
    pub fn best_bid(&self) -> Price {
        self.best_bid
    }

    /// Best-ask hint. Exact after an add, possibly stale-low after removals.
    #[inline]
    pub fn best_ask(&self) -> Price {
        self.best_ask
    }

    /// Highest occupied bid tick at or below `start`; `0` on miss.
    ///
    /// A return of `0` is ambiguous between "level at zero" and "no bids";
    /// callers disambiguate via `order_head(0, Side::Buy)`.
    #[inline]
    pub fn next_bid(&self, start: Price) -> Price {
        debug_assert!(start >= 0);
        let p = self.bid_mask.find_first_set_down(start as usize);
        if p == MAX_PRICE as usize {
            0
        } else {
            p as Price
        }
    }

    /// Lowest occupied ask tick at or above `start`; `MAX_PRICE` on miss.
    #[inline]
    pub fn next_ask(&self, start: Price) -> Price {
        debug_assert!(start >= 0);
        self.ask_mask.find_first_set(start as usize) as Price
    }

    /// Head node index of the `(price, side)` level, or `NULL_INDEX`.
    #[inline]
    pub fn order_head(&self, price: Price, side: Side) -> i32 {
        let p = price as usize;
        match side {
            Side::Buy => self.bid_heads[p],
            Side::Sell => self.ask_heads[p],
        }
    }

    /// Re-point the head of a level after the matcher consumed its front.
    /// Draining the list (`new_head == NULL_INDEX`) also resets the tail
    /// and clears the occupancy bit.
    #[inline]
    pub fn set_order_head(&mut self, price: Price, side: Side, new_head: i32) {
        let p = price as usize;
        match side {
            Side::Buy => {
                self.bid_heads[p] = new_head;
                if new_head == NULL_INDEX {
                    self.bid_tails[p] = NULL_INDEX;
                    self.bid_mask.clear(p);
                }
            }
            Side::Sell => {
                self.ask_heads[p] = new_head;
                if new_head == NULL_INDEX {
                    self.ask_tails[p] = NULL_INDEX;
                    self.ask_mask.clear(p);
                }
            }
        }
    }

    #[inline]
    pub fn node(&self, idx: i32) -> &OrderNode {
        self.pool.node(idx)
    }

    #[inline]
    pub fn node_mut(&mut self, idx: i32) -> &mut OrderNode {
        self.pool.node_mut(idx)
    }

    /// Tombstone a fully filled maker and unhook it from the id index.
    pub fn mark_filled(&mut self, idx: i32) {
        let (id, p, side) = {
            let node = self.pool.node_mut(idx);
            debug_assert!(node.active);
            debug_assert_eq!(node.order.quantity, 0);
            node.active = false;
            (node.order.id, node.order.price as usize, node.order.side)
        };
        if let Some(slot) = self.id_index.get_mut(id as usize) {
            if *slot == idx {
                *slot = NULL_INDEX;
            }
        }
        self.live -= 1;
        self.retire_at_level(p, side);
    }

    /// Return a node's slot to the pool freelist.
    #[inline]
    pub fn free_node(&mut self, idx: i32) {
        self.pool.free(idx);
    }

    // ========================================================================
    // Observation
    // ========================================================================

    /// Active quantity and order count resting at one level.
    pub fn depth(&self, side: Side, price: Price) -> (u64, u32) {
        if !(0..MAX_PRICE).contains(&price) {
            return (0, 0);
        }
        let mut qty = 0u64;
        let mut count = 0u32;
        let mut idx = self.order_head(price, side);
        while idx != NULL_INDEX {
            let node = self.pool.node(idx);
            if node.active {
                qty += node.order.quantity as u64;
                count += 1;
            }
            idx = node.next;
        }
        (qty, count)
    }

    /// Aggregate the top `depth` levels per side, best first.
    pub fn snapshot(&self, depth: usize) -> BookSnapshot {
        let mut snap = BookSnapshot::default();
        let grid = MAX_PRICE as usize;

        let mut p = self.bid_mask.find_first_set_down(grid - 1);
        while p != grid && snap.bids.len() < depth {
            let (qty, _) = self.depth(Side::Buy, p as Price);
            if qty > 0 {
                snap.bids.push((p as Price, qty));
            }
            if p == 0 {
                break;
            }
            p = self.bid_mask.find_first_set_down(p - 1);
        }

        let mut p = self.ask_mask.find_first_set(0);
        while p != grid && snap.asks.len() < depth {
            let (qty, _) = self.depth(Side::Sell, p as Price);
            if qty > 0 {
                snap.asks.push((p as Price, qty));
            }
            p = self.ask_mask.find_first_set(p + 1);
        }

        snap
    }

    /// Empty the book in O(grid) without releasing pool capacity.
    pub fn reset(&mut self) {
        self.bid_heads.fill(NULL_INDEX);
        self.ask_heads.fill(NULL_INDEX);
        self.bid_tails.fill(NULL_INDEX);
        self.ask_tails.fill(NULL_INDEX);
        self.bid_active.fill(0);
        self.ask_active.fill(0);
        self.bid_mask.clear_all();
        self.ask_mask.clear_all();
        self.best_bid = 0;
        self.best_ask = MAX_PRICE;
        self.pool.clear();
        self.id_index.fill(NULL_INDEX);
        self.live = 0;
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn index_order(&mut self, id: OrderId, idx: i32) {
        let slot = id as usize;
        if slot >= self.id_index.len() {
            let grown = (slot + 1).max(self.id_index.len() * 2);
            self.id_index.resize(grown, NULL_INDEX);
        }
        self.id_index[slot] = idx;
    }

    /// One active order left a level; clear the occupancy bit if it was the
    /// last. Tombstoned nodes may linger in the list after the bit drops.
    fn retire_at_level(&mut self, p: usize, side: Side) {
        match side {
            Side::Buy => {
                debug_assert!(self.bid_active[p] > 0);
                self.bid_active[p] -= 1;
                if self.bid_active[p] == 0 {
                    self.bid_mask.clear(p);
                }
            }
            Side::Sell => {
                debug_assert!(self.ask_active[p] > 0);
                self.ask_active[p] -= 1;
                if self.ask_active[p] == 0 {
                    self.ask_mask.clear(p);
                }
            }
        }
    }

    /// True iff the occupancy bit for every level matches the presence of
    /// at least one active node in its list. Test support.
    #[cfg(test)]
    fn masks_consistent(&self) -> bool {
        for p in 0..MAX_PRICE {
            let (_, bid_count) = self.depth(Side::Buy, p);
            if self.bid_mask.test(p as usize) != (bid_count > 0) {
                return false;
            }
            let (_, ask_count) = self.depth(Side::Sell, p);
            if self.ask_mask.test(p as usize) != (ask_count > 0) {
                return false;
            }
        }
        true
    }
}

impl Default for OrderBook {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for OrderBook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderBook")
            .field("best_bid", &self.best_bid)
            .field("best_ask", &self.best_ask)
            .field("live", &self.live)
            .field("pool_in_use", &self.pool.in_use())
            .finish()
    }
}
