//! Domain types shared across the engine.
//!
//! Orders and commands are plain `Copy` structs so that batches can move
//! through the shard queues as raw slot writes with no per-item allocation.

/// Price in ticks. The tick scale is fixed by the caller; the engine only
/// ever sees integers on the grid `[0, MAX_PRICE)`.
pub type Price = i64;

/// Remaining or traded quantity.
pub type Quantity = u32;

/// Engine-assigned order identifier. Monotonic but not necessarily dense.
pub type OrderId = u64;

/// Dense symbol identifier assigned at registration.
pub type SymbolId = i32;

/// Upper bound (exclusive) of the price grid.
pub const MAX_PRICE: Price = 100_000;

/// Order side.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Side {
    Buy = 0,
    Sell = 1,
}

impl Side {
    /// Returns the opposite side.
    #[inline]
    pub const fn opposite(self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

/// Order type. Market orders never rest: any unfilled remainder is dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum OrderType {
    #[default]
    Limit = 0,
    Market = 1,
}

/// An order as submitted by a producer.
///
/// A market order's `price` is ignored; the matcher substitutes the
/// most-aggressive tick on the grid before walking the opposite side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Order {
    pub id: OrderId,
    pub client_order_id: u64,
    pub symbol_id: SymbolId,
    pub side: Side,
    pub kind: OrderType,
    pub price: Price,
    pub quantity: Quantity,
}

impl Order {
    /// Create a limit order.
    #[inline]
    pub const fn limit(
        id: OrderId,
        symbol_id: SymbolId,
        side: Side,
        price: Price,
        quantity: Quantity,
    ) -> Self {
        Self {
            id,
            client_order_id: 0,
            symbol_id,
            side,
            kind: OrderType::Limit,
            price,
            quantity,
        }
    }

    /// Create a market order. The price field carries no meaning.
    #[inline]
    pub const fn market(id: OrderId, symbol_id: SymbolId, side: Side, quantity: Quantity) -> Self {
        Self {
            id,
            client_order_id: 0,
            symbol_id,
            side,
            kind: OrderType::Market,
            price: 0,
            quantity,
        }
    }

    /// Attach a client-assigned correlation id.
    #[inline]
    pub const fn with_client_id(mut self, client_order_id: u64) -> Self {
        self.client_order_id = client_order_id;
        self
    }
}

/// One execution. The maker is the resting order, the taker the incoming
/// one; the trade prints at the maker's price.
///
/// Field order matches the in-process wire layout:
/// `symbol_id:i32, price:i64, quantity:u32, maker:u64, taker:u64`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Trade {
    pub symbol_id: SymbolId,
    pub price: Price,
    pub quantity: Quantity,
    pub maker_order_id: OrderId,
    pub taker_order_id: OrderId,
}

/// Commands consumed by a shard worker, in queue order.
#[derive(Clone, Copy, Debug)]
pub enum Command {
    /// Match an incoming order against the book, resting any limit remainder.
    Add(Order),
    /// Best-effort cancel; a no-op if the order is gone or already filled.
    Cancel {
        symbol_id: SymbolId,
        order_id: OrderId,
    },
    /// Empty every book on the shard. Testing and benchmarks only.
    Reset,
    /// Drain preceding commands, flush pending trades, then exit the worker.
    Stop,
}
