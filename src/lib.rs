//! # Flashex
//!
//! A deterministic, sharded, multi-symbol limit order matching engine.
//!
//! ## Design Principles
//!
//! - **Single-Writer Books**: each symbol is pinned to one shard worker, so
//!   the matcher never takes a contended lock
//! - **Dense Price Grid**: O(1) level access, best-price discovery by
//!   bitset word scans
//! - **Arena Nodes**: 32-bit indices, freelist reuse, no allocation in the
//!   match loop
//! - **Batched Submission**: producers hand 256-command batches to bounded
//!   ring queues; backpressure is spin-yield, never a kernel wait
//!
//! ## Architecture
//!
//! ```text
//! [Producer Threads] --batches--> [Ring Queue] --> [Shard Worker (pinned)]
//!                                   (per shard)        |         |
//!                                                  [Books]   [Trade Callback]
//! ```

pub mod arena;
pub mod bitset;
pub mod book;
pub mod command;
pub mod engine;
pub mod matching;
pub mod queue;
pub mod server;

// Re-exports for convenience
pub use arena::{NodePool, OrderNode, NULL_INDEX};
pub use bitset::PriceBitset;
pub use book::{BookSnapshot, OrderBook};
pub use command::{Command, Order, OrderId, OrderType, Price, Quantity, Side, SymbolId, Trade, MAX_PRICE};
pub use engine::{Engine, BATCH_CONSUMER, BATCH_PRODUCER};
pub use matching::match_order;
pub use queue::RingBuffer;
pub use server::TcpServer;
