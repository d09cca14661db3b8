//! End-to-end engine scenarios: one shard, programmatic surface only,
//! trades observed through the callback and book state through the shared
//! book handles.

use std::sync::{Arc, Mutex};

use flashex::{Engine, Order, Side, SymbolId, Trade, MAX_PRICE};

fn engine_with_sink(symbols: &[&str]) -> (Engine, Arc<Mutex<Vec<Trade>>>, Vec<SymbolId>) {
    let engine = Engine::new(1);
    let trades = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&trades);
    engine.set_trade_callback(move |batch| {
        sink.lock().unwrap().extend_from_slice(batch);
    });
    let ids = symbols
        .iter()
        .map(|name| engine.register_symbol(name, -1))
        .collect();
    (engine, trades, ids)
}

fn collected(trades: &Arc<Mutex<Vec<Trade>>>) -> Vec<Trade> {
    trades.lock().unwrap().clone()
}

fn trade(s: SymbolId, price: i64, quantity: u32, maker: u64, taker: u64) -> Trade {
    Trade {
        symbol_id: s,
        price,
        quantity,
        maker_order_id: maker,
        taker_order_id: taker,
    }
}

#[test]
fn full_match() {
    let (engine, trades, ids) = engine_with_sink(&["TEST"]);
    let s = ids[0];

    engine.submit_order(&Order::limit(1, s, Side::Sell, 10_000, 10));
    engine.submit_order(&Order::limit(2, s, Side::Buy, 10_000, 10));
    engine.quiesce();

    assert_eq!(collected(&trades), vec![trade(s, 10_000, 10, 1, 2)]);

    let book = engine.get_order_book(s).unwrap();
    let book = book.read().unwrap();
    assert_eq!(book.order_count(), 0);
    assert_eq!(book.next_ask(0), MAX_PRICE);
    assert_eq!(book.next_bid(MAX_PRICE - 1), 0);
}

#[test]
fn partial_match() {
    let (engine, trades, ids) = engine_with_sink(&["TEST"]);
    let s = ids[0];

    engine.submit_order(&Order::limit(1, s, Side::Sell, 10_000, 20));
    engine.submit_order(&Order::limit(2, s, Side::Buy, 10_000, 10));
    engine.quiesce();

    assert_eq!(collected(&trades), vec![trade(s, 10_000, 10, 1, 2)]);

    let book = engine.get_order_book(s).unwrap();
    let book = book.read().unwrap();
    assert_eq!(book.order_count(), 1);
    assert_eq!(book.order_qty(1), Some(10));
    assert_eq!(book.depth(Side::Sell, 10_000), (10, 1));
}

#[test]
fn no_match_when_prices_do_not_cross() {
    let (engine, trades, ids) = engine_with_sink(&["TEST"]);
    let s = ids[0];

    engine.submit_order(&Order::limit(1, s, Side::Sell, 10_100, 10));
    engine.submit_order(&Order::limit(2, s, Side::Buy, 10_000, 10));
    engine.quiesce();

    assert!(collected(&trades).is_empty());

    let book = engine.get_order_book(s).unwrap();
    let book = book.read().unwrap();
    assert_eq!(book.order_qty(1), Some(10));
    assert_eq!(book.order_qty(2), Some(10));
    assert_eq!(book.order_count(), 2);
}

#[test]
fn cancel_then_no_match() {
    let (engine, trades, ids) = engine_with_sink(&["TEST"]);
    let s = ids[0];

    engine.submit_order(&Order::limit(1, s, Side::Sell, 10_000, 10));
    engine.cancel_order(s, 1);
    engine.submit_order(&Order::limit(2, s, Side::Buy, 10_000, 10));
    engine.quiesce();

    assert!(collected(&trades).is_empty());

    let book = engine.get_order_book(s).unwrap();
    let book = book.read().unwrap();
    assert!(!book.is_live(1));
    assert_eq!(book.order_qty(2), Some(10));
    assert_eq!(book.order_count(), 1);
    assert_eq!(book.depth(Side::Buy, 10_000), (10, 1));
    assert_eq!(book.next_ask(0), MAX_PRICE);
}

#[test]
fn market_order_fully_fills() {
    let (engine, trades, ids) = engine_with_sink(&["TEST"]);
    let s = ids[0];

    engine.submit_order(&Order::limit(1, s, Side::Sell, 10_000, 10));
    engine.submit_order(&Order::market(2, s, Side::Buy, 10));
    engine.quiesce();

    assert_eq!(collected(&trades), vec![trade(s, 10_000, 10, 1, 2)]);

    let book = engine.get_order_book(s).unwrap();
    assert_eq!(book.read().unwrap().order_count(), 0);
}

#[test]
fn market_order_partial_fill_drops_remainder() {
    let (engine, trades, ids) = engine_with_sink(&["TEST"]);
    let s = ids[0];

    engine.submit_order(&Order::limit(1, s, Side::Sell, 10_000, 10));
    engine.submit_order(&Order::market(2, s, Side::Buy, 20));
    engine.quiesce();

    assert_eq!(collected(&trades), vec![trade(s, 10_000, 10, 1, 2)]);

    // The unfilled 10 lots vanish; nothing rests on either side.
    let book = engine.get_order_book(s).unwrap();
    let book = book.read().unwrap();
    assert_eq!(book.order_count(), 0);
    assert!(!book.is_live(2));
    assert_eq!(book.next_bid(MAX_PRICE - 1), 0);
}

#[test]
fn symbols_are_isolated() {
    let (engine, trades, ids) = engine_with_sink(&["AAPL", "GOOG"]);
    let (aapl, goog) = (ids[0], ids[1]);

    engine.submit_order(&Order::limit(1, aapl, Side::Sell, 15_000, 100));
    engine.submit_order(&Order::limit(2, goog, Side::Buy, 15_000, 100));
    engine.submit_order(&Order::limit(3, aapl, Side::Buy, 15_000, 50));
    engine.quiesce();

    assert_eq!(collected(&trades), vec![trade(aapl, 15_000, 50, 1, 3)]);

    let aapl_book = engine.get_order_book(aapl).unwrap();
    assert_eq!(aapl_book.read().unwrap().order_qty(1), Some(50));

    let goog_book = engine.get_order_book(goog).unwrap();
    assert_eq!(goog_book.read().unwrap().order_qty(2), Some(100));
}

#[test]
fn fifo_at_one_price() {
    let (engine, trades, ids) = engine_with_sink(&["TEST"]);
    let s = ids[0];

    engine.submit_order(&Order::limit(1, s, Side::Sell, 100, 5));
    engine.submit_order(&Order::limit(2, s, Side::Sell, 100, 5));
    engine.submit_order(&Order::limit(3, s, Side::Buy, 100, 10));
    engine.quiesce();

    assert_eq!(
        collected(&trades),
        vec![trade(s, 100, 5, 1, 3), trade(s, 100, 5, 2, 3)]
    );
    let book = engine.get_order_book(s).unwrap();
    assert_eq!(book.read().unwrap().order_count(), 0);
}
