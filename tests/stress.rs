//! Multi-producer stress: volume through the batched submission path,
//! cancels racing fills, and conservation of quantity per symbol.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;

use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

use flashex::{Engine, Order, Side, SymbolId, MAX_PRICE};

const PRICE_LO: i64 = 9_000;
const PRICE_HI: i64 = 11_000;

fn resting_total(engine: &Engine, symbol: SymbolId) -> u64 {
    let book = engine.get_order_book(symbol).expect("registered");
    let book = book.read().unwrap();
    let snap = book.snapshot(MAX_PRICE as usize);
    snap.bids.iter().map(|&(_, q)| q).sum::<u64>() + snap.asks.iter().map(|&(_, q)| q).sum::<u64>()
}

/// Every submitted lot of a valid limit order ends up resting or traded
/// (once on the maker side, once on the taker side), per symbol, no matter
/// how many producers interleave.
#[test]
fn conservation_across_producers() {
    const PRODUCERS: u64 = 4;
    const ORDERS_PER_PRODUCER: u64 = 50_000;

    let engine = Arc::new(Engine::new(2));
    let traded: Arc<Mutex<HashMap<SymbolId, u64>>> = Arc::new(Mutex::new(HashMap::new()));
    {
        let traded = Arc::clone(&traded);
        engine.set_trade_callback(move |trades| {
            let mut traded = traded.lock().unwrap();
            for t in trades {
                *traded.entry(t.symbol_id).or_default() += t.quantity as u64;
            }
        });
    }

    let symbols: Vec<SymbolId> = ["ALFA", "BRVO", "CHLI", "DLTA"]
        .iter()
        .map(|name| engine.register_symbol(name, -1))
        .collect();

    let handles: Vec<_> = (0..PRODUCERS)
        .map(|producer| {
            let engine = Arc::clone(&engine);
            let symbols = symbols.clone();
            thread::spawn(move || {
                let mut rng = ChaCha8Rng::seed_from_u64(producer);
                let mut submitted: HashMap<SymbolId, u64> = HashMap::new();
                for i in 0..ORDERS_PER_PRODUCER {
                    let id = producer * ORDERS_PER_PRODUCER + i + 1;
                    let symbol = symbols[rng.gen_range(0..symbols.len())];
                    let side = if rng.gen_bool(0.5) { Side::Buy } else { Side::Sell };
                    let price = rng.gen_range(PRICE_LO..PRICE_HI);
                    let qty = rng.gen_range(1u32..200);
                    engine.submit_order(&Order::limit(id, symbol, side, price, qty));
                    *submitted.entry(symbol).or_default() += qty as u64;
                }
                engine.flush();
                submitted
            })
        })
        .collect();

    let mut submitted: HashMap<SymbolId, u64> = HashMap::new();
    for handle in handles {
        for (symbol, qty) in handle.join().expect("producer panicked") {
            *submitted.entry(symbol).or_default() += qty;
        }
    }
    engine.quiesce();

    let traded = traded.lock().unwrap();
    for &symbol in &symbols {
        let resting = resting_total(&engine, symbol);
        let traded = traded.get(&symbol).copied().unwrap_or(0);
        let submitted = submitted.get(&symbol).copied().unwrap_or(0);
        assert_eq!(
            submitted,
            resting + 2 * traded,
            "quantity leak on symbol {symbol}"
        );
    }
    drop(traded);
    engine.stop();
}

/// Cancels and market orders racing fills from other producers: the engine
/// must stay uncrossed per book and every emitted trade must be sane.
#[test]
fn churn_with_cancels_and_markets() {
    const PRODUCERS: u64 = 4;
    const OPS_PER_PRODUCER: u64 = 30_000;

    let engine = Arc::new(Engine::new(4));
    let trades = Arc::new(Mutex::new(Vec::new()));
    {
        let sink = Arc::clone(&trades);
        engine.set_trade_callback(move |batch| {
            sink.lock().unwrap().extend_from_slice(batch);
        });
    }

    let symbols: Vec<SymbolId> = ["ALFA", "BRVO"]
        .iter()
        .map(|name| engine.register_symbol(name, -1))
        .collect();

    let handles: Vec<_> = (0..PRODUCERS)
        .map(|producer| {
            let engine = Arc::clone(&engine);
            let symbols = symbols.clone();
            thread::spawn(move || {
                let mut rng = ChaCha8Rng::seed_from_u64(1_000 + producer);
                let mut my_orders: Vec<(SymbolId, u64)> = Vec::new();
                for i in 0..OPS_PER_PRODUCER {
                    let symbol = symbols[rng.gen_range(0..symbols.len())];
                    match rng.gen_range(0..10) {
                        0..=5 => {
                            let id = producer * OPS_PER_PRODUCER + i + 1;
                            let side =
                                if rng.gen_bool(0.5) { Side::Buy } else { Side::Sell };
                            let price = rng.gen_range(PRICE_LO..PRICE_HI);
                            let qty = rng.gen_range(1u32..100);
                            engine.submit_order(&Order::limit(id, symbol, side, price, qty));
                            my_orders.push((symbol, id));
                        }
                        6 => {
                            let id = producer * OPS_PER_PRODUCER + i + 1;
                            let side =
                                if rng.gen_bool(0.5) { Side::Buy } else { Side::Sell };
                            let qty = rng.gen_range(1u32..100);
                            engine.submit_order(&Order::market(id, symbol, side, qty));
                        }
                        _ => {
                            if let Some(&(symbol, id)) =
                                my_orders.get(rng.gen_range(0..my_orders.len().max(1)))
                            {
                                engine.cancel_order(symbol, id);
                            }
                        }
                    }
                }
                engine.flush();
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("producer panicked");
    }
    engine.quiesce();

    let trades = trades.lock().unwrap();
    for t in trades.iter() {
        assert!(t.quantity > 0);
        assert!((PRICE_LO..PRICE_HI).contains(&t.price));
        assert!(symbols.contains(&t.symbol_id));
    }
    drop(trades);

    for &symbol in &symbols {
        let book = engine.get_order_book(symbol).unwrap();
        let book = book.read().unwrap();
        let best_ask = book.next_ask(0);
        let best_bid = book.next_bid(MAX_PRICE - 1);
        let bids_empty = best_bid == 0 && book.depth(Side::Buy, 0).1 == 0;
        assert!(
            bids_empty || best_ask == MAX_PRICE || best_bid < best_ask,
            "book {symbol} is crossed"
        );
    }
    engine.stop();
}

/// Reset brings every shard back to a clean slate between rounds.
#[test]
fn reset_between_rounds() {
    let engine = Arc::new(Engine::new(2));
    let symbols: Vec<SymbolId> = ["ALFA", "BRVO", "CHLI"]
        .iter()
        .map(|name| engine.register_symbol(name, -1))
        .collect();

    for round in 0..5u64 {
        let mut rng = ChaCha8Rng::seed_from_u64(round);
        for i in 0..5_000u64 {
            let id = round * 1_000_000 + i + 1;
            let symbol = symbols[rng.gen_range(0..symbols.len())];
            let side = if rng.gen_bool(0.5) { Side::Buy } else { Side::Sell };
            engine.submit_order(&Order::limit(
                id,
                symbol,
                side,
                rng.gen_range(PRICE_LO..PRICE_HI),
                rng.gen_range(1u32..100),
            ));
        }
        engine.reset();

        for &symbol in &symbols {
            assert_eq!(resting_total(&engine, symbol), 0, "round {round}");
            let book = engine.get_order_book(symbol).unwrap();
            assert_eq!(book.read().unwrap().order_count(), 0);
        }
    }
    engine.stop();
}
