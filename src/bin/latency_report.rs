//! Latency and throughput report.
//!
//! Part 1 times the bare match path (book + matcher, no queues) per
//! command and prints an HdrHistogram quantile table. Part 2 pushes a
//! large order stream through the full sharded engine from several
//! producer threads and reports end-to-end throughput.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use hdrhistogram::Histogram;

use flashex::{match_order, Engine, Order, OrderBook, Side, Trade};

const BOOK_ITERATIONS: u64 = 1_000_000;
const ENGINE_ORDERS_PER_PRODUCER: u64 = 500_000;
const ENGINE_PRODUCERS: u64 = 4;

fn book_latency() {
    println!("=== Match path latency ({BOOK_ITERATIONS} ops) ===");

    let mut book = OrderBook::new();
    let mut trades: Vec<Trade> = Vec::with_capacity(64);
    let mut histogram = Histogram::<u64>::new_with_bounds(1, 1_000_000, 3)
        .expect("histogram bounds are static");

    // Warm the pool, the id index, and the branch predictor.
    for i in 0..10_000u64 {
        let side = if i % 2 == 0 { Side::Buy } else { Side::Sell };
        let price = 9_950 + (i % 100) as i64;
        match_order(&mut book, &Order::limit(i, 0, side, price, 10), &mut trades);
        trades.clear();
    }

    let mut next_id = 10_000u64;
    let started = Instant::now();
    for i in 0..BOOK_ITERATIONS {
        let side = if i % 2 == 0 { Side::Buy } else { Side::Sell };
        let price = 9_950 + (i % 100) as i64;
        let order = Order::limit(next_id, 0, side, price, 10);
        next_id += 1;

        let t0 = Instant::now();
        match_order(&mut book, &order, &mut trades);
        let elapsed = t0.elapsed();

        std::hint::black_box(&trades);
        trades.clear();
        let _ = histogram.record(elapsed.as_nanos() as u64);
    }
    let total = started.elapsed();

    println!(
        "Throughput: {:.2}M ops/sec",
        BOOK_ITERATIONS as f64 / total.as_secs_f64() / 1e6
    );
    println!("Min:    {:6} ns", histogram.min());
    println!("P50:    {:6} ns", histogram.value_at_quantile(0.50));
    println!("P90:    {:6} ns", histogram.value_at_quantile(0.90));
    println!("P99:    {:6} ns", histogram.value_at_quantile(0.99));
    println!("P99.9:  {:6} ns", histogram.value_at_quantile(0.999));
    println!("Max:    {:6} ns", histogram.max());
}

fn engine_throughput() {
    let total_orders = ENGINE_ORDERS_PER_PRODUCER * ENGINE_PRODUCERS;
    println!("\n=== Engine throughput ({ENGINE_PRODUCERS} producers, {total_orders} orders) ===");

    let engine = Arc::new(Engine::new(0));
    let traded = Arc::new(AtomicU64::new(0));
    {
        let traded = Arc::clone(&traded);
        engine.set_trade_callback(move |trades| {
            traded.fetch_add(trades.len() as u64, Ordering::Relaxed);
        });
    }

    let symbols: Vec<_> = ["BTC-USD", "ETH-USD", "SOL-USD", "DOGE-USD"]
        .iter()
        .map(|name| engine.register_symbol(name, -1))
        .collect();

    let started = Instant::now();
    let producers: Vec<_> = (0..ENGINE_PRODUCERS)
        .map(|producer| {
            let engine = Arc::clone(&engine);
            let symbols = symbols.clone();
            std::thread::spawn(move || {
                let mut state = producer.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
                for i in 0..ENGINE_ORDERS_PER_PRODUCER {
                    // xorshift keeps the generator off the hot path.
                    state ^= state << 13;
                    state ^= state >> 7;
                    state ^= state << 17;

                    let id = producer * ENGINE_ORDERS_PER_PRODUCER + i + 1;
                    let symbol = symbols[(state % symbols.len() as u64) as usize];
                    let side = if state & 8 == 0 { Side::Buy } else { Side::Sell };
                    let price = 9_900 + (state % 200) as i64;
                    let qty = 1 + (state % 100) as u32;
                    engine.submit_order(&Order::limit(id, symbol, side, price, qty));
                }
                engine.flush();
            })
        })
        .collect();

    for producer in producers {
        let _ = producer.join();
    }
    engine.quiesce();
    let elapsed = started.elapsed();
    engine.stop();

    println!(
        "Throughput: {:.2}M orders/sec",
        total_orders as f64 / elapsed.as_secs_f64() / 1e6
    );
    println!("Trades:     {}", traded.load(Ordering::Relaxed));
    println!("Elapsed:    {:.3}s", elapsed.as_secs_f64());
}

fn main() {
    book_latency();
    engine_throughput();
}
