//! Line-oriented TCP front-end.
//!
//! A thin adapter over the engine's programmatic surface: one request per
//! line, one reply per line, plus asynchronous `TRADE` pushes to
//! subscribers. One OS thread per connection; the engine does the real
//! work, so the front-end stays dumb on purpose.
//!
//! ```text
//! BUY <sym> <qty> <px> [clientId]   -> ORDER_ACCEPTED_ASYNC <id>
//! SELL <sym> <qty> <px> [clientId]  -> ORDER_ACCEPTED_ASYNC <id>
//! CANCEL <sym> <orderId>            -> CANCEL_REQUEST_SENT
//! SUBSCRIBE <sym>                   -> SUBSCRIBED <sym>
//! GET_BOOK <sym>                    -> BOOK <sym> BIDS <px> <qty>.. ASKS ..
//! anything else                     -> UNKNOWN_COMMAND
//! ```

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::command::{Order, Price, Quantity, Side, SymbolId};
use crate::engine::Engine;

/// Levels per side returned by `GET_BOOK`.
const BOOK_DEPTH: usize = 20;

/// Front-end failures that terminate `serve`.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// A malformed or unrecognised request line.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("unknown command")]
    UnknownCommand,
    #[error("missing {0}")]
    MissingArgument(&'static str),
    #[error("invalid {0}")]
    InvalidArgument(&'static str),
}

/// A parsed request line.
#[derive(Debug, PartialEq, Eq)]
enum Request<'a> {
    Order {
        side: Side,
        symbol: &'a str,
        quantity: Quantity,
        price: Price,
        client_id: u64,
    },
    Cancel {
        symbol: &'a str,
        order_id: u64,
    },
    Subscribe {
        symbol: &'a str,
    },
    GetBook {
        symbol: &'a str,
    },
}

fn parse_request(line: &str) -> Result<Request<'_>, RequestError> {
    let mut words = line.split_whitespace();
    let command = words.next().ok_or(RequestError::UnknownCommand)?;

    fn arg<'a>(
        words: &mut impl Iterator<Item = &'a str>,
        name: &'static str,
    ) -> Result<&'a str, RequestError> {
        words.next().ok_or(RequestError::MissingArgument(name))
    }
    fn num<T: std::str::FromStr>(word: &str, name: &'static str) -> Result<T, RequestError> {
        word.parse().map_err(|_| RequestError::InvalidArgument(name))
    }

    match command {
        "BUY" | "SELL" => {
            let symbol = arg(&mut words, "symbol")?;
            let quantity = num(arg(&mut words, "quantity")?, "quantity")?;
            let price = num(arg(&mut words, "price")?, "price")?;
            let client_id = match words.next() {
                Some(word) => num(word, "clientId")?,
                None => 0,
            };
            Ok(Request::Order {
                side: if command == "BUY" { Side::Buy } else { Side::Sell },
                symbol,
                quantity,
                price,
                client_id,
            })
        }
        "CANCEL" => Ok(Request::Cancel {
            symbol: arg(&mut words, "symbol")?,
            order_id: num(arg(&mut words, "orderId")?, "orderId")?,
        }),
        "SUBSCRIBE" => Ok(Request::Subscribe {
            symbol: arg(&mut words, "symbol")?,
        }),
        "GET_BOOK" => Ok(Request::GetBook {
            symbol: arg(&mut words, "symbol")?,
        }),
        _ => Err(RequestError::UnknownCommand),
    }
}

type Subscribers = Arc<Mutex<FxHashMap<SymbolId, Vec<TcpStream>>>>;

/// TCP front-end over an [`Engine`].
pub struct TcpServer {
    engine: Arc<Engine>,
    subscribers: Subscribers,
    // Mirror of id -> name for the broadcast path, so the trade callback
    // does not need to hold the engine (and keep it alive) itself.
    symbol_names: Arc<Mutex<FxHashMap<SymbolId, String>>>,
    next_order_id: AtomicU64,
}

impl TcpServer {
    /// Wrap `engine` and install the trade-broadcast callback.
    pub fn new(engine: Arc<Engine>) -> Arc<Self> {
        let server = Arc::new(Self {
            engine,
            subscribers: Arc::new(Mutex::new(FxHashMap::default())),
            symbol_names: Arc::new(Mutex::new(FxHashMap::default())),
            next_order_id: AtomicU64::new(1),
        });

        let subscribers = Arc::clone(&server.subscribers);
        let names = Arc::clone(&server.symbol_names);
        server.engine.set_trade_callback(move |trades| {
            broadcast_trades(&subscribers, &names, trades);
        });
        server
    }

    /// Bind `port` on all interfaces and serve until the listener fails.
    pub fn run(self: Arc<Self>, port: u16) -> Result<(), ServerError> {
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        self.serve(listener)
    }

    /// Serve an already-bound listener, one thread per connection.
    pub fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), ServerError> {
        info!(addr = %listener.local_addr()?, "front-end listening");
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let server = Arc::clone(&self);
                    thread::spawn(move || server.handle_client(stream));
                }
                Err(err) => warn!(%err, "accept failed"),
            }
        }
        Ok(())
    }

    fn handle_client(&self, stream: TcpStream) {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "?".to_owned());
        debug!(%peer, "client connected");

        let reader = match stream.try_clone() {
            Ok(clone) => BufReader::new(clone),
            Err(err) => {
                warn!(%peer, %err, "failed to clone client stream");
                return;
            }
        };
        let mut writer = stream;

        for line in reader.lines() {
            let line = match line {
                Ok(line) => line,
                Err(_) => break,
            };
            if line.trim().is_empty() {
                continue;
            }
            let reply = self.process_request(&line, &writer);
            if writer.write_all(reply.as_bytes()).is_err() {
                break;
            }
        }
        debug!(%peer, "client disconnected");
    }

    /// Handle one request line and produce the reply line.
    fn process_request(&self, line: &str, stream: &TcpStream) -> String {
        let request = match parse_request(line) {
            Ok(request) => request,
            Err(err) => {
                debug!(%err, line, "rejected request");
                return "UNKNOWN_COMMAND\n".to_owned();
            }
        };

        match request {
            Request::Order {
                side,
                symbol,
                quantity,
                price,
                client_id,
            } => {
                let symbol_id = self.resolve_symbol(symbol);
                let order_id = self.next_order_id.fetch_add(1, Ordering::Relaxed);
                let order =
                    Order::limit(order_id, symbol_id, side, price, quantity).with_client_id(client_id);
                self.engine.submit_order(&order);
                // The front-end is request/reply; latency beats batching here.
                self.engine.flush();
                format!("ORDER_ACCEPTED_ASYNC {order_id}\n")
            }
            Request::Cancel { symbol, order_id } => {
                if let Some(symbol_id) = self.engine.symbol_id(symbol) {
                    self.engine.cancel_order(symbol_id, order_id);
                    self.engine.flush();
                }
                "CANCEL_REQUEST_SENT\n".to_owned()
            }
            Request::Subscribe { symbol } => {
                let symbol_id = self.resolve_symbol(symbol);
                match stream.try_clone() {
                    Ok(clone) => {
                        lock(&self.subscribers)
                            .entry(symbol_id)
                            .or_default()
                            .push(clone);
                        format!("SUBSCRIBED {symbol}\n")
                    }
                    Err(err) => {
                        warn!(%err, "failed to clone subscriber stream");
                        "UNKNOWN_COMMAND\n".to_owned()
                    }
                }
            }
            Request::GetBook { symbol } => {
                let Some(book) = self
                    .engine
                    .symbol_id(symbol)
                    .and_then(|id| self.engine.get_order_book(id))
                else {
                    return "ERROR_NO_BOOK\n".to_owned();
                };
                let snap = book
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .snapshot(BOOK_DEPTH);

                let mut reply = format!("BOOK {symbol} BIDS");
                for (price, qty) in &snap.bids {
                    reply.push_str(&format!(" {price} {qty}"));
                }
                reply.push_str(" ASKS");
                for (price, qty) in &snap.asks {
                    reply.push_str(&format!(" {price} {qty}"));
                }
                reply.push('\n');
                reply
            }
        }
    }

    /// Symbol id for `name`, registering it on first use.
    fn resolve_symbol(&self, name: &str) -> SymbolId {
        if let Some(id) = self.engine.symbol_id(name) {
            return id;
        }
        let id = self.engine.register_symbol(name, -1);
        lock(&self.symbol_names).insert(id, name.to_owned());
        id
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Push `TRADE <sym> <px> <qty>` lines to every subscriber of each trade's
/// symbol, dropping subscribers whose sockets have gone away.
fn broadcast_trades(
    subscribers: &Subscribers,
    names: &Arc<Mutex<FxHashMap<SymbolId, String>>>,
    trades: &[crate::command::Trade],
) {
    let mut subscribers = lock(subscribers);
    let names = lock(names);
    for trade in trades {
        let Some(streams) = subscribers.get_mut(&trade.symbol_id) else {
            continue;
        };
        let Some(symbol) = names.get(&trade.symbol_id) else {
            continue;
        };
        let message = format!("TRADE {} {} {}\n", symbol, trade.price, trade.quantity);
        streams.retain_mut(|stream| stream.write_all(message.as_bytes()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn parses_order_requests() {
        assert_eq!(
            parse_request("BUY BTC-USD 100 10000"),
            Ok(Request::Order {
                side: Side::Buy,
                symbol: "BTC-USD",
                quantity: 100,
                price: 10_000,
                client_id: 0,
            })
        );
        assert_eq!(
            parse_request("SELL ETH 5 999 77"),
            Ok(Request::Order {
                side: Side::Sell,
                symbol: "ETH",
                quantity: 5,
                price: 999,
                client_id: 77,
            })
        );
    }

    #[test]
    fn parses_control_requests() {
        assert_eq!(
            parse_request("CANCEL BTC 42"),
            Ok(Request::Cancel {
                symbol: "BTC",
                order_id: 42
            })
        );
        assert_eq!(
            parse_request("SUBSCRIBE BTC"),
            Ok(Request::Subscribe { symbol: "BTC" })
        );
        assert_eq!(
            parse_request("GET_BOOK BTC"),
            Ok(Request::GetBook { symbol: "BTC" })
        );
    }

    #[test]
    fn rejects_malformed_requests() {
        assert_eq!(parse_request(""), Err(RequestError::UnknownCommand));
        assert_eq!(parse_request("HELLO"), Err(RequestError::UnknownCommand));
        assert_eq!(
            parse_request("BUY BTC"),
            Err(RequestError::MissingArgument("quantity"))
        );
        assert_eq!(
            parse_request("BUY BTC ten 5"),
            Err(RequestError::InvalidArgument("quantity"))
        );
        assert_eq!(
            parse_request("CANCEL BTC abc"),
            Err(RequestError::InvalidArgument("orderId"))
        );
    }

    fn read_line(reader: &mut impl BufRead) -> String {
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        line
    }

    #[test]
    fn end_to_end_session() {
        let engine = Arc::new(Engine::new(1));
        let server = TcpServer::new(Arc::clone(&engine));

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        {
            let server = Arc::clone(&server);
            thread::spawn(move || {
                let _ = server.serve(listener);
            });
        }

        // Subscriber connection.
        let sub = TcpStream::connect(addr).unwrap();
        sub.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut sub_reader = BufReader::new(sub.try_clone().unwrap());
        let mut sub_writer = sub;
        sub_writer.write_all(b"SUBSCRIBE TEST\n").unwrap();
        assert_eq!(read_line(&mut sub_reader), "SUBSCRIBED TEST\n");

        // Trading connection.
        let conn = TcpStream::connect(addr).unwrap();
        conn.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut reader = BufReader::new(conn.try_clone().unwrap());
        let mut writer = conn;

        writer.write_all(b"SELL TEST 10 10000\n").unwrap();
        let reply = read_line(&mut reader);
        assert!(reply.starts_with("ORDER_ACCEPTED_ASYNC "), "{reply}");

        writer.write_all(b"BUY TEST 4 10000\n").unwrap();
        let reply = read_line(&mut reader);
        assert!(reply.starts_with("ORDER_ACCEPTED_ASYNC "), "{reply}");

        // The cross must reach the subscriber.
        assert_eq!(read_line(&mut sub_reader), "TRADE TEST 10000 4\n");

        // Remaining 6 lots rest on the ask side.
        engine.quiesce();
        writer.write_all(b"GET_BOOK TEST\n").unwrap();
        assert_eq!(read_line(&mut reader), "BOOK TEST BIDS ASKS 10000 6\n");

        writer.write_all(b"CANCEL TEST 1\n").unwrap();
        assert_eq!(read_line(&mut reader), "CANCEL_REQUEST_SENT\n");

        writer.write_all(b"GET_BOOK NOPE\n").unwrap();
        assert_eq!(read_line(&mut reader), "ERROR_NO_BOOK\n");

        writer.write_all(b"GIBBERISH 1 2 3\n").unwrap();
        assert_eq!(read_line(&mut reader), "UNKNOWN_COMMAND\n");

        engine.stop();
    }
}
