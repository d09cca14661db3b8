//! Price-time priority matching.
//!
//! The matcher walks the opposite side of the book from the best price
//! outward, consuming level FIFOs front-to-back and appending [`Trade`]s to
//! the caller's buffer. Tombstoned nodes encountered at a level head are
//! evicted and their slots returned to the pool before any price or
//! quantity logic runs against them.

use crate::arena::NULL_INDEX;
use crate::book::OrderBook;
use crate::command::{Order, OrderType, Price, Side, Trade, MAX_PRICE};

/// Match `order` against `book`, appending executions to `trades`.
///
/// On return, a limit order with remaining quantity has been added to the
/// book; a market order's remainder is dropped (immediate-or-cancel).
/// Orders that would violate book invariants are absorbed with no effect:
/// a duplicate of a live order id, or a limit price off the grid.
pub fn match_order(book: &mut OrderBook, order: &Order, trades: &mut Vec<Trade>) {
    if book.is_live(order.id) {
        return;
    }

    let mut incoming = *order;
    match incoming.kind {
        // A market order is maximally aggressive and never rests.
        OrderType::Market => {
            incoming.price = match incoming.side {
                Side::Buy => MAX_PRICE - 1,
                Side::Sell => 0,
            };
        }
        OrderType::Limit => {
            if incoming.price < 0 || incoming.price >= MAX_PRICE {
                return;
            }
        }
    }

    match incoming.side {
        Side::Buy => match_buy(book, &mut incoming, trades),
        Side::Sell => match_sell(book, &mut incoming, trades),
    }

    if incoming.quantity > 0 && incoming.kind == OrderType::Limit {
        book.add_order(&incoming);
    }
}

/// Consume the head of the `(price, maker_side)` level against `incoming`.
/// Returns once the level is exhausted or the incoming order is filled.
#[inline]
fn sweep_level(book: &mut OrderBook, incoming: &mut Order, price: Price, trades: &mut Vec<Trade>) {
    let maker_side = incoming.side.opposite();
    loop {
        let head = book.order_head(price, maker_side);
        if head == NULL_INDEX {
            return;
        }

        let next = book.node(head).next;
        if !book.node(head).active {
            // Lazily reclaim a cancelled maker.
            book.set_order_head(price, maker_side, next);
            book.free_node(head);
            continue;
        }

        let maker = book.node(head).order;
        let qty = incoming.quantity.min(maker.quantity);
        trades.push(Trade {
            symbol_id: incoming.symbol_id,
            price: maker.price,
            quantity: qty,
            maker_order_id: maker.id,
            taker_order_id: incoming.id,
        });

        book.node_mut(head).order.quantity -= qty;
        incoming.quantity -= qty;

        if book.node(head).order.quantity == 0 {
            book.mark_filled(head);
            book.set_order_head(price, maker_side, next);
            book.free_node(head);
        }
        if incoming.quantity == 0 {
            return;
        }
    }
}

fn match_buy(book: &mut OrderBook, incoming: &mut Order, trades: &mut Vec<Trade>) {
    let mut p = book.next_ask(book.best_ask());
    while incoming.quantity > 0 && p < MAX_PRICE {
        if p > incoming.price {
            break;
        }
        sweep_level(book, incoming, p, trades);
        if incoming.quantity == 0 {
            break;
        }
        p = book.next_ask(p + 1);
    }
}

fn match_sell(book: &mut OrderBook, incoming: &mut Order, trades: &mut Vec<Trade>) {
    let mut p = book.best_bid();
    while incoming.quantity > 0 {
        p = book.next_bid(p);
        // next_bid returns 0 both for a level at zero and for an empty
        // side; an empty head at tick zero distinguishes the two.
        if p == 0 && book.order_head(0, Side::Buy) == NULL_INDEX {
            break;
        }
        if p < incoming.price {
            break;
        }
        sweep_level(book, incoming, p, trades);
        if incoming.quantity == 0 || p == 0 {
            break;
        }
        p -= 1;
    }
}
