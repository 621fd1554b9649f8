//! Order Book Engine - reconstructs per-symbol depth from sequenced
//! add/modify/delete events.
//!
//! Bids: descending (highest first). Asks: ascending (lowest first).
//! Each level keeps its resting orders in arrival order (price-time
//! priority, FIFO within a level). The book is mutated only through
//! [`OrderBook::apply`]; accessors return owned snapshots and never block
//! the apply path.

use crate::error::{Error, Result};
use crate::types::{BookEvent, BookOrderId, Px, Qty, Side, SnapshotLevel, Symbol};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, VecDeque};

/// Book health. Quoting is allowed only while `Live`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookStatus {
    Live,
    /// Sequence gap observed; events are dropped until a snapshot arrives.
    Stale,
    /// Bid crossed ask after a valid apply; fatal until a fresh snapshot.
    Corrupt,
}

/// One exchange order resting at a price level.
#[derive(Debug, Clone, PartialEq)]
struct RestingOrder {
    id: BookOrderId,
    qty: Qty,
}

/// All resting orders at a single price, FIFO in arrival order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriceLevel {
    total: u64,
    orders: VecDeque<RestingOrder>,
}

impl PriceLevel {
    /// Aggregate resting quantity. Always equals the sum of constituents.
    pub fn qty(&self) -> Qty {
        Qty(self.total)
    }

    pub fn order_count(&self) -> usize {
        self.orders.len()
    }

    fn push_back(&mut self, id: BookOrderId, qty: Qty) {
        self.total += qty.0;
        self.orders.push_back(RestingOrder { id, qty });
    }

    fn remove(&mut self, id: BookOrderId) -> Option<Qty> {
        let pos = self.orders.iter().position(|o| o.id == id)?;
        let removed = self.orders.remove(pos)?;
        self.total -= removed.qty.0;
        Some(removed.qty)
    }

    fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }
}

/// In-memory L3 book for a single symbol.
pub struct OrderBook {
    symbol: Symbol,
    bids: BTreeMap<Px, PriceLevel>,
    asks: BTreeMap<Px, PriceLevel>,
    /// Arena-style index: order ref -> (side, price). Cross-component
    /// references are id lookups, never ownership transfer.
    lookup: HashMap<BookOrderId, (Side, Px)>,
    seq: u64,
    status: BookStatus,
}

impl OrderBook {
    pub fn new(symbol: Symbol) -> Self {
        Self {
            symbol,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            lookup: HashMap::new(),
            seq: 0,
            status: BookStatus::Live,
        }
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn status(&self) -> BookStatus {
        self.status
    }

    pub fn is_live(&self) -> bool {
        self.status == BookStatus::Live
    }

    /// Apply one sequenced event.
    ///
    /// Preconditions: `event.seq == self.seq + 1`, except `Snapshot` which
    /// may set any seq and replaces full state. Old or duplicate seqs are
    /// ignored (idempotent). A gap marks the book `Stale` and returns
    /// `SequenceGap` so the caller can request a resync; subsequent
    /// non-snapshot events are dropped until the snapshot lands.
    pub fn apply(&mut self, event: BookEvent) -> Result<()> {
        if let BookEvent::Snapshot { levels, seq } = event {
            self.rebuild(levels, seq);
            return self.check_crossed();
        }

        if self.status != BookStatus::Live {
            tracing::trace!(symbol = %self.symbol, seq = event.seq(), "dropping event while awaiting snapshot");
            return Ok(());
        }

        let seq = event.seq();
        if seq <= self.seq {
            // Redelivered or stale event: applying it twice must yield the
            // same book as applying it once.
            tracing::trace!(symbol = %self.symbol, seq, book_seq = self.seq, "ignoring old seq");
            return Ok(());
        }
        if seq > self.seq + 1 {
            self.status = BookStatus::Stale;
            return Err(Error::SequenceGap {
                symbol: self.symbol.clone(),
                expected: self.seq + 1,
                got: seq,
            });
        }

        match event {
            BookEvent::Add {
                order_ref,
                side,
                px,
                qty,
                ..
            } => self.add(order_ref, side, px, qty),
            BookEvent::Modify {
                order_ref, new_qty, ..
            } => self.modify(order_ref, new_qty),
            BookEvent::Delete { order_ref, .. } => {
                self.delete(order_ref);
            }
            BookEvent::Trade {
                order_ref,
                exec_qty,
                ..
            } => self.trade(order_ref, exec_qty),
            BookEvent::Snapshot { .. } => unreachable!("handled above"),
        }

        self.seq = seq;
        self.check_crossed()
    }

    fn rebuild(&mut self, levels: Vec<SnapshotLevel>, seq: u64) {
        self.bids.clear();
        self.asks.clear();
        self.lookup.clear();
        for level in levels {
            for (id, qty) in level.orders {
                self.add(id, level.side, level.px, qty);
            }
        }
        self.seq = seq;
        self.status = BookStatus::Live;
        tracing::debug!(symbol = %self.symbol, seq, "book rebuilt from snapshot");
    }

    fn add(&mut self, id: BookOrderId, side: Side, px: Px, qty: Qty) {
        // Duplicate ref is rare but must not corrupt level totals.
        if self.lookup.contains_key(&id) {
            self.delete(id);
        }
        self.side_mut(side).entry(px).or_default().push_back(id, qty);
        self.lookup.insert(id, (side, px));
    }

    fn modify(&mut self, id: BookOrderId, new_qty: Qty) {
        let Some(&(side, px)) = self.lookup.get(&id) else {
            return;
        };
        if new_qty.is_zero() {
            self.delete(id);
            return;
        }
        let Some(level) = self.side_mut(side).get_mut(&px) else {
            return;
        };
        let Some(pos) = level.orders.iter().position(|o| o.id == id) else {
            return;
        };
        let old = level.orders[pos].qty;
        if new_qty <= old {
            // Decrease in place: queue position preserved.
            level.orders[pos].qty = new_qty;
            level.total -= old.0 - new_qty.0;
        } else {
            // Increase loses time priority: delete + re-add at the back.
            level.remove(id);
            level.push_back(id, new_qty);
        }
    }

    fn delete(&mut self, id: BookOrderId) -> Option<Qty> {
        let (side, px) = self.lookup.remove(&id)?;
        let book_side = self.side_mut(side);
        let level = book_side.get_mut(&px)?;
        let removed = level.remove(id);
        if level.is_empty() {
            book_side.remove(&px);
        }
        removed
    }

    fn trade(&mut self, id: BookOrderId, exec: Qty) {
        let Some(&(side, px)) = self.lookup.get(&id) else {
            return;
        };
        let fully_consumed = {
            let Some(level) = self.side_mut(side).get_mut(&px) else {
                return;
            };
            let Some(pos) = level.orders.iter().position(|o| o.id == id) else {
                return;
            };
            let remaining = level.orders[pos].qty;
            if exec < remaining {
                level.orders[pos].qty = Qty(remaining.0 - exec.0);
                level.total -= exec.0;
                false
            } else {
                true
            }
        };
        if fully_consumed {
            self.delete(id);
        }
    }

    fn side_mut(&mut self, side: Side) -> &mut BTreeMap<Px, PriceLevel> {
        match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        }
    }

    fn check_crossed(&mut self) -> Result<()> {
        if let (Some((bid, _)), Some((ask, _))) = (self.top(Side::Buy), self.top(Side::Sell)) {
            if bid >= ask {
                self.status = BookStatus::Corrupt;
                return Err(Error::BookCorrupt {
                    symbol: self.symbol.clone(),
                    bid: bid.0,
                    ask: ask.0,
                });
            }
        }
        Ok(())
    }

    // Raw top-of-book regardless of status; used internally for the
    // crossed-book check.
    fn top(&self, side: Side) -> Option<(Px, Qty)> {
        match side {
            Side::Buy => self.bids.iter().next_back(),
            Side::Sell => self.asks.iter().next(),
        }
        .map(|(px, level)| (*px, level.qty()))
    }

    /// Best bid (price, aggregate qty). `None` while Stale or Corrupt.
    pub fn best_bid(&self) -> Option<(Px, Qty)> {
        self.is_live().then(|| self.top(Side::Buy)).flatten()
    }

    /// Best ask (price, aggregate qty). `None` while Stale or Corrupt.
    pub fn best_ask(&self) -> Option<(Px, Qty)> {
        self.is_live().then(|| self.top(Side::Sell)).flatten()
    }

    /// Mid price in Decimal ticks.
    pub fn mid(&self) -> Option<Decimal> {
        let (bid, _) = self.best_bid()?;
        let (ask, _) = self.best_ask()?;
        Some((bid.as_decimal() + ask.as_decimal()) / Decimal::from(2))
    }

    /// Top `n` levels of one side as owned (price, qty) pairs, best first.
    /// Empty while Stale or Corrupt.
    pub fn depth(&self, side: Side, n: usize) -> Vec<(Px, Qty)> {
        if !self.is_live() {
            return Vec::new();
        }
        match side {
            Side::Buy => self
                .bids
                .iter()
                .rev()
                .take(n)
                .map(|(px, l)| (*px, l.qty()))
                .collect(),
            Side::Sell => self
                .asks
                .iter()
                .take(n)
                .map(|(px, l)| (*px, l.qty()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add(seq: u64, id: u64, side: Side, px: i64, qty: u64) -> BookEvent {
        BookEvent::Add {
            order_ref: BookOrderId(id),
            side,
            px: Px(px),
            qty: Qty(qty),
            seq,
        }
    }

    fn book() -> OrderBook {
        OrderBook::new(Symbol::new("NVDA"))
    }

    #[test]
    fn add_and_top_of_book() {
        let mut b = book();
        b.apply(add(1, 1, Side::Buy, 10_000, 500)).unwrap();
        b.apply(add(2, 2, Side::Sell, 10_002, 300)).unwrap();
        b.apply(add(3, 3, Side::Buy, 9_999, 200)).unwrap();

        assert_eq!(b.best_bid(), Some((Px(10_000), Qty(500))));
        assert_eq!(b.best_ask(), Some((Px(10_002), Qty(300))));
        assert_eq!(b.mid(), Some(Decimal::from(10_001)));
        assert_eq!(
            b.depth(Side::Buy, 5),
            vec![(Px(10_000), Qty(500)), (Px(9_999), Qty(200))]
        );
    }

    #[test]
    fn level_qty_is_sum_of_orders() {
        let mut b = book();
        b.apply(add(1, 1, Side::Buy, 10_000, 500)).unwrap();
        b.apply(add(2, 2, Side::Buy, 10_000, 250)).unwrap();
        assert_eq!(b.best_bid(), Some((Px(10_000), Qty(750))));
    }

    #[test]
    fn modify_decrease_keeps_priority() {
        let mut b = book();
        b.apply(add(1, 1, Side::Sell, 10_002, 100)).unwrap();
        b.apply(add(2, 2, Side::Sell, 10_002, 200)).unwrap();
        b.apply(BookEvent::Modify {
            order_ref: BookOrderId(1),
            new_qty: Qty(50),
            seq: 3,
        })
        .unwrap();

        let level = b.asks.get(&Px(10_002)).unwrap();
        assert_eq!(level.orders[0].id, BookOrderId(1));
        assert_eq!(level.orders[0].qty, Qty(50));
        assert_eq!(level.qty(), Qty(250));
    }

    #[test]
    fn modify_increase_loses_priority() {
        let mut b = book();
        b.apply(add(1, 1, Side::Sell, 10_002, 100)).unwrap();
        b.apply(add(2, 2, Side::Sell, 10_002, 200)).unwrap();
        b.apply(BookEvent::Modify {
            order_ref: BookOrderId(1),
            new_qty: Qty(150),
            seq: 3,
        })
        .unwrap();

        let level = b.asks.get(&Px(10_002)).unwrap();
        assert_eq!(level.orders[0].id, BookOrderId(2));
        assert_eq!(level.orders[1].id, BookOrderId(1));
        assert_eq!(level.qty(), Qty(350));
    }

    #[test]
    fn delete_removes_empty_level() {
        let mut b = book();
        b.apply(add(1, 1, Side::Buy, 10_000, 500)).unwrap();
        b.apply(BookEvent::Delete {
            order_ref: BookOrderId(1),
            seq: 2,
        })
        .unwrap();
        assert!(b.best_bid().is_none());
        assert!(b.bids.is_empty());
    }

    #[test]
    fn trade_decrements_in_place_and_removes_at_zero() {
        let mut b = book();
        b.apply(add(1, 1, Side::Buy, 10_000, 500)).unwrap();
        b.apply(BookEvent::Trade {
            order_ref: BookOrderId(1),
            exec_qty: Qty(200),
            seq: 2,
        })
        .unwrap();
        assert_eq!(b.best_bid(), Some((Px(10_000), Qty(300))));

        b.apply(BookEvent::Trade {
            order_ref: BookOrderId(1),
            exec_qty: Qty(300),
            seq: 3,
        })
        .unwrap();
        assert!(b.best_bid().is_none());
    }

    #[test]
    fn duplicate_seq_is_idempotent() {
        let mut b = book();
        b.apply(add(1, 1, Side::Buy, 10_000, 500)).unwrap();
        // Same event redelivered: must not double the level.
        b.apply(add(1, 1, Side::Buy, 10_000, 500)).unwrap();
        assert_eq!(b.best_bid(), Some((Px(10_000), Qty(500))));
        assert_eq!(b.seq(), 1);
    }

    #[test]
    fn gap_marks_stale_and_snapshot_recovers() {
        let mut b = book();
        b.apply(add(1, 1, Side::Buy, 10_000, 500)).unwrap();
        b.apply(add(2, 2, Side::Sell, 10_002, 300)).unwrap();

        // Gap at 3; 4 arrives first.
        let err = b.apply(add(4, 3, Side::Buy, 9_999, 100)).unwrap_err();
        assert!(matches!(err, Error::SequenceGap { expected: 3, got: 4, .. }));
        assert_eq!(b.status(), BookStatus::Stale);
        // Reads are suppressed while stale.
        assert!(b.best_bid().is_none());
        assert!(b.depth(Side::Sell, 5).is_empty());

        // Events during the gap window are dropped without error.
        b.apply(add(5, 4, Side::Buy, 9_998, 100)).unwrap();
        assert_eq!(b.seq(), 2);

        // Snapshot at seq >= the gap restores service.
        b.apply(BookEvent::Snapshot {
            levels: vec![
                SnapshotLevel {
                    side: Side::Buy,
                    px: Px(10_000),
                    orders: vec![(BookOrderId(10), Qty(400))],
                },
                SnapshotLevel {
                    side: Side::Sell,
                    px: Px(10_003),
                    orders: vec![(BookOrderId(11), Qty(250))],
                },
            ],
            seq: 6,
        })
        .unwrap();
        assert_eq!(b.status(), BookStatus::Live);
        assert_eq!(b.seq(), 6);
        assert_eq!(b.best_bid(), Some((Px(10_000), Qty(400))));
        assert_eq!(b.best_ask(), Some((Px(10_003), Qty(250))));
    }

    #[test]
    fn crossed_book_marks_corrupt() {
        let mut b = book();
        b.apply(add(1, 1, Side::Buy, 10_000, 500)).unwrap();
        let err = b.apply(add(2, 2, Side::Sell, 9_999, 300)).unwrap_err();
        assert!(matches!(err, Error::BookCorrupt { .. }));
        assert_eq!(b.status(), BookStatus::Corrupt);
        assert!(b.best_bid().is_none());

        // Only a fresh snapshot restores the symbol.
        b.apply(BookEvent::Snapshot { levels: vec![], seq: 10 }).unwrap();
        assert_eq!(b.status(), BookStatus::Live);
    }

    #[test]
    fn best_bid_below_best_ask_across_sequence() {
        let mut b = book();
        let events = vec![
            add(1, 1, Side::Buy, 10_000, 500),
            add(2, 2, Side::Sell, 10_005, 300),
            add(3, 3, Side::Buy, 10_001, 100),
            BookEvent::Modify {
                order_ref: BookOrderId(3),
                new_qty: Qty(50),
                seq: 4,
            },
            add(5, 4, Side::Sell, 10_003, 200),
            BookEvent::Delete {
                order_ref: BookOrderId(1),
                seq: 6,
            },
        ];
        for ev in events {
            b.apply(ev).unwrap();
            if let (Some((bid, _)), Some((ask, _))) = (b.best_bid(), b.best_ask()) {
                assert!(bid < ask, "book crossed: {} >= {}", bid, ask);
            }
        }
    }
}
