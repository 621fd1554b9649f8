//! Position & Risk Ledger - live position, exposure, and PnL per symbol,
//! plus the synchronized cross-symbol exposure accumulator.
//!
//! The per-symbol ledger is mutated only on confirmed fills, inside that
//! symbol's lane. The global accumulator is the one piece of shared mutable
//! state between lanes; its read-check-write is atomic under a single lock.

use crate::types::{Px, Qty, Side, Symbol};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;

/// Immutable view of a ledger at an evaluation instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LedgerSnapshot {
    pub position: i64,
    pub avg_entry: Decimal,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub gross_exposure: Decimal,
}

/// Per-symbol position ledger.
pub struct PositionLedger {
    symbol: Symbol,
    /// Signed net position: buys increase, sells decrease.
    position: i64,
    /// Volume-weighted average entry price, in Decimal ticks. Meaningful
    /// only while `position != 0`; reset to the trade price on a sign flip.
    avg_entry: Decimal,
    realized: Decimal,
    unrealized: Decimal,
    last_mid: Option<Decimal>,
    gross_exposure: Decimal,
}

impl PositionLedger {
    pub fn new(symbol: Symbol) -> Self {
        Self {
            symbol,
            position: 0,
            avg_entry: Decimal::ZERO,
            realized: Decimal::ZERO,
            unrealized: Decimal::ZERO,
            last_mid: None,
            gross_exposure: Decimal::ZERO,
        }
    }

    pub fn position(&self) -> i64 {
        self.position
    }

    pub fn gross_exposure(&self) -> Decimal {
        self.gross_exposure
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            position: self.position,
            avg_entry: self.avg_entry,
            realized_pnl: self.realized,
            unrealized_pnl: self.unrealized,
            gross_exposure: self.gross_exposure,
        }
    }

    /// Apply one confirmed fill. Realizes PnL on any reduction of |position|;
    /// a sign flip re-anchors the entry price at the trade price.
    pub fn on_fill(&mut self, side: Side, px: Px, qty: Qty) {
        let px = px.as_decimal();
        let fill = Decimal::from(qty.0);
        let signed = side.signed(qty);
        let old = self.position;

        if old == 0 || (old > 0) == (signed > 0) {
            // Same-direction add: VWAP the entry.
            let abs_old = Decimal::from(old.unsigned_abs());
            self.avg_entry = (self.avg_entry * abs_old + px * fill) / (abs_old + fill);
            self.position = old + signed;
        } else {
            // Reduction (possibly a flip).
            let closing = qty.0.min(old.unsigned_abs());
            let closing_d = Decimal::from(closing);
            let per_unit = if old > 0 {
                px - self.avg_entry
            } else {
                self.avg_entry - px
            };
            self.realized += per_unit * closing_d;
            self.position = old + signed;

            if self.position == 0 {
                self.avg_entry = Decimal::ZERO;
            } else if (self.position > 0) != (old > 0) {
                // Flipped through zero: remaining quantity entered at px.
                self.avg_entry = px;
            }
        }

        tracing::debug!(
            symbol = %self.symbol,
            %side,
            position = self.position,
            realized = %self.realized,
            "fill applied to ledger"
        );
        self.remark();
    }

    /// Update unrealized PnL and gross exposure from a fresh mid. Does not
    /// change position.
    pub fn mark_to_market(&mut self, mid: Decimal) {
        self.last_mid = Some(mid);
        self.remark();
    }

    fn remark(&mut self) {
        let Some(mid) = self.last_mid else {
            return;
        };
        let pos = Decimal::from(self.position);
        self.unrealized = (mid - self.avg_entry) * pos;
        self.gross_exposure = Decimal::from(self.position.unsigned_abs()) * mid;
    }
}

/// Cross-symbol gross exposure accumulator.
///
/// `committed` is recomputed by each lane from its ledger after fills and
/// marks; `reserved` tracks in-flight order notional held by the OMS from
/// submission until the order reaches a terminal state. The risk gate's
/// exposure check and the OMS's reservation both go through [`try_reserve`]
/// / [`total`] so read-then-check-then-write is atomic.
///
/// [`try_reserve`]: GlobalExposure::try_reserve
/// [`total`]: GlobalExposure::total
#[derive(Default)]
pub struct GlobalExposure {
    inner: Mutex<ExposureInner>,
}

#[derive(Default)]
struct ExposureInner {
    committed: HashMap<Symbol, Decimal>,
    reserved: Decimal,
}

impl GlobalExposure {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Committed + reserved notional across all symbols.
    pub fn total(&self) -> Decimal {
        let inner = self.inner.lock();
        inner.committed.values().copied().sum::<Decimal>() + inner.reserved
    }

    /// Atomically reserve `notional` if the projected total stays within
    /// `max`. Returns false (and reserves nothing) otherwise.
    pub fn try_reserve(&self, notional: Decimal, max: Decimal) -> bool {
        let mut inner = self.inner.lock();
        let committed: Decimal = inner.committed.values().copied().sum();
        if committed + inner.reserved + notional > max {
            return false;
        }
        inner.reserved += notional;
        true
    }

    /// Release previously reserved notional (fill, cancel, reject, timeout).
    pub fn release(&self, notional: Decimal) {
        let mut inner = self.inner.lock();
        inner.reserved = (inner.reserved - notional).max(Decimal::ZERO);
    }

    /// Replace one symbol's committed exposure with the ledger's current value.
    pub fn set_committed(&self, symbol: &Symbol, exposure: Decimal) {
        self.inner.lock().committed.insert(symbol.clone(), exposure);
    }
}
