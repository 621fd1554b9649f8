//! Risk Gate - synchronous pre-trade validation, consulted before any
//! order leaves the system.
//!
//! Checks run in a fixed order with the first failure winning: rate,
//! notional, position, exposure, price collar. Approval is advisory for the
//! instant evaluated and reserves nothing. The OMS's provisional
//! reservation against [`GlobalExposure`] is the final arbiter of in-flight
//! capacity.
//!
//! [`GlobalExposure`]: crate::ledger::GlobalExposure

use crate::config::RiskLimits;
use crate::ledger::{GlobalExposure, LedgerSnapshot};
use crate::types::OrderRequest;
use rust_decimal::Decimal;
use std::collections::VecDeque;
use std::time::Instant;

/// Why the gate refused an order. Expected outcomes, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    RateLimited,
    NotionalExceeded,
    PositionLimit,
    ExposureLimit,
    PriceCollar,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RejectReason::RateLimited => "rate limited",
            RejectReason::NotionalExceeded => "notional exceeded",
            RejectReason::PositionLimit => "position limit",
            RejectReason::ExposureLimit => "exposure limit",
            RejectReason::PriceCollar => "price collar",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Approve,
    Reject(RejectReason),
}

impl Verdict {
    pub fn is_approved(&self) -> bool {
        matches!(self, Verdict::Approve)
    }
}

/// Per-symbol risk gate. Stateless aside from the rate-window counters,
/// which it owns and advances on every evaluation, approved or rejected.
pub struct RiskGate {
    window: VecDeque<Instant>,
}

impl RiskGate {
    pub fn new() -> Self {
        Self {
            window: VecDeque::new(),
        }
    }

    /// Evaluate a candidate order against an immutable limits snapshot.
    ///
    /// `mid` is the current book mid in Decimal ticks; absent a usable mid
    /// (stale/corrupt/empty book) the collar check fails closed.
    pub fn evaluate(
        &mut self,
        candidate: &OrderRequest,
        ledger: &LedgerSnapshot,
        limits: &RiskLimits,
        exposure: &GlobalExposure,
        mid: Option<Decimal>,
        now: Instant,
    ) -> Verdict {
        // 1. Rate: count evaluations for this symbol inside the window.
        let cutoff = now.checked_sub(limits.rate_window()).unwrap_or(now);
        while self.window.front().is_some_and(|t| *t < cutoff) {
            self.window.pop_front();
        }
        let saturated = self.window.len() >= limits.max_order_rate;
        self.window.push_back(now);
        if saturated {
            return Verdict::Reject(RejectReason::RateLimited);
        }

        // 2. Notional.
        let notional = candidate.notional();
        if notional > limits.max_order_notional {
            return Verdict::Reject(RejectReason::NotionalExceeded);
        }

        // 3. Projected position after a full fill. Exactly at the limit is
        // allowed; one unit past is rejected.
        let projected = ledger.position + candidate.side.signed(candidate.qty);
        if projected.unsigned_abs() > limits.max_position {
            return Verdict::Reject(RejectReason::PositionLimit);
        }

        // 4. Projected gross exposure, including in-flight reservations.
        if exposure.total() + notional > limits.max_exposure {
            return Verdict::Reject(RejectReason::ExposureLimit);
        }

        // 5. Price collar relative to the book mid.
        let Some(mid) = mid.filter(|m| *m > Decimal::ZERO) else {
            return Verdict::Reject(RejectReason::PriceCollar);
        };
        let deviation = (candidate.px.as_decimal() - mid).abs() / mid;
        if deviation > limits.price_collar {
            return Verdict::Reject(RejectReason::PriceCollar);
        }

        Verdict::Approve
    }
}

impl Default for RiskGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::types::{Px, Qty, Side, Symbol};
    use std::time::Duration;

    fn limits() -> RiskLimits {
        let mut limits = Config::default().risk;
        limits.max_position = 1_000;
        limits.max_order_notional = Decimal::from(10_000_000);
        limits.max_exposure = Decimal::from(100_000_000);
        limits.max_order_rate = 3;
        limits.rate_window_ms = 1_000;
        limits.price_collar = Decimal::new(1, 2); // 1%
        limits
    }

    fn flat() -> LedgerSnapshot {
        LedgerSnapshot {
            position: 0,
            avg_entry: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            gross_exposure: Decimal::ZERO,
        }
    }

    fn order(side: Side, px: i64, qty: u64) -> OrderRequest {
        OrderRequest {
            symbol: Symbol::new("NVDA"),
            side,
            px: Px(px),
            qty: Qty(qty),
        }
    }

    fn mid() -> Option<Decimal> {
        Some(Decimal::from(10_001))
    }

    #[test]
    fn approves_within_all_limits() {
        let mut gate = RiskGate::new();
        let v = gate.evaluate(
            &order(Side::Buy, 10_000, 100),
            &flat(),
            &limits(),
            &GlobalExposure::new(),
            mid(),
            Instant::now(),
        );
        assert_eq!(v, Verdict::Approve);
    }

    #[test]
    fn position_boundary_exact_allowed_one_past_rejected() {
        // Notional cap lifted above both candidates so the position
        // boundary alone decides the verdict.
        let mut limits = limits();
        limits.max_order_notional = Decimal::from(20_000_000);
        let exposure = GlobalExposure::new();

        let mut gate = RiskGate::new();
        let at_limit = gate.evaluate(
            &order(Side::Buy, 10_000, 1_000),
            &flat(),
            &limits,
            &exposure,
            mid(),
            Instant::now(),
        );
        assert_eq!(at_limit, Verdict::Approve);

        let mut gate = RiskGate::new();
        let past = gate.evaluate(
            &order(Side::Buy, 10_000, 1_001),
            &flat(),
            &limits,
            &exposure,
            mid(),
            Instant::now(),
        );
        assert_eq!(past, Verdict::Reject(RejectReason::PositionLimit));
    }

    #[test]
    fn short_side_position_limit_is_symmetric() {
        let mut gate = RiskGate::new();
        let mut ledger = flat();
        ledger.position = -900;
        let v = gate.evaluate(
            &order(Side::Sell, 10_002, 200),
            &ledger,
            &limits(),
            &GlobalExposure::new(),
            mid(),
            Instant::now(),
        );
        assert_eq!(v, Verdict::Reject(RejectReason::PositionLimit));
    }

    #[test]
    fn notional_check_precedes_position() {
        let mut limits = limits();
        limits.max_order_notional = Decimal::from(1_000);
        let mut gate = RiskGate::new();
        // Violates both notional and position; notional is checked first.
        let v = gate.evaluate(
            &order(Side::Buy, 10_000, 2_000),
            &flat(),
            &limits,
            &GlobalExposure::new(),
            mid(),
            Instant::now(),
        );
        assert_eq!(v, Verdict::Reject(RejectReason::NotionalExceeded));
    }

    #[test]
    fn exposure_includes_reservations() {
        let mut limits = limits();
        limits.max_exposure = Decimal::from(2_000_000);
        let exposure = GlobalExposure::new();
        // In-flight reservation from another symbol's lane.
        assert!(exposure.try_reserve(Decimal::from(1_500_000), limits.max_exposure));

        let mut gate = RiskGate::new();
        let v = gate.evaluate(
            &order(Side::Buy, 10_000, 100), // 1,000,000 notional
            &flat(),
            &limits,
            &exposure,
            mid(),
            Instant::now(),
        );
        assert_eq!(v, Verdict::Reject(RejectReason::ExposureLimit));
    }

    #[test]
    fn collar_rejects_far_from_mid() {
        let mut gate = RiskGate::new();
        // > 1% below mid 10_001.
        let v = gate.evaluate(
            &order(Side::Buy, 9_800, 10),
            &flat(),
            &limits(),
            &GlobalExposure::new(),
            mid(),
            Instant::now(),
        );
        assert_eq!(v, Verdict::Reject(RejectReason::PriceCollar));
    }

    #[test]
    fn collar_fails_closed_without_mid() {
        let mut gate = RiskGate::new();
        let v = gate.evaluate(
            &order(Side::Buy, 10_000, 10),
            &flat(),
            &limits(),
            &GlobalExposure::new(),
            None,
            Instant::now(),
        );
        assert_eq!(v, Verdict::Reject(RejectReason::PriceCollar));
    }

    #[test]
    fn rate_window_counts_rejections_too() {
        let limits = limits(); // max 3 per second
        let mut gate = RiskGate::new();
        let exposure = GlobalExposure::new();
        let t0 = Instant::now();

        // First three evaluations consume the window (one of them rejected
        // by the collar still counts).
        for px in [10_000, 9_000, 10_000] {
            gate.evaluate(&order(Side::Buy, px, 10), &flat(), &limits, &exposure, mid(), t0);
        }
        let v = gate.evaluate(&order(Side::Buy, 10_000, 10), &flat(), &limits, &exposure, mid(), t0);
        assert_eq!(v, Verdict::Reject(RejectReason::RateLimited));

        // Window expiry restores capacity.
        let later = t0 + Duration::from_millis(1_500);
        let v = gate.evaluate(&order(Side::Buy, 10_000, 10), &flat(), &limits, &exposure, mid(), later);
        assert_eq!(v, Verdict::Approve);
    }
}
