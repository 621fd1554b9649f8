//! Inventory-skew market maker.
//!
//! Quotes one bid and one ask around the microprice, skewed against current
//! position. Spread widens with realized volatility and shrinking inventory
//! headroom. Re-quoting is throttled independently of the risk gate's order
//! rate: triggers inside the throttle window are coalesced into the latest
//! computed target rather than queued.

use crate::config::{RiskLimits, StrategyConfig};
use crate::gateway::GatewayCommand;
use crate::ledger::{GlobalExposure, PositionLedger};
use crate::oms::Oms;
use crate::orderbook::OrderBook;
use crate::risk::{RiskGate, Verdict};
use crate::strategy::volatility::EwmaVolatility;
use crate::types::{ClientOrderId, OrderRequest, Px, Qty, Quote, Side};
use std::time::Instant;

pub struct MarketMaker {
    cfg: StrategyConfig,
    vol: EwmaVolatility,
    /// Our working quote ids; the orders themselves live in the OMS arena.
    current_bid: Option<ClientOrderId>,
    current_ask: Option<ClientOrderId>,
    last_action_at: Option<Instant>,
    coalesced: u64,
    risk_rejects: u64,
}

impl MarketMaker {
    pub fn new(cfg: StrategyConfig) -> Self {
        let vol = EwmaVolatility::new(cfg.vol_alpha);
        Self {
            cfg,
            vol,
            current_bid: None,
            current_ask: None,
            last_action_at: None,
            coalesced: 0,
            risk_rejects: 0,
        }
    }

    /// Triggers absorbed by the throttle window since startup.
    pub fn coalesced_count(&self) -> u64 {
        self.coalesced
    }

    /// Quote sides refused by the risk gate since startup. The lane reads
    /// the delta per tick and turns it into metrics.
    pub fn risk_reject_count(&self) -> u64 {
        self.risk_rejects
    }

    /// One decision pass. Invoked on every book change and on the timer
    /// floor. Returns gateway commands to forward; all order state changes
    /// go through the OMS.
    pub fn on_tick(
        &mut self,
        book: &OrderBook,
        ledger: &PositionLedger,
        oms: &mut Oms,
        gate: &mut RiskGate,
        limits: &RiskLimits,
        exposure: &GlobalExposure,
        now: Instant,
    ) -> Vec<GatewayCommand> {
        let mut commands = Vec::new();

        // Quoting requires a live two-sided book; stale/corrupt windows are
        // handled by the lane (halt + cancel-all).
        let Some((bid_px, bid_sz)) = book.best_bid() else {
            return commands;
        };
        let Some((ask_px, ask_sz)) = book.best_ask() else {
            return commands;
        };

        let micro = microprice(bid_px, bid_sz, ask_px, ask_sz);
        self.vol.update((bid_px.0 + ask_px.0) as f64 / 2.0);

        // Throttle with coalescing: the freshest target is recomputed on the
        // next allowed tick, so skipped triggers collapse into it.
        if let Some(last) = self.last_action_at {
            if now.duration_since(last) < self.cfg.requote_interval() {
                self.coalesced += 1;
                return commands;
            }
        }

        let target = self.target_quote(micro, ledger, limits);
        let mut acted = false;
        for side in [Side::Buy, Side::Sell] {
            acted |= self.reconcile_side(
                side,
                target.side(side),
                book,
                ledger,
                oms,
                gate,
                limits,
                exposure,
                now,
                &mut commands,
            );
        }
        if acted {
            self.last_action_at = Some(now);
        }
        commands
    }

    /// Desired quote before risk vetting. Either side may already be
    /// suppressed here by the hard inventory limit.
    fn target_quote(
        &self,
        micro: f64,
        ledger: &PositionLedger,
        limits: &RiskLimits,
    ) -> Quote {
        let position = ledger.position();
        let max_pos = limits.max_position.max(1) as f64;
        let inv_frac = (position as f64 / max_pos).clamp(-1.0, 1.0);

        // Long inventory skews quotes lower to encourage selling;
        // symmetric for short.
        let skew = -inv_frac * self.cfg.max_skew_ticks as f64;
        let fair = micro + skew;

        // Volatility is a per-update return stdev; express it in bps so the
        // sensitivity knob works on a human scale.
        let vol_widening = 1.0 + self.cfg.vol_sensitivity * self.vol.sigma() * 10_000.0;
        let inv_widening = 1.0 + self.cfg.inventory_sensitivity * inv_frac.abs();
        let half = (self.cfg.base_half_spread_ticks as f64 * vol_widening * inv_widening)
            .clamp(
                self.cfg.min_half_spread_ticks as f64,
                self.cfg.max_half_spread_ticks as f64,
            );

        let bid_px = Px((fair - half).floor() as i64);
        let ask_px = Px((fair + half).ceil() as i64);
        let size = Qty(self.cfg.quote_size);

        // Quote only in directions that keep the projected position inside
        // the hard limit; the risk gate re-checks this with the live ledger.
        let bid_ok = position + size.0 as i64 <= limits.max_position as i64;
        let ask_ok = position - (size.0 as i64) >= -(limits.max_position as i64);

        Quote {
            bid: bid_ok.then_some((bid_px, size)),
            ask: ask_ok.then_some((ask_px, size)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn reconcile_side(
        &mut self,
        side: Side,
        target: Option<(Px, Qty)>,
        book: &OrderBook,
        ledger: &PositionLedger,
        oms: &mut Oms,
        gate: &mut RiskGate,
        limits: &RiskLimits,
        exposure: &GlobalExposure,
        now: Instant,
        commands: &mut Vec<GatewayCommand>,
    ) -> bool {
        // Resolve the working order for this side; drop stale ids.
        let current = self.current_order(side);
        let working = current
            .and_then(|id| oms.get(&id))
            .filter(|o| !o.state.is_terminal())
            .map(|o| (o.id, o.px, o.remaining_qty));
        if working.is_none() {
            self.set_current(side, None);
        }

        let Some((px, qty)) = target else {
            // Side suppressed: pull the resting order to avoid stale exposure.
            if let Some((id, _, _)) = working {
                if let Some(cmd) = oms.request_cancel(id, now) {
                    commands.push(cmd);
                    self.set_current(side, None);
                    return true;
                }
            }
            return false;
        };

        // No re-quote while the working order is within tolerance.
        if let Some((_, cur_px, cur_qty)) = working {
            let moved = (px.0 - cur_px.0).abs() >= self.cfg.requote_tolerance_ticks;
            if !moved && cur_qty == qty {
                return false;
            }
        }

        let candidate = OrderRequest {
            symbol: book.symbol().clone(),
            side,
            px,
            qty,
        };
        let verdict = gate.evaluate(&candidate, &ledger.snapshot(), limits, exposure, book.mid(), now);
        if let Verdict::Reject(reason) = verdict {
            self.risk_rejects += 1;
            tracing::debug!(symbol = %book.symbol(), %side, %reason, "quote suppressed by risk gate");
            // Pull the previous resting order rather than leave it stale.
            if let Some((id, _, _)) = working {
                if let Some(cmd) = oms.request_cancel(id, now) {
                    commands.push(cmd);
                    self.set_current(side, None);
                    return true;
                }
            }
            return false;
        }

        let result = match working {
            Some((id, _, _)) => oms
                .request_replace(id, px, qty, limits.max_exposure, now)
                .map(|(new_id, cmds)| (new_id, cmds)),
            None => oms
                .submit(candidate, limits.max_exposure, now)
                .map(|(id, cmd)| (id, vec![cmd])),
        };
        match result {
            Ok((id, cmds)) => {
                commands.extend(cmds);
                self.set_current(side, Some(id));
                true
            }
            Err(e) => {
                // Reservation refused: the OMS is the arbiter of in-flight
                // capacity; stand down on this side.
                tracing::debug!(symbol = %book.symbol(), %side, error = %e, "submission refused");
                false
            }
        }
    }

    fn current_order(&self, side: Side) -> Option<ClientOrderId> {
        match side {
            Side::Buy => self.current_bid,
            Side::Sell => self.current_ask,
        }
    }

    fn set_current(&mut self, side: Side, id: Option<ClientOrderId>) {
        match side {
            Side::Buy => self.current_bid = id,
            Side::Sell => self.current_ask = id,
        }
    }
}

/// Size-weighted mid: leans toward the heavier side's direction.
fn microprice(bid_px: Px, bid_sz: Qty, ask_px: Px, ask_sz: Qty) -> f64 {
    let (bp, ap) = (bid_px.0 as f64, ask_px.0 as f64);
    let (bs, as_) = (bid_sz.0 as f64, ask_sz.0 as f64);
    if bs <= 0.0 || as_ <= 0.0 {
        return (bp + ap) / 2.0;
    }
    (ap * bs + bp * as_) / (bs + as_)
}
