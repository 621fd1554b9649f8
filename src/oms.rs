//! Order Management State Machine - tracks every outbound order through a
//! concurrent, partially-ordered lifecycle.
//!
//! Orders live in an arena keyed by client id; other components hold ids,
//! never the orders themselves. Exposure is reserved provisionally at
//! submission (before any ack) so concurrent risk evaluations cannot
//! double-commit the same capacity, and released only when the order
//! reaches a terminal state or quantity fills.

use crate::error::{Error, Result};
use crate::gateway::GatewayCommand;
use crate::ledger::{GlobalExposure, PositionLedger};
use crate::types::{
    ClientOrderId, ExchangeOrderId, ExecStatus, ExecutionReport, FillId, OrderRequest, Px, Qty,
    ReplaceChainId, Side, Symbol, notional,
};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Lifecycle state of one of our own orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderState {
    Created,
    PendingNew,
    Live,
    PartiallyFilled,
    PendingCancel,
    /// Cancel leg of a cancel-replace; behaves like `PendingCancel` but is
    /// distinguishable for audit.
    PendingReplace,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderState::Filled | OrderState::Cancelled | OrderState::Rejected
        )
    }

    fn is_cancel_pending(&self) -> bool {
        matches!(self, OrderState::PendingCancel | OrderState::PendingReplace)
    }
}

impl std::fmt::Display for OrderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrderState::Created => "Created",
            OrderState::PendingNew => "PendingNew",
            OrderState::Live => "Live",
            OrderState::PartiallyFilled => "PartiallyFilled",
            OrderState::PendingCancel => "PendingCancel",
            OrderState::PendingReplace => "PendingReplace",
            OrderState::Filled => "Filled",
            OrderState::Cancelled => "Cancelled",
            OrderState::Rejected => "Rejected",
        };
        write!(f, "{}", s)
    }
}

/// One of our own orders. Owned exclusively by the OMS.
#[derive(Debug, Clone)]
pub struct OwnOrder {
    pub id: ClientOrderId,
    pub exchange_id: Option<ExchangeOrderId>,
    pub symbol: Symbol,
    pub side: Side,
    pub px: Px,
    pub original_qty: Qty,
    pub remaining_qty: Qty,
    pub state: OrderState,
    pub replace_chain: Option<ReplaceChainId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    submitted_at: Instant,
    /// Set while a gateway response is outstanding; cleared on response or
    /// after a timeout escalation.
    pending_since: Option<Instant>,
    /// Stamped by the first timeout sweep after the order goes terminal;
    /// drives retention pruning.
    terminal_at: Option<Instant>,
    /// Fill ids applied to this order, removed from the dedup set when the
    /// order is pruned.
    fill_ids: Vec<FillId>,
}

/// What happened inside the OMS while processing a report or a timeout
/// sweep. The lane turns these into metrics and strategy notifications.
#[derive(Debug, Clone)]
pub enum OmsEvent {
    Transition {
        id: ClientOrderId,
        from: OrderState,
        to: OrderState,
    },
    /// Gateway acknowledged a new order; latency measured from submission.
    Acked { id: ClientOrderId, latency: Duration },
    /// A distinct fill was applied to the ledger.
    Fill {
        id: ClientOrderId,
        side: Side,
        px: Px,
        qty: Qty,
    },
    /// A fill arrived while a cancel was in flight; the fill won.
    CancelSuperseded { id: ClientOrderId },
    /// No gateway response within the deadline; escalated for reconciliation.
    TimedOut { id: ClientOrderId, state: OrderState },
}

/// Per-symbol order manager.
pub struct Oms {
    symbol: Symbol,
    orders: HashMap<ClientOrderId, OwnOrder>,
    seen_fills: HashSet<FillId>,
    exposure: Arc<GlobalExposure>,
    pending_deadline: Duration,
}

impl Oms {
    pub fn new(symbol: Symbol, exposure: Arc<GlobalExposure>, pending_deadline: Duration) -> Self {
        Self {
            symbol,
            orders: HashMap::new(),
            seen_fills: HashSet::new(),
            exposure,
            pending_deadline,
        }
    }

    pub fn get(&self, id: &ClientOrderId) -> Option<&OwnOrder> {
        self.orders.get(id)
    }

    /// Orders that are (or may become) resting at the exchange.
    pub fn open_orders(&self) -> impl Iterator<Item = &OwnOrder> {
        self.orders.values().filter(|o| !o.state.is_terminal())
    }

    /// Submit a new order: `Created -> PendingNew`, with remaining quantity
    /// reserved against global exposure before the gateway sees the request.
    /// Fails without side effects if the reservation would breach
    /// `max_exposure`; the OMS, not the risk gate, is the final arbiter.
    pub fn submit(
        &mut self,
        req: OrderRequest,
        max_exposure: rust_decimal::Decimal,
        now: Instant,
    ) -> Result<(ClientOrderId, GatewayCommand)> {
        self.submit_linked(req, None, max_exposure, now)
    }

    fn submit_linked(
        &mut self,
        req: OrderRequest,
        replace_chain: Option<ReplaceChainId>,
        max_exposure: rust_decimal::Decimal,
        now: Instant,
    ) -> Result<(ClientOrderId, GatewayCommand)> {
        if !self.exposure.try_reserve(req.notional(), max_exposure) {
            return Err(Error::RiskRejected(crate::risk::RejectReason::ExposureLimit));
        }

        let id = ClientOrderId::generate();
        let ts = Utc::now();
        let order = OwnOrder {
            id,
            exchange_id: None,
            symbol: req.symbol.clone(),
            side: req.side,
            px: req.px,
            original_qty: req.qty,
            remaining_qty: req.qty,
            state: OrderState::PendingNew,
            replace_chain,
            created_at: ts,
            updated_at: ts,
            submitted_at: now,
            pending_since: Some(now),
            terminal_at: None,
            fill_ids: Vec::new(),
        };
        tracing::debug!(symbol = %self.symbol, %id, side = %req.side, px = %req.px, qty = req.qty.0, "submitting order");
        self.orders.insert(id, order);
        Ok((id, GatewayCommand::Submit { id, request: req }))
    }

    /// Request a cancel: `Live/PartiallyFilled -> PendingCancel`.
    /// Fire-and-forget; local state moves optimistically and the lane keeps
    /// processing while the cancel is in flight.
    pub fn request_cancel(&mut self, id: ClientOrderId, now: Instant) -> Option<GatewayCommand> {
        self.request_cancel_as(id, OrderState::PendingCancel, now)
    }

    fn request_cancel_as(
        &mut self,
        id: ClientOrderId,
        pending_state: OrderState,
        now: Instant,
    ) -> Option<GatewayCommand> {
        let order = self.orders.get_mut(&id)?;
        if !matches!(order.state, OrderState::Live | OrderState::PartiallyFilled) {
            return None;
        }
        order.state = pending_state;
        order.pending_since = Some(now);
        order.updated_at = Utc::now();
        Some(GatewayCommand::Cancel {
            symbol: order.symbol.clone(),
            id,
            exchange_id: order.exchange_id.clone(),
        })
    }

    /// Cancel-replace: `PendingCancel` on the old order plus a fresh
    /// submission, linked by a replace-chain id. The old order's reservation
    /// is held until it reaches a terminal state, so exposure is counted on
    /// both legs during the transition window.
    pub fn request_replace(
        &mut self,
        old_id: ClientOrderId,
        new_px: Px,
        new_qty: Qty,
        max_exposure: rust_decimal::Decimal,
        now: Instant,
    ) -> Result<(ClientOrderId, Vec<GatewayCommand>)> {
        let (symbol, side) = {
            let old = self
                .orders
                .get(&old_id)
                .ok_or(Error::GatewayReject(old_id))?;
            (old.symbol.clone(), old.side)
        };
        let chain = ReplaceChainId::generate();
        let req = OrderRequest {
            symbol,
            side,
            px: new_px,
            qty: new_qty,
        };

        // Reserve the new leg before touching the old order. A refused
        // reservation must leave the resting order fully working, with no
        // half-sent cancel recorded locally.
        let (new_id, submit) = self.submit_linked(req, Some(chain), max_exposure, now)?;

        let mut commands = Vec::with_capacity(2);
        if let Some(cancel) = self.request_cancel_as(old_id, OrderState::PendingReplace, now) {
            commands.push(cancel);
        }
        if let Some(old) = self.orders.get_mut(&old_id) {
            old.replace_chain = Some(chain);
        }
        commands.push(submit);
        Ok((new_id, commands))
    }

    /// Cancel every non-terminal order (used when quoting halts for the
    /// symbol). Orders already awaiting a cancel are left alone.
    pub fn cancel_all(&mut self, now: Instant) -> Vec<GatewayCommand> {
        let ids: Vec<ClientOrderId> = self
            .orders
            .values()
            .filter(|o| matches!(o.state, OrderState::Live | OrderState::PartiallyFilled))
            .map(|o| o.id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.request_cancel(id, now))
            .collect()
    }

    /// Reconcile one gateway execution report. Reports may be duplicated or
    /// out of order; terminal orders absorb late messages.
    pub fn on_report(
        &mut self,
        report: &ExecutionReport,
        ledger: &mut PositionLedger,
    ) -> Vec<OmsEvent> {
        let mut events = Vec::new();
        let Some(order) = self.orders.get_mut(&report.order_id) else {
            tracing::warn!(symbol = %self.symbol, id = %report.order_id, "report for unknown order, discarding");
            return events;
        };
        if order.state.is_terminal() {
            tracing::info!(
                symbol = %self.symbol,
                id = %order.id,
                state = %order.state,
                "late report for terminal order, discarding"
            );
            return events;
        }

        match report.status {
            ExecStatus::Accepted => {
                order.exchange_id = report.exchange_order_id.clone();
                order.updated_at = report.ts;
                // Only the new-order ack clears the pending marker. A
                // redelivered Accepted while a cancel is in flight must not
                // disarm the cancel-timeout escalation.
                if order.state == OrderState::PendingNew {
                    let from = order.state;
                    order.state = OrderState::Live;
                    order.pending_since = None;
                    events.push(OmsEvent::Acked {
                        id: order.id,
                        latency: order.submitted_at.elapsed(),
                    });
                    events.push(OmsEvent::Transition {
                        id: order.id,
                        from,
                        to: OrderState::Live,
                    });
                }
            }
            ExecStatus::Rejected => {
                let from = order.state;
                if order.state == OrderState::PendingNew {
                    order.state = OrderState::Rejected;
                    order.pending_since = None;
                    order.updated_at = report.ts;
                    let held = notional(order.px, order.remaining_qty);
                    self.exposure.release(held);
                    tracing::warn!(symbol = %self.symbol, id = %order.id, "gateway rejected order");
                    events.push(OmsEvent::Transition {
                        id: order.id,
                        from,
                        to: OrderState::Rejected,
                    });
                } else if order.state.is_cancel_pending() {
                    // Cancel rejected: the order is still working.
                    let to = if order.remaining_qty < order.original_qty {
                        OrderState::PartiallyFilled
                    } else {
                        OrderState::Live
                    };
                    order.state = to;
                    order.pending_since = None;
                    order.updated_at = report.ts;
                    tracing::warn!(symbol = %self.symbol, id = %order.id, "cancel rejected, order still working");
                    events.push(OmsEvent::Transition { id: order.id, from, to });
                } else {
                    tracing::warn!(symbol = %self.symbol, id = %order.id, state = %order.state, "unexpected reject, discarding");
                }
            }
            ExecStatus::Filled => {
                let (Some(fill_id), Some(px), Some(qty)) =
                    (report.fill_id.clone(), report.last_px, report.last_qty)
                else {
                    tracing::warn!(symbol = %self.symbol, id = %order.id, "fill report missing fill fields, discarding");
                    return events;
                };
                if !self.seen_fills.insert(fill_id.clone()) {
                    tracing::info!(symbol = %self.symbol, id = %order.id, fill_id = %fill_id.0, "duplicate fill, ignoring");
                    return events;
                }
                order.fill_ids.push(fill_id);

                let from = order.state;
                let applied = Qty(qty.0.min(order.remaining_qty.0));
                order.remaining_qty = Qty(order.remaining_qty.0 - applied.0);
                order.updated_at = report.ts;

                // Reservation was taken at the order's own price.
                self.exposure.release(notional(order.px, applied));
                ledger.on_fill(order.side, px, applied);
                events.push(OmsEvent::Fill {
                    id: order.id,
                    side: order.side,
                    px,
                    qty: applied,
                });

                if order.remaining_qty.is_zero() {
                    if from.is_cancel_pending() {
                        // Fill beat the cancel ack: fill wins, cancel is
                        // superseded and never re-sent.
                        tracing::info!(symbol = %self.symbol, id = %order.id, "fill superseded in-flight cancel");
                        events.push(OmsEvent::CancelSuperseded { id: order.id });
                    }
                    order.state = OrderState::Filled;
                    order.pending_since = None;
                    events.push(OmsEvent::Transition {
                        id: order.id,
                        from,
                        to: OrderState::Filled,
                    });
                } else if !from.is_cancel_pending() && from != OrderState::PartiallyFilled {
                    // Partial fill while a cancel is in flight stays in its
                    // pending state; the cancel ack will close the remainder.
                    order.state = OrderState::PartiallyFilled;
                    events.push(OmsEvent::Transition {
                        id: order.id,
                        from,
                        to: OrderState::PartiallyFilled,
                    });
                }
            }
            ExecStatus::Cancelled => {
                let from = order.state;
                order.state = OrderState::Cancelled;
                order.pending_since = None;
                order.updated_at = report.ts;
                let held = notional(order.px, order.remaining_qty);
                order.remaining_qty = Qty::ZERO;
                self.exposure.release(held);
                events.push(OmsEvent::Transition {
                    id: order.id,
                    from,
                    to: OrderState::Cancelled,
                });
            }
        }
        events
    }

    /// Escalate orders whose gateway response is overdue. A timed-out
    /// `PendingNew` is treated as request-failed: reservation released,
    /// order marked `Rejected`, and flagged for reconciliation in case it is
    /// actually live at the exchange.
    pub fn poll_timeouts(&mut self, now: Instant) -> Vec<OmsEvent> {
        let mut events = Vec::new();
        for order in self.orders.values_mut() {
            let Some(since) = order.pending_since else {
                continue;
            };
            if now.duration_since(since) < self.pending_deadline {
                continue;
            }
            match order.state {
                OrderState::PendingNew => {
                    let from = order.state;
                    order.state = OrderState::Rejected;
                    order.pending_since = None;
                    order.updated_at = Utc::now();
                    self.exposure.release(notional(order.px, order.remaining_qty));
                    tracing::error!(
                        symbol = %self.symbol,
                        id = %order.id,
                        "no ack within deadline; treating as failed, reconciliation required"
                    );
                    events.push(OmsEvent::TimedOut { id: order.id, state: from });
                    events.push(OmsEvent::Transition {
                        id: order.id,
                        from,
                        to: OrderState::Rejected,
                    });
                }
                OrderState::PendingCancel | OrderState::PendingReplace => {
                    // Escalate once; the order stays pending until the
                    // gateway answers or reconciliation resolves it.
                    order.pending_since = None;
                    tracing::error!(
                        symbol = %self.symbol,
                        id = %order.id,
                        state = %order.state,
                        "cancel unacknowledged within deadline, escalating"
                    );
                    events.push(OmsEvent::TimedOut {
                        id: order.id,
                        state: order.state,
                    });
                }
                _ => {}
            }
        }

        // Retention: terminal orders stay one deadline window to absorb
        // late duplicate reports, then drop along with their fill ids.
        let retention = self.pending_deadline;
        let seen_fills = &mut self.seen_fills;
        self.orders.retain(|_, order| {
            if !order.state.is_terminal() {
                return true;
            }
            match order.terminal_at {
                None => {
                    order.terminal_at = Some(now);
                    true
                }
                Some(at) if now.duration_since(at) >= retention => {
                    for fill_id in &order.fill_ids {
                        seen_fills.remove(fill_id);
                    }
                    false
                }
                Some(_) => true,
            }
        });
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn sym() -> Symbol {
        Symbol::new("NVDA")
    }

    fn oms_with(exposure: Arc<GlobalExposure>) -> Oms {
        Oms::new(sym(), exposure, Duration::from_millis(500))
    }

    fn req(side: Side, px: i64, qty: u64) -> OrderRequest {
        OrderRequest {
            symbol: sym(),
            side,
            px: Px(px),
            qty: Qty(qty),
        }
    }

    fn max_exposure() -> Decimal {
        Decimal::from(1_000_000_000)
    }

    fn report(id: ClientOrderId, status: ExecStatus) -> ExecutionReport {
        ExecutionReport {
            symbol: sym(),
            order_id: id,
            exchange_order_id: Some(ExchangeOrderId("X1".into())),
            status,
            fill_id: None,
            last_px: None,
            last_qty: None,
            ts: Utc::now(),
        }
    }

    fn fill(id: ClientOrderId, fill_id: &str, px: i64, qty: u64) -> ExecutionReport {
        ExecutionReport {
            symbol: sym(),
            order_id: id,
            exchange_order_id: None,
            status: ExecStatus::Filled,
            fill_id: Some(FillId(fill_id.into())),
            last_px: Some(Px(px)),
            last_qty: Some(Qty(qty)),
            ts: Utc::now(),
        }
    }

    #[test]
    fn submit_reserves_and_ack_goes_live() {
        let exposure = GlobalExposure::new();
        let mut oms = oms_with(exposure.clone());
        let mut ledger = PositionLedger::new(sym());

        let (id, _cmd) = oms
            .submit(req(Side::Buy, 100, 10), max_exposure(), Instant::now())
            .unwrap();
        assert_eq!(oms.get(&id).unwrap().state, OrderState::PendingNew);
        assert_eq!(exposure.total(), Decimal::from(1_000));

        let events = oms.on_report(&report(id, ExecStatus::Accepted), &mut ledger);
        assert_eq!(oms.get(&id).unwrap().state, OrderState::Live);
        assert!(events.iter().any(|e| matches!(e, OmsEvent::Acked { .. })));
        // Reservation held until fill or terminal state.
        assert_eq!(exposure.total(), Decimal::from(1_000));
    }

    #[test]
    fn submit_fails_when_reservation_breaches_cap() {
        let exposure = GlobalExposure::new();
        let mut oms = oms_with(exposure.clone());
        let err = oms
            .submit(req(Side::Buy, 100, 10), Decimal::from(500), Instant::now())
            .unwrap_err();
        assert!(matches!(err, Error::RiskRejected(_)));
        assert_eq!(exposure.total(), Decimal::ZERO);
    }

    #[test]
    fn gateway_reject_is_terminal_and_releases() {
        let exposure = GlobalExposure::new();
        let mut oms = oms_with(exposure.clone());
        let mut ledger = PositionLedger::new(sym());

        let (id, _) = oms
            .submit(req(Side::Buy, 100, 10), max_exposure(), Instant::now())
            .unwrap();
        oms.on_report(&report(id, ExecStatus::Rejected), &mut ledger);
        assert_eq!(oms.get(&id).unwrap().state, OrderState::Rejected);
        assert_eq!(exposure.total(), Decimal::ZERO);
    }

    #[test]
    fn fills_update_ledger_exactly_once_per_fill_id() {
        let exposure = GlobalExposure::new();
        let mut oms = oms_with(exposure.clone());
        let mut ledger = PositionLedger::new(sym());

        let (id, _) = oms
            .submit(req(Side::Buy, 100, 10), max_exposure(), Instant::now())
            .unwrap();
        oms.on_report(&report(id, ExecStatus::Accepted), &mut ledger);

        oms.on_report(&fill(id, "f1", 100, 4), &mut ledger);
        assert_eq!(oms.get(&id).unwrap().state, OrderState::PartiallyFilled);
        assert_eq!(ledger.position(), 4);

        // Redelivered fill is absorbed.
        oms.on_report(&fill(id, "f1", 100, 4), &mut ledger);
        assert_eq!(ledger.position(), 4);
        assert_eq!(oms.get(&id).unwrap().remaining_qty, Qty(6));

        oms.on_report(&fill(id, "f2", 100, 6), &mut ledger);
        assert_eq!(oms.get(&id).unwrap().state, OrderState::Filled);
        assert_eq!(ledger.position(), 10);
        assert_eq!(exposure.total(), Decimal::ZERO);
    }

    #[test]
    fn no_transition_out_of_terminal_states() {
        let exposure = GlobalExposure::new();
        let mut oms = oms_with(exposure);
        let mut ledger = PositionLedger::new(sym());

        let (id, _) = oms
            .submit(req(Side::Buy, 100, 10), max_exposure(), Instant::now())
            .unwrap();
        oms.on_report(&report(id, ExecStatus::Accepted), &mut ledger);
        oms.on_report(&fill(id, "f1", 100, 10), &mut ledger);
        assert_eq!(oms.get(&id).unwrap().state, OrderState::Filled);

        // Late cancel ack and late fill are both discarded.
        oms.on_report(&report(id, ExecStatus::Cancelled), &mut ledger);
        assert_eq!(oms.get(&id).unwrap().state, OrderState::Filled);
        oms.on_report(&fill(id, "f9", 100, 5), &mut ledger);
        assert_eq!(oms.get(&id).unwrap().state, OrderState::Filled);
        assert_eq!(ledger.position(), 10);
    }

    #[test]
    fn fill_after_cancel_request_wins() {
        let exposure = GlobalExposure::new();
        let mut oms = oms_with(exposure.clone());
        let mut ledger = PositionLedger::new(sym());
        let now = Instant::now();

        let (id, _) = oms.submit(req(Side::Buy, 100, 10), max_exposure(), now).unwrap();
        oms.on_report(&report(id, ExecStatus::Accepted), &mut ledger);
        let cancel = oms.request_cancel(id, now);
        assert!(cancel.is_some());
        assert_eq!(oms.get(&id).unwrap().state, OrderState::PendingCancel);

        // Fill for the full remainder lands before the cancel ack.
        let events = oms.on_report(&fill(id, "f1", 100, 10), &mut ledger);
        assert_eq!(oms.get(&id).unwrap().state, OrderState::Filled);
        assert!(events
            .iter()
            .any(|e| matches!(e, OmsEvent::CancelSuperseded { .. })));
        assert_eq!(ledger.position(), 10);

        // The late cancel ack is absorbed by the terminal state.
        oms.on_report(&report(id, ExecStatus::Cancelled), &mut ledger);
        assert_eq!(oms.get(&id).unwrap().state, OrderState::Filled);
    }

    #[test]
    fn partial_fill_then_cancel_ack_cancels_remainder() {
        let exposure = GlobalExposure::new();
        let mut oms = oms_with(exposure.clone());
        let mut ledger = PositionLedger::new(sym());
        let now = Instant::now();

        let (id, _) = oms.submit(req(Side::Buy, 100, 10), max_exposure(), now).unwrap();
        oms.on_report(&report(id, ExecStatus::Accepted), &mut ledger);
        oms.request_cancel(id, now);

        oms.on_report(&fill(id, "f1", 100, 4), &mut ledger);
        // Cancel still in flight for the remainder.
        assert_eq!(oms.get(&id).unwrap().state, OrderState::PendingCancel);

        oms.on_report(&report(id, ExecStatus::Cancelled), &mut ledger);
        assert_eq!(oms.get(&id).unwrap().state, OrderState::Cancelled);
        assert_eq!(ledger.position(), 4);
        assert_eq!(exposure.total(), Decimal::ZERO);
    }

    #[test]
    fn replace_links_chain_and_holds_old_reservation() {
        let exposure = GlobalExposure::new();
        let mut oms = oms_with(exposure.clone());
        let mut ledger = PositionLedger::new(sym());
        let now = Instant::now();

        let (old_id, _) = oms.submit(req(Side::Buy, 100, 10), max_exposure(), now).unwrap();
        oms.on_report(&report(old_id, ExecStatus::Accepted), &mut ledger);

        let (new_id, commands) = oms
            .request_replace(old_id, Px(99), Qty(10), max_exposure(), now)
            .unwrap();
        assert_eq!(commands.len(), 2);
        assert_eq!(oms.get(&old_id).unwrap().state, OrderState::PendingReplace);
        assert_eq!(oms.get(&new_id).unwrap().state, OrderState::PendingNew);
        let chain = oms.get(&old_id).unwrap().replace_chain;
        assert!(chain.is_some());
        assert_eq!(oms.get(&new_id).unwrap().replace_chain, chain);

        // Both legs reserved during the transition window.
        assert_eq!(exposure.total(), Decimal::from(1_000 + 990));

        // Old leg terminal: its reservation finally drops.
        oms.on_report(&report(old_id, ExecStatus::Cancelled), &mut ledger);
        assert_eq!(exposure.total(), Decimal::from(990));
    }

    #[test]
    fn failed_replace_leaves_old_order_working() {
        let exposure = GlobalExposure::new();
        let mut oms = oms_with(exposure.clone());
        let mut ledger = PositionLedger::new(sym());
        let now = Instant::now();
        let cap = Decimal::from(1_500);

        let (old_id, _) = oms.submit(req(Side::Buy, 100, 10), cap, now).unwrap();
        oms.on_report(&report(old_id, ExecStatus::Accepted), &mut ledger);

        // New leg needs 990 on top of the held 1,000; the cap refuses it.
        let err = oms
            .request_replace(old_id, Px(99), Qty(10), cap, now)
            .unwrap_err();
        assert!(matches!(err, Error::RiskRejected(_)));

        // Old order untouched: still live at the venue, no phantom cancel
        // recorded, no chain, nothing extra reserved.
        let old = oms.get(&old_id).unwrap();
        assert_eq!(old.state, OrderState::Live);
        assert!(old.replace_chain.is_none());
        assert_eq!(exposure.total(), Decimal::from(1_000));
    }

    #[test]
    fn duplicate_ack_keeps_cancel_timeout_armed() {
        let exposure = GlobalExposure::new();
        let mut oms = oms_with(exposure);
        let mut ledger = PositionLedger::new(sym());
        let now = Instant::now();

        let (id, _) = oms.submit(req(Side::Buy, 100, 10), max_exposure(), now).unwrap();
        oms.on_report(&report(id, ExecStatus::Accepted), &mut ledger);
        oms.request_cancel(id, now);

        // The gateway redelivers the original ack while the cancel is in
        // flight; the cancel deadline must still fire.
        oms.on_report(&report(id, ExecStatus::Accepted), &mut ledger);
        assert_eq!(oms.get(&id).unwrap().state, OrderState::PendingCancel);

        let events = oms.poll_timeouts(now + Duration::from_secs(10));
        assert!(events
            .iter()
            .any(|e| matches!(e, OmsEvent::TimedOut { state: OrderState::PendingCancel, .. })));
    }

    #[test]
    fn terminal_orders_pruned_after_retention_window() {
        let exposure = GlobalExposure::new();
        let mut oms = oms_with(exposure);
        let mut ledger = PositionLedger::new(sym());
        let now = Instant::now();

        let (id, _) = oms.submit(req(Side::Buy, 100, 10), max_exposure(), now).unwrap();
        oms.on_report(&report(id, ExecStatus::Accepted), &mut ledger);
        oms.on_report(&fill(id, "f1", 100, 10), &mut ledger);
        assert_eq!(oms.get(&id).unwrap().state, OrderState::Filled);

        // First sweep stamps the terminal order; it is retained for one
        // deadline window and still absorbs redelivered fills.
        oms.poll_timeouts(now);
        assert!(oms.get(&id).is_some());
        oms.on_report(&fill(id, "f1", 100, 10), &mut ledger);
        assert_eq!(ledger.position(), 10);

        // A sweep past the window drops the order and its fill ids.
        oms.poll_timeouts(now + Duration::from_secs(1));
        assert!(oms.get(&id).is_none());

        // After pruning, a report for the gone order is discarded unknown.
        oms.on_report(&fill(id, "f1", 100, 10), &mut ledger);
        assert_eq!(ledger.position(), 10);
    }

    #[test]
    fn pending_new_timeout_releases_and_rejects() {
        let exposure = GlobalExposure::new();
        let mut oms = oms_with(exposure.clone());
        let now = Instant::now();

        let (id, _) = oms.submit(req(Side::Buy, 100, 10), max_exposure(), now).unwrap();
        let events = oms.poll_timeouts(now + Duration::from_secs(1));
        assert!(events
            .iter()
            .any(|e| matches!(e, OmsEvent::TimedOut { state: OrderState::PendingNew, .. })));
        assert_eq!(oms.get(&id).unwrap().state, OrderState::Rejected);
        assert_eq!(exposure.total(), Decimal::ZERO);
    }

    #[test]
    fn pending_cancel_timeout_escalates_once() {
        let exposure = GlobalExposure::new();
        let mut oms = oms_with(exposure);
        let mut ledger = PositionLedger::new(sym());
        let now = Instant::now();

        let (id, _) = oms.submit(req(Side::Buy, 100, 10), max_exposure(), now).unwrap();
        oms.on_report(&report(id, ExecStatus::Accepted), &mut ledger);
        oms.request_cancel(id, now);

        let late = now + Duration::from_secs(1);
        let events = oms.poll_timeouts(late);
        assert_eq!(events.len(), 1);
        // Still pending, but not re-escalated on the next sweep.
        assert_eq!(oms.get(&id).unwrap().state, OrderState::PendingCancel);
        assert!(oms.poll_timeouts(late + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn cancel_all_targets_working_orders_only() {
        let exposure = GlobalExposure::new();
        let mut oms = oms_with(exposure);
        let mut ledger = PositionLedger::new(sym());
        let now = Instant::now();

        let (a, _) = oms.submit(req(Side::Buy, 100, 10), max_exposure(), now).unwrap();
        let (b, _) = oms.submit(req(Side::Sell, 102, 10), max_exposure(), now).unwrap();
        oms.on_report(&report(a, ExecStatus::Accepted), &mut ledger);
        oms.on_report(&report(b, ExecStatus::Accepted), &mut ledger);
        oms.request_cancel(b, now); // already pending

        let commands = oms.cancel_all(now);
        assert_eq!(commands.len(), 1);
        assert!(matches!(
            &commands[0],
            GatewayCommand::Cancel { id, .. } if *id == a
        ));
    }
}
