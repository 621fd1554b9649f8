//! Engine assembly: one sequential lane per symbol.
//!
//! A lane owns every piece of mutable state for its symbol (book, ledger,
//! OMS, gate, strategy) and drains a single bounded channel, so event
//! ordering within a symbol is total and no per-symbol state needs a lock.
//! The only cross-lane state is the [`GlobalExposure`] accumulator.

use crate::config::{Config, EngineConfig, SharedLimits, StrategyConfig};
use crate::error::{Error, Result};
use crate::feed::{FeedHandle, spawn_feed};
use crate::gateway::{GatewayCommand, PaperTransport, spawn_gateway};
use crate::ledger::{GlobalExposure, PositionLedger};
use crate::metrics::{MetricEvent, MetricsHub, spawn_metrics};
use crate::oms::{Oms, OmsEvent};
use crate::orderbook::OrderBook;
use crate::risk::RiskGate;
use crate::strategy::MarketMaker;
use crate::types::{BookEvent, ExecutionReport, Symbol};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;

/// Everything a lane consumes, in arrival order.
pub enum LaneEvent {
    Market(BookEvent),
    Execution(ExecutionReport),
}

pub struct LaneHandle {
    pub symbol: Symbol,
    pub tx: flume::Sender<LaneEvent>,
    pub task: JoinHandle<()>,
}

struct SymbolLane {
    book: OrderBook,
    ledger: PositionLedger,
    oms: Oms,
    gate: RiskGate,
    strategy: MarketMaker,
    limits: SharedLimits,
    exposure: Arc<GlobalExposure>,
    metrics: MetricsHub,
    gateway_tx: flume::Sender<GatewayCommand>,
    feed: FeedHandle,
    /// Set between a gap/corruption halt and the recovering snapshot.
    awaiting_snapshot: bool,
}

impl SymbolLane {
    fn symbol(&self) -> &Symbol {
        self.book.symbol()
    }

    fn on_market(&mut self, event: BookEvent) {
        let started = Instant::now();
        match self.book.apply(event) {
            Ok(()) => {
                if self.awaiting_snapshot && self.book.is_live() {
                    tracing::info!(symbol = %self.symbol(), "snapshot applied, quoting resumed");
                    self.awaiting_snapshot = false;
                }
                if let Some(mid) = self.book.mid() {
                    self.ledger.mark_to_market(mid);
                    self.publish_exposure();
                }
                self.requote(started);
            }
            Err(Error::SequenceGap { expected, got, .. }) => {
                tracing::warn!(symbol = %self.symbol(), expected, got, "sequence gap");
                self.metrics.publish(MetricEvent::SequenceGap {
                    symbol: self.symbol().clone(),
                });
                self.halt(started);
            }
            Err(Error::BookCorrupt { bid, ask, .. }) => {
                tracing::error!(symbol = %self.symbol(), bid, ask, "book crossed, halting symbol");
                self.halt(started);
            }
            Err(e) => {
                tracing::warn!(symbol = %self.symbol(), error = %e, "book event dropped");
            }
        }
        self.metrics.publish(MetricEvent::LaneLatency {
            symbol: self.symbol().clone(),
            elapsed: started.elapsed(),
        });
    }

    /// Gap or corruption: pull every resting order, stop quoting, and ask
    /// the feed for a fresh snapshot. Idempotent while recovery is pending.
    fn halt(&mut self, now: Instant) {
        if self.awaiting_snapshot {
            return;
        }
        self.awaiting_snapshot = true;
        for cmd in self.oms.cancel_all(now) {
            self.send_gateway(cmd);
        }
        let symbol = self.symbol().clone();
        self.feed.request_snapshot(&symbol);
    }

    fn on_execution(&mut self, report: ExecutionReport) {
        let started = Instant::now();
        for event in self.oms.on_report(&report, &mut self.ledger) {
            match event {
                OmsEvent::Acked { latency, .. } => {
                    self.metrics.publish(MetricEvent::AckLatency {
                        symbol: self.symbol().clone(),
                        elapsed: latency,
                    });
                }
                OmsEvent::Fill { side, qty, px, id } => {
                    tracing::info!(symbol = %self.symbol(), %id, %side, %px, qty = qty.0, "fill");
                    self.metrics.publish(MetricEvent::Fill {
                        symbol: self.symbol().clone(),
                        side,
                        qty: qty.0,
                    });
                }
                OmsEvent::TimedOut { id, state } => {
                    tracing::warn!(symbol = %self.symbol(), %id, %state, "order timed out");
                }
                OmsEvent::CancelSuperseded { id } => {
                    tracing::info!(symbol = %self.symbol(), %id, "fill beat in-flight cancel");
                }
                OmsEvent::Transition { id, from, to } => {
                    tracing::debug!(symbol = %self.symbol(), %id, %from, %to, "order transition");
                }
            }
        }
        if let Some(mid) = self.book.mid() {
            self.ledger.mark_to_market(mid);
        }
        self.publish_exposure();
        self.requote(started);
    }

    fn on_timer(&mut self) {
        let now = Instant::now();
        for event in self.oms.poll_timeouts(now) {
            if let OmsEvent::TimedOut { id, state } = event {
                tracing::warn!(symbol = %self.symbol(), %id, %state, "pending deadline exceeded");
            }
        }
        self.requote(now);
    }

    fn publish_exposure(&self) {
        self.exposure
            .set_committed(self.symbol(), self.ledger.snapshot().gross_exposure);
    }

    fn requote(&mut self, now: Instant) {
        if self.awaiting_snapshot {
            return;
        }
        let limits = self.limits.load();
        let before_coalesced = self.strategy.coalesced_count();
        let before_rejects = self.strategy.risk_reject_count();
        let commands = self.strategy.on_tick(
            &self.book,
            &self.ledger,
            &mut self.oms,
            &mut self.gate,
            &limits,
            &self.exposure,
            now,
        );
        if self.strategy.coalesced_count() > before_coalesced {
            self.metrics.publish(MetricEvent::QuoteCoalesced {
                symbol: self.symbol().clone(),
            });
        }
        for _ in before_rejects..self.strategy.risk_reject_count() {
            self.metrics.publish(MetricEvent::RiskReject {
                symbol: self.symbol().clone(),
            });
        }
        for cmd in commands {
            self.send_gateway(cmd);
        }
    }

    // Non-blocking: a command lost to a full channel is recovered by the
    // OMS pending deadline, which rejects and releases the reservation.
    fn send_gateway(&self, cmd: GatewayCommand) {
        if let Err(e) = self.gateway_tx.try_send(cmd) {
            tracing::error!(symbol = %self.symbol(), error = %e, "gateway command dropped");
        }
    }
}

#[allow(clippy::too_many_arguments)]
pub fn spawn_lane(
    symbol: Symbol,
    engine: &EngineConfig,
    strategy: StrategyConfig,
    limits: SharedLimits,
    exposure: Arc<GlobalExposure>,
    metrics: MetricsHub,
    gateway_tx: flume::Sender<GatewayCommand>,
    feed: FeedHandle,
) -> LaneHandle {
    let (tx, rx) = flume::bounded(engine.lane_capacity);
    let tick_floor = engine.tick_floor();
    let mut lane = SymbolLane {
        book: OrderBook::new(symbol.clone()),
        ledger: PositionLedger::new(symbol.clone()),
        oms: Oms::new(symbol.clone(), exposure.clone(), engine.pending_deadline()),
        gate: RiskGate::new(),
        strategy: MarketMaker::new(strategy),
        limits,
        exposure,
        metrics,
        gateway_tx,
        feed,
        awaiting_snapshot: false,
    };
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(tick_floor);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                event = rx.recv_async() => {
                    match event {
                        Ok(LaneEvent::Market(ev)) => lane.on_market(ev),
                        Ok(LaneEvent::Execution(report)) => lane.on_execution(report),
                        Err(_) => {
                            tracing::info!(symbol = %lane.symbol(), "lane channel closed");
                            return;
                        }
                    }
                }
                _ = ticker.tick() => lane.on_timer(),
            }
        }
    });
    LaneHandle { symbol, tx, task }
}

/// Wire the whole engine together against the paper transport and route
/// events until the inbound channels close.
pub async fn run(config: Config) -> Result<()> {
    let symbols = config.engine.symbols();
    let exposure = GlobalExposure::new();
    let limits = SharedLimits::new(config.risk.clone());
    let (metrics, _metrics_task) = spawn_metrics(8192);

    let (report_tx, report_rx) = flume::bounded(config.engine.lane_capacity);
    let transport = Arc::new(PaperTransport::new(report_tx));
    let (gateway_tx, gateway_rx) = flume::bounded(config.engine.lane_capacity);
    let _gateway_task = spawn_gateway(transport, gateway_rx);

    let (feed_tx, feed_rx) = flume::bounded(config.engine.lane_capacity);
    let (feed_handle, _feed_task) = spawn_feed(config.feed.clone(), symbols.clone(), feed_tx);

    let mut lanes: HashMap<Symbol, flume::Sender<LaneEvent>> = HashMap::new();
    for symbol in symbols {
        let handle = spawn_lane(
            symbol,
            &config.engine,
            config.strategy.clone(),
            limits.clone(),
            exposure.clone(),
            metrics.clone(),
            gateway_tx.clone(),
            feed_handle.clone(),
        );
        lanes.insert(handle.symbol.clone(), handle.tx);
    }
    tracing::info!(lanes = lanes.len(), "engine started");

    loop {
        tokio::select! {
            ev = feed_rx.recv_async() => {
                let Ok((symbol, event)) = ev else { break };
                if let Some(tx) = lanes.get(&symbol) {
                    if tx.send_async(LaneEvent::Market(event)).await.is_err() {
                        return Err(Error::ChannelClosed("lane"));
                    }
                }
            }
            report = report_rx.recv_async() => {
                let Ok(report) = report else { break };
                if let Some(tx) = lanes.get(&report.symbol) {
                    if tx.send_async(LaneEvent::Execution(report)).await.is_err() {
                        return Err(Error::ChannelClosed("lane"));
                    }
                }
            }
        }
    }
    Ok(())
}
