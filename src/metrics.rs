//! Best-effort metrics, kept off the lane hot path.
//!
//! Lanes publish with a non-blocking `try_send`; when the channel is full
//! the event is dropped and counted. The consumer task aggregates and logs
//! a summary once per second.

use crate::types::{Side, Symbol};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub enum MetricEvent {
    /// Event-in to decision-out latency for one lane pass.
    LaneLatency { symbol: Symbol, elapsed: Duration },
    /// Gateway ack round-trip for one of our orders.
    AckLatency { symbol: Symbol, elapsed: Duration },
    Fill { symbol: Symbol, side: Side, qty: u64 },
    RiskReject { symbol: Symbol },
    SequenceGap { symbol: Symbol },
    QuoteCoalesced { symbol: Symbol },
}

#[derive(Clone)]
pub struct MetricsHub {
    tx: flume::Sender<MetricEvent>,
    dropped: Arc<AtomicU64>,
}

impl MetricsHub {
    /// Never blocks. Overflow drops the event and bumps the counter.
    pub fn publish(&self, event: MetricEvent) {
        if self.tx.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// p99 / throughput over a window, reset after each summary.
pub struct LatencyRecorder {
    samples_us: Vec<u64>,
    count: u64,
    window_start: Instant,
}

impl LatencyRecorder {
    pub fn new() -> Self {
        Self {
            samples_us: Vec::new(),
            count: 0,
            window_start: Instant::now(),
        }
    }

    pub fn record(&mut self, elapsed: Duration) {
        self.samples_us.push(elapsed.as_micros() as u64);
        self.count += 1;
    }

    /// (messages/sec, p99 in microseconds) for the current window.
    pub fn summary(&self) -> (f64, u64) {
        if self.samples_us.is_empty() {
            return (0.0, 0);
        }
        let elapsed = self.window_start.elapsed().as_secs_f64().max(1e-9);
        let throughput = self.count as f64 / elapsed;

        let mut sorted = self.samples_us.clone();
        sorted.sort_unstable();
        let idx = (sorted.len() as f64 * 0.99) as usize;
        let p99 = sorted[idx.min(sorted.len() - 1)];
        (throughput, p99)
    }

    pub fn reset(&mut self) {
        self.samples_us.clear();
        self.count = 0;
        self.window_start = Instant::now();
    }
}

impl Default for LatencyRecorder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct Counters {
    fills: u64,
    filled_qty: u64,
    risk_rejects: u64,
    gaps: u64,
    coalesced: u64,
}

/// Spawn the hub and its consumer. The consumer logs one summary line per
/// second and is the only place latency percentiles are computed.
pub fn spawn_metrics(capacity: usize) -> (MetricsHub, JoinHandle<()>) {
    let (tx, rx) = flume::bounded(capacity);
    let hub = MetricsHub {
        tx,
        dropped: Arc::new(AtomicU64::new(0)),
    };
    let dropped = hub.dropped.clone();
    let task = tokio::spawn(async move {
        let mut lane = LatencyRecorder::new();
        let mut ack = LatencyRecorder::new();
        let mut counters = Counters::default();
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                event = rx.recv_async() => {
                    let Ok(event) = event else { return };
                    match event {
                        MetricEvent::LaneLatency { elapsed, .. } => lane.record(elapsed),
                        MetricEvent::AckLatency { elapsed, .. } => ack.record(elapsed),
                        MetricEvent::Fill { qty, .. } => {
                            counters.fills += 1;
                            counters.filled_qty += qty;
                        }
                        MetricEvent::RiskReject { .. } => counters.risk_rejects += 1,
                        MetricEvent::SequenceGap { .. } => counters.gaps += 1,
                        MetricEvent::QuoteCoalesced { .. } => counters.coalesced += 1,
                    }
                }
                _ = ticker.tick() => {
                    let (thr, lane_p99) = lane.summary();
                    let (_, ack_p99) = ack.summary();
                    if thr > 0.0 || counters.fills > 0 {
                        tracing::info!(
                            throughput_per_s = thr,
                            lane_p99_us = lane_p99,
                            ack_p99_us = ack_p99,
                            fills = counters.fills,
                            filled_qty = counters.filled_qty,
                            risk_rejects = counters.risk_rejects,
                            gaps = counters.gaps,
                            coalesced = counters.coalesced,
                            dropped = dropped.load(Ordering::Relaxed),
                            "metrics"
                        );
                    }
                    lane.reset();
                    ack.reset();
                    counters = Counters::default();
                }
            }
        }
    });
    (hub, task)
}
