//! Gateway boundary - outbound order commands and inbound execution reports.
//!
//! The per-symbol lanes never await network I/O: they `try_send` commands
//! into a bounded channel, and a pump task drains that channel into the
//! transport. Execution reports flow back through their own channel into
//! the lanes, preserving the single-writer invariant.

use crate::error::{Error, Result};
use crate::types::{
    ClientOrderId, ExchangeOrderId, ExecStatus, ExecutionReport, OrderRequest, Px, Qty, Symbol,
};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Outbound instruction for the gateway.
#[derive(Debug, Clone)]
pub enum GatewayCommand {
    Submit {
        id: ClientOrderId,
        request: OrderRequest,
    },
    Cancel {
        symbol: Symbol,
        id: ClientOrderId,
        exchange_id: Option<ExchangeOrderId>,
    },
    /// Native single-message replace, for venues that support it. The OMS
    /// models strategy-driven cancel-replace as a cancel plus a linked new
    /// order instead.
    Replace {
        symbol: Symbol,
        id: ClientOrderId,
        new_px: Px,
        new_qty: Qty,
    },
}

/// Exchange connectivity, implemented per venue. All calls are made from
/// the pump task, never from a lane.
#[async_trait]
pub trait GatewayTransport: Send + Sync {
    async fn submit(&self, id: ClientOrderId, request: &OrderRequest) -> Result<()>;

    async fn cancel(
        &self,
        symbol: &Symbol,
        id: ClientOrderId,
        exchange_id: Option<&ExchangeOrderId>,
    ) -> Result<()>;

    async fn replace(
        &self,
        symbol: &Symbol,
        id: ClientOrderId,
        new_px: Px,
        new_qty: Qty,
    ) -> Result<()>;
}

/// Drain gateway commands into the transport. Transport failures are logged
/// and surface later as OMS timeouts; they never block the lanes.
pub fn spawn_gateway(
    transport: Arc<dyn GatewayTransport>,
    rx: flume::Receiver<GatewayCommand>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok(cmd) = rx.recv_async().await {
            let result = match &cmd {
                GatewayCommand::Submit { id, request } => transport.submit(*id, request).await,
                GatewayCommand::Cancel {
                    symbol,
                    id,
                    exchange_id,
                } => transport.cancel(symbol, *id, exchange_id.as_ref()).await,
                GatewayCommand::Replace {
                    symbol,
                    id,
                    new_px,
                    new_qty,
                } => transport.replace(symbol, *id, *new_px, *new_qty).await,
            };
            if let Err(e) = result {
                tracing::error!(error = %e, ?cmd, "gateway transport call failed");
            }
        }
        tracing::info!("gateway pump stopped");
    })
}

/// Loop-back transport for paper runs and tests: acks every submission,
/// acks every cancel, and never generates fills.
pub struct PaperTransport {
    reports: flume::Sender<ExecutionReport>,
    next_exchange_id: AtomicU64,
}

impl PaperTransport {
    pub fn new(reports: flume::Sender<ExecutionReport>) -> Self {
        Self {
            reports,
            next_exchange_id: AtomicU64::new(1),
        }
    }

    fn send(&self, report: ExecutionReport) -> Result<()> {
        self.reports
            .send(report)
            .map_err(|_| Error::ChannelClosed("paper reports"))
    }
}

#[async_trait]
impl GatewayTransport for PaperTransport {
    async fn submit(&self, id: ClientOrderId, request: &OrderRequest) -> Result<()> {
        let n = self.next_exchange_id.fetch_add(1, Ordering::Relaxed);
        self.send(ExecutionReport {
            symbol: request.symbol.clone(),
            order_id: id,
            exchange_order_id: Some(ExchangeOrderId(format!("PAPER-{}", n))),
            status: ExecStatus::Accepted,
            fill_id: None,
            last_px: None,
            last_qty: None,
            ts: Utc::now(),
        })
    }

    async fn cancel(
        &self,
        symbol: &Symbol,
        id: ClientOrderId,
        _exchange_id: Option<&ExchangeOrderId>,
    ) -> Result<()> {
        self.send(ExecutionReport {
            symbol: symbol.clone(),
            order_id: id,
            exchange_order_id: None,
            status: ExecStatus::Cancelled,
            fill_id: None,
            last_px: None,
            last_qty: None,
            ts: Utc::now(),
        })
    }

    async fn replace(
        &self,
        symbol: &Symbol,
        id: ClientOrderId,
        new_px: Px,
        new_qty: Qty,
    ) -> Result<()> {
        tracing::debug!(%symbol, %id, px = %new_px, qty = new_qty.0, "paper replace acked");
        let n = self.next_exchange_id.fetch_add(1, Ordering::Relaxed);
        self.send(ExecutionReport {
            symbol: symbol.clone(),
            order_id: id,
            exchange_order_id: Some(ExchangeOrderId(format!("PAPER-{}", n))),
            status: ExecStatus::Accepted,
            fill_id: None,
            last_px: None,
            last_qty: None,
            ts: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> OrderRequest {
        OrderRequest {
            symbol: Symbol::new("NVDA"),
            side: crate::types::Side::Buy,
            px: Px(10_000),
            qty: Qty(10),
        }
    }

    #[tokio::test]
    async fn pump_dispatches_submit_and_cancel() {
        let (report_tx, report_rx) = flume::bounded(16);
        let (cmd_tx, cmd_rx) = flume::bounded(16);
        let transport = Arc::new(PaperTransport::new(report_tx));
        let pump = spawn_gateway(transport, cmd_rx);

        let id = ClientOrderId::generate();
        cmd_tx
            .send(GatewayCommand::Submit { id, request: request() })
            .unwrap();
        cmd_tx
            .send(GatewayCommand::Cancel {
                symbol: Symbol::new("NVDA"),
                id,
                exchange_id: None,
            })
            .unwrap();

        let ack = report_rx.recv_async().await.unwrap();
        assert_eq!(ack.status, ExecStatus::Accepted);
        assert_eq!(ack.order_id, id);
        assert!(ack.exchange_order_id.is_some());

        let cxl = report_rx.recv_async().await.unwrap();
        assert_eq!(cxl.status, ExecStatus::Cancelled);

        drop(cmd_tx);
        pump.await.unwrap();
    }

    #[tokio::test]
    async fn pump_dispatches_native_replace() {
        let (report_tx, report_rx) = flume::bounded(16);
        let (cmd_tx, cmd_rx) = flume::bounded(16);
        let pump = spawn_gateway(Arc::new(PaperTransport::new(report_tx)), cmd_rx);

        let id = ClientOrderId::generate();
        cmd_tx
            .send(GatewayCommand::Replace {
                symbol: Symbol::new("NVDA"),
                id,
                new_px: Px(10_001),
                new_qty: Qty(5),
            })
            .unwrap();

        let ack = report_rx.recv_async().await.unwrap();
        assert_eq!(ack.status, ExecStatus::Accepted);

        drop(cmd_tx);
        pump.await.unwrap();
    }
}
