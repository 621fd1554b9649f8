//! Error taxonomy for the decision core.
//!
//! Nothing here is process-fatal: sequence gaps and duplicate fills are
//! absorbed locally, book corruption halts a single symbol, and the engine
//! degrades to a halted, flat state per symbol rather than crashing.

use crate::types::{ClientOrderId, Symbol};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Market-data sequence gap; recoverable via a snapshot resync.
    #[error("sequence gap on {symbol}: expected {expected}, got {got}")]
    SequenceGap { symbol: Symbol, expected: u64, got: u64 },

    /// Bid crossed ask after a valid apply; fatal for the symbol until resync.
    #[error("book corrupt on {symbol}: bid {bid} >= ask {ask}")]
    BookCorrupt { symbol: Symbol, bid: i64, ask: i64 },

    /// Pre-trade risk check failed. Expected during normal operation;
    /// the order simply is not sent.
    #[error("risk rejected: {0}")]
    RiskRejected(crate::risk::RejectReason),

    /// Gateway rejected the order; terminal for that order.
    #[error("gateway rejected order {0}")]
    GatewayReject(ClientOrderId),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("feed error: {0}")]
    Feed(String),

    /// A bounded channel peer hung up; the owning task shuts down.
    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),
}
