//! Core types - strong newtypes shared across the engine.
//!
//! Prices are fixed-point integers in minimum price increments ("ticks");
//! monetary aggregates (notional, PnL) are computed in `Decimal` tick-units.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Tradeable symbol (e.g., "NVDA", "ESZ5")
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Symbol(String);

impl Symbol {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Price in ticks (minimum price increments).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Px(pub i64);

impl Px {
    pub fn as_decimal(&self) -> Decimal {
        Decimal::from(self.0)
    }
}

impl std::fmt::Display for Px {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}t", self.0)
    }
}

/// Quantity in whole units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Qty(pub u64);

impl Qty {
    pub const ZERO: Qty = Qty(0);

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn as_decimal(&self) -> Decimal {
        Decimal::from(self.0)
    }
}

/// Notional value of an order in Decimal tick-units.
pub fn notional(px: Px, qty: Qty) -> Decimal {
    px.as_decimal() * qty.as_decimal()
}

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Signed position delta for a fill of `qty` on this side.
    pub fn signed(&self, qty: Qty) -> i64 {
        match self {
            Side::Buy => qty.0 as i64,
            Side::Sell => -(qty.0 as i64),
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Exchange-assigned id of a resting order in the market-data book.
/// These are *their* orders; our own orders are tracked by [`ClientOrderId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BookOrderId(pub u64);

/// Our own client order id, assigned before submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientOrderId(pub Uuid);

impl ClientOrderId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ClientOrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Exchange-assigned id for one of our own orders, known after the ack.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExchangeOrderId(pub String);

/// Unique id of a single fill, used for de-duplication of redelivered reports.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FillId(pub String);

/// Links the legs of a cancel-replace for audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplaceChainId(pub Uuid);

impl ReplaceChainId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

/// Sequenced market-data event for one symbol's book.
#[derive(Debug, Clone, PartialEq)]
pub enum BookEvent {
    Add {
        order_ref: BookOrderId,
        side: Side,
        px: Px,
        qty: Qty,
        seq: u64,
    },
    /// Quantity-only modify. A decrease keeps queue position; an increase
    /// is applied as delete + re-add (loses time priority).
    Modify {
        order_ref: BookOrderId,
        new_qty: Qty,
        seq: u64,
    },
    Delete {
        order_ref: BookOrderId,
        seq: u64,
    },
    /// A resting order traded for `exec_qty`; removed when it reaches zero.
    Trade {
        order_ref: BookOrderId,
        exec_qty: Qty,
        seq: u64,
    },
    /// Full-depth replacement. May set any seq and clears Stale/Corrupt.
    Snapshot {
        levels: Vec<SnapshotLevel>,
        seq: u64,
    },
}

impl BookEvent {
    pub fn seq(&self) -> u64 {
        match self {
            BookEvent::Add { seq, .. }
            | BookEvent::Modify { seq, .. }
            | BookEvent::Delete { seq, .. }
            | BookEvent::Trade { seq, .. }
            | BookEvent::Snapshot { seq, .. } => *seq,
        }
    }
}

/// One price level of a depth snapshot, orders in time priority.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotLevel {
    pub side: Side,
    pub px: Px,
    pub orders: Vec<(BookOrderId, Qty)>,
}

/// Outbound order request, produced by the strategy and vetted by the risk gate.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: Symbol,
    pub side: Side,
    pub px: Px,
    pub qty: Qty,
}

impl OrderRequest {
    pub fn notional(&self) -> Decimal {
        notional(self.px, self.qty)
    }
}

/// Gateway-reported lifecycle status for one of our orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    /// Order accepted by the exchange; exchange id assigned.
    Accepted,
    /// Order rejected by the exchange.
    Rejected,
    /// A (partial or full) fill occurred.
    Filled,
    /// Cancel acknowledged.
    Cancelled,
}

/// Asynchronous execution report from the gateway. May arrive out of order
/// or duplicated; the OMS de-duplicates fills by `fill_id`.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub symbol: Symbol,
    pub order_id: ClientOrderId,
    pub exchange_order_id: Option<ExchangeOrderId>,
    pub status: ExecStatus,
    /// Set for `Filled` reports.
    pub fill_id: Option<FillId>,
    pub last_px: Option<Px>,
    pub last_qty: Option<Qty>,
    pub ts: DateTime<Utc>,
}

/// Desired two-sided quote at a decision instant. Ephemeral, recomputed
/// every strategy tick, never persisted. Either side may be suppressed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quote {
    pub bid: Option<(Px, Qty)>,
    pub ask: Option<(Px, Qty)>,
}

impl Quote {
    pub const EMPTY: Quote = Quote { bid: None, ask: None };

    pub fn side(&self, side: Side) -> Option<(Px, Qty)> {
        match side {
            Side::Buy => self.bid,
            Side::Sell => self.ask,
        }
    }
}
