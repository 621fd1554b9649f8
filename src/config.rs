//! Central configuration.
//!
//! Loads from a TOML file; all trading parameters are runtime-configurable,
//! no recompilation needed. Risk limits are held behind an atomically
//! swappable snapshot so they can be hot-reloaded between evaluations.

use crate::error::{Error, Result};
use crate::types::Symbol;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub engine: EngineConfig,
    pub risk: RiskLimits,
    pub strategy: StrategyConfig,
    pub feed: FeedConfig,
}

/// Engine / lane plumbing parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Symbols to quote.
    pub symbols: Vec<String>,
    /// Bounded capacity of each per-symbol lane channel.
    #[serde(default = "default_lane_capacity")]
    pub lane_capacity: usize,
    /// Timer floor between forced strategy ticks, in milliseconds.
    #[serde(default = "default_tick_floor_ms")]
    pub tick_floor_ms: u64,
    /// Deadline for PendingNew/PendingCancel gateway responses, in milliseconds.
    #[serde(default = "default_pending_deadline_ms")]
    pub pending_deadline_ms: u64,
}

impl EngineConfig {
    pub fn symbols(&self) -> Vec<Symbol> {
        self.symbols.iter().map(Symbol::new).collect()
    }

    pub fn tick_floor(&self) -> Duration {
        Duration::from_millis(self.tick_floor_ms)
    }

    pub fn pending_deadline(&self) -> Duration {
        Duration::from_millis(self.pending_deadline_ms)
    }
}

fn default_lane_capacity() -> usize {
    4096
}

fn default_tick_floor_ms() -> u64 {
    50
}

fn default_pending_deadline_ms() -> u64 {
    2_000
}

/// Pre-trade risk limits. Immutable per evaluation; hot-reload swaps the
/// whole snapshot via [`SharedLimits`], never a partial mutation.
#[derive(Debug, Clone, Deserialize)]
pub struct RiskLimits {
    /// Max absolute net position per symbol, in units.
    pub max_position: u64,
    /// Max gross exposure across all symbols, in Decimal tick-notional.
    pub max_exposure: Decimal,
    /// Max single-order notional, in Decimal tick-notional.
    pub max_order_notional: Decimal,
    /// Max order evaluations per symbol within the rate window.
    pub max_order_rate: usize,
    /// Length of the rate window, in milliseconds.
    #[serde(default = "default_rate_window_ms")]
    pub rate_window_ms: u64,
    /// Max allowed deviation of an order price from the book mid, as a
    /// fraction of mid (e.g. 0.01 = 1%).
    pub price_collar: Decimal,
}

impl RiskLimits {
    pub fn rate_window(&self) -> Duration {
        Duration::from_millis(self.rate_window_ms)
    }
}

fn default_rate_window_ms() -> u64 {
    1_000
}

/// Quoting parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct StrategyConfig {
    /// Per-side quote size, in units.
    pub quote_size: u64,
    /// Base half-spread in ticks.
    pub base_half_spread_ticks: i64,
    /// Half-spread floor/ceiling in ticks.
    pub min_half_spread_ticks: i64,
    pub max_half_spread_ticks: i64,
    /// Maximum inventory-skew shift of the quoted mid, in ticks, reached
    /// at full position.
    pub max_skew_ticks: i64,
    /// Half-spread widening per unit of normalized volatility.
    #[serde(default = "default_vol_sensitivity")]
    pub vol_sensitivity: f64,
    /// Half-spread widening as inventory headroom shrinks.
    #[serde(default = "default_inventory_sensitivity")]
    pub inventory_sensitivity: f64,
    /// Re-quote only when a side moves by at least this many ticks.
    #[serde(default = "default_requote_tolerance_ticks")]
    pub requote_tolerance_ticks: i64,
    /// Minimum milliseconds between re-quote actions; excess triggers are
    /// coalesced into the latest target.
    #[serde(default = "default_requote_interval_ms")]
    pub requote_interval_ms: u64,
    /// EWMA smoothing factor for the volatility estimator.
    #[serde(default = "default_vol_alpha")]
    pub vol_alpha: f64,
}

impl StrategyConfig {
    pub fn requote_interval(&self) -> Duration {
        Duration::from_millis(self.requote_interval_ms)
    }
}

fn default_vol_sensitivity() -> f64 {
    1.0
}

fn default_inventory_sensitivity() -> f64 {
    0.5
}

fn default_requote_tolerance_ticks() -> i64 {
    1
}

fn default_requote_interval_ms() -> u64 {
    5
}

fn default_vol_alpha() -> f64 {
    0.05
}

/// Feed ingest parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    /// TCP address of the MBO line stream.
    pub addr: String,
    /// Tick size used to convert feed decimal prices to integer ticks.
    pub tick_size: Decimal,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: EngineConfig {
                symbols: vec!["NVDA".to_string()],
                lane_capacity: default_lane_capacity(),
                tick_floor_ms: default_tick_floor_ms(),
                pending_deadline_ms: default_pending_deadline_ms(),
            },
            risk: RiskLimits {
                max_position: 1_000,
                max_exposure: Decimal::from(100_000_000),
                max_order_notional: Decimal::from(10_000_000),
                max_order_rate: 50,
                rate_window_ms: default_rate_window_ms(),
                price_collar: Decimal::new(1, 2), // 1%
            },
            strategy: StrategyConfig {
                quote_size: 100,
                base_half_spread_ticks: 2,
                min_half_spread_ticks: 1,
                max_half_spread_ticks: 10,
                max_skew_ticks: 2,
                vol_sensitivity: default_vol_sensitivity(),
                inventory_sensitivity: default_inventory_sensitivity(),
                requote_tolerance_ticks: default_requote_tolerance_ticks(),
                requote_interval_ms: default_requote_interval_ms(),
                vol_alpha: default_vol_alpha(),
            },
            feed: FeedConfig {
                addr: "127.0.0.1:9999".to_string(),
                tick_size: Decimal::new(1, 2), // 0.01
            },
        }
    }
}

impl Config {
    /// Load from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("failed to read config: {}", e)))?;
        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))
    }
}

/// Hot-swappable risk-limit snapshot. Readers clone the `Arc` and evaluate
/// against an immutable snapshot; a reload stores a fresh one.
#[derive(Clone)]
pub struct SharedLimits {
    inner: Arc<RwLock<Arc<RiskLimits>>>,
}

impl SharedLimits {
    pub fn new(limits: RiskLimits) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(limits))),
        }
    }

    /// Current snapshot; holds no lock beyond the clone.
    pub fn load(&self) -> Arc<RiskLimits> {
        self.inner.read().clone()
    }

    /// Replace the whole snapshot.
    pub fn store(&self, limits: RiskLimits) {
        *self.inner.write() = Arc::new(limits);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_toml() {
        let toml = r#"
            [engine]
            symbols = ["nvda"]

            [risk]
            max_position = 500
            max_exposure = 1000000
            max_order_notional = 100000
            max_order_rate = 10
            price_collar = 0.01

            [strategy]
            quote_size = 10
            base_half_spread_ticks = 2
            min_half_spread_ticks = 1
            max_half_spread_ticks = 8
            max_skew_ticks = 3

            [feed]
            addr = "127.0.0.1:9999"
            tick_size = 0.01
        "#;
        let cfg: Config = toml::from_str(toml).unwrap();
        assert_eq!(cfg.engine.symbols(), vec![Symbol::new("NVDA")]);
        assert_eq!(cfg.risk.max_position, 500);
        assert_eq!(cfg.engine.lane_capacity, 4096); // default
    }

    #[test]
    fn shared_limits_swap_is_whole_snapshot() {
        let shared = SharedLimits::new(Config::default().risk);
        let before = shared.load();
        let mut next = Config::default().risk;
        next.max_position = 7;
        shared.store(next);
        assert_eq!(shared.load().max_position, 7);
        // old snapshot unaffected
        assert_eq!(before.max_position, 1_000);
    }
}
