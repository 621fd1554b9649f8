//! Mako - single-symbol-lane market making engine
//! MBO order books, risk-gated quoting, paper execution

pub mod config;
pub mod engine;
pub mod error;
pub mod feed;
pub mod gateway;
pub mod ledger;
pub mod metrics;
pub mod oms;
pub mod orderbook;
pub mod risk;
pub mod strategy;
pub mod types;

// Re-exports
pub use config::Config;
pub use error::{Error, Result};
