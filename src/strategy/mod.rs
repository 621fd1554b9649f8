//! Strategy / Quoting Engine - turns book and ledger state into risk-checked
//! order actions.

pub mod market_maker;
pub mod volatility;

pub use market_maker::MarketMaker;
pub use volatility::EwmaVolatility;
