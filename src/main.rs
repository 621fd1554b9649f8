use tracing_subscriber::{EnvFilter, fmt};

use mako::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,mako=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_level(true)
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => Config::load(&path)?,
        None => {
            tracing::info!("no config path given, using paper defaults");
            Config::default()
        }
    };
    tracing::info!(
        symbols = ?config.engine.symbols,
        feed = %config.feed.addr,
        "mako starting"
    );

    tokio::select! {
        result = mako::engine::run(config) => {
            result?;
            tracing::info!("feed drained, shutting down");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received, shutting down");
        }
    }
    Ok(())
}
