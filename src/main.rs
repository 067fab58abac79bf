mod bot;

use anyhow::Result;
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

use paper_signal_bot::config::Config;
use paper_signal_bot::exchange::{CoinbaseClient, JsonFileStore};

use crate::bot::PaperSignalBot;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cfg.log_level));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .init();

    cfg.validate()?;

    let market = Arc::new(CoinbaseClient::new());
    let store = Arc::new(JsonFileStore::new(&cfg.log_dir));

    let bot = PaperSignalBot::new(cfg, market, store);
    bot.run().await?;

    Ok(())
}
