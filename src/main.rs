use anyhow::{Context, Result};
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use zone_trader::bot::TradeEngine;
use zone_trader::config::Config;
use zone_trader::exchange::{BridgeClient, Broker, MarketData, PaperBroker};
use zone_trader::notify::{LogSink, NotificationSink, Notifier, TelegramSink};

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cfg.log_level));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_timer(fmt::time::UtcTime::new(Rfc3339))
        .init();

    cfg.validate().context("invalid configuration")?;

    let bridge = Arc::new(BridgeClient::new(&cfg)?);
    let market: Arc<dyn MarketData> = bridge.clone();
    let broker: Arc<dyn Broker> = if cfg.paper_trade {
        let spec = bridge
            .symbol_spec()
            .await
            .context("failed to load symbol spec for paper trading")?;
        Arc::new(PaperBroker::new(&cfg, Arc::clone(&market), spec))
    } else {
        bridge
    };

    let mut sinks: Vec<Arc<dyn NotificationSink>> = vec![Arc::new(LogSink)];
    match TelegramSink::from_config(&cfg) {
        Some(telegram) => sinks.push(Arc::new(telegram)),
        None => warn!("Telegram not configured; notifications go to the log only"),
    }
    let notifier = Notifier::new(sinks, cfg.notify_timeout());

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            let _ = stop_tx.send(true);
        }
    });

    let mut engine = TradeEngine::new(cfg.shared(), market, broker, notifier, stop_rx).await?;
    engine.run().await?;

    Ok(())
}
