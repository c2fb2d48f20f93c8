use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;

use perpbot::api::{ExchangeApi, FuturesClient};
use perpbot::config::AppConfig;
use perpbot::dashboard::{event_channel, run_aggregator, DashboardState};
use perpbot::db::{ConfigStore, PostgresPersistence, TradeSink};
use perpbot::execution::{OrderExecutor, PositionStore};
use perpbot::reconcile::Reconciler;
use perpbot::runner::StrategyManager;

#[derive(Parser, Debug)]
#[command(name = "perpbot", about = "Per-symbol futures strategy engine")]
struct Args {
    /// Path to a TOML config file (defaults to ./perpbot.toml if present)
    #[arg(long)]
    config: Option<String>,
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "perpbot=info".into()),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let args = Args::parse();
    let config = AppConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    tracing::info!("perpbot starting");
    tracing::info!("  Exchange: {}", config.exchange.base_url);
    tracing::info!("  Tick interval: {}s", config.trading.default_interval_secs);
    tracing::info!(
        "  Max strategies: {}",
        config.trading.max_concurrent_strategies
    );

    // Durable store first: without it no start request can be honored
    let persistence = Arc::new(
        PostgresPersistence::new(&config.database.url)
            .await
            .context("Failed to connect to Postgres")?,
    );

    let client = Arc::new(
        FuturesClient::new(
            &config.exchange.base_url,
            &config.exchange.api_key,
            &config.exchange.api_secret,
            config.exchange.request_timeout_secs,
            config.exchange.rate_limit_per_min,
        )
        .context("Failed to build exchange client")?,
    );

    match client.get_balance().await {
        Ok(balance) => tracing::info!(
            "  Balance: {:.2} {} ({:.2} available)",
            balance.total,
            balance.asset,
            balance.available
        ),
        Err(e) => tracing::warn!("Balance unavailable at startup: {}", e),
    }

    let store = Arc::new(PositionStore::new());
    let (events, event_rx) = event_channel();

    // Dashboard aggregator: sole consumer of the event queue
    let dashboard = Arc::new(DashboardState::new());
    let aggregator = tokio::spawn(run_aggregator(
        dashboard.clone(),
        event_rx,
        Some(persistence.clone() as Arc<dyn TradeSink>),
    ));

    let executor = Arc::new(OrderExecutor::new(
        client.clone(),
        store.clone(),
        events.clone(),
        config.executor_config(),
    ));

    let manager = Arc::new(StrategyManager::new(
        client.clone(),
        executor.clone(),
        store.clone(),
        persistence.clone() as Arc<dyn ConfigStore>,
        events.clone(),
        config.risk_limits(),
    ));

    // Resume whatever was running before the last shutdown/crash
    let restored = manager.restore().await.context("Restore failed")?;
    tracing::info!("Resumed {} persisted strategies", restored);

    // Then make sure config-declared strategies are up
    for seed in &config.strategies {
        let interval = seed
            .interval_secs
            .unwrap_or(config.trading.default_interval_secs);
        let outcome = manager
            .start(&seed.symbol, seed.mode, interval, seed.params.clone())
            .await?;
        match outcome.reason.as_deref() {
            None => tracing::info!("Seeded strategy {} started", seed.symbol),
            Some("already_running") => {}
            Some(reason) => {
                tracing::warn!("Seeded strategy {} not started: {}", seed.symbol, reason);
            }
        }
    }

    // Reconciliation runs independently of every runner
    let (reconcile_shutdown, reconcile_rx) = watch::channel(false);
    let reconciler = Reconciler::new(
        client.clone(),
        client.clone(),
        store.clone(),
        events.clone(),
        config.reconcile.clone(),
    );
    let reconcile_task = tokio::spawn(reconciler.run(reconcile_rx));

    tracing::info!(
        "perpbot running with {} active strategies; Ctrl-C to stop",
        manager.active_count().await
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("Shutting down...");

    // Stop order: runners first (waits for in-flight actions), then the
    // reconciler, then the event queue drains. Persisted configs stay so
    // the same strategy set resumes on the next boot.
    manager.shutdown_all().await;
    let _ = reconcile_shutdown.send(true);
    let _ = reconcile_task.await;

    drop(manager);
    drop(executor);
    drop(events);
    let _ = aggregator.await;

    tracing::info!("perpbot stopped");
    Ok(())
}
