use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::api::MarketDataFeed;
use crate::dashboard::EventSender;
use crate::db::ConfigStore;
use crate::execution::{OrderExecutor, PositionStore};
use crate::models::{Mode, StrategyConfig, StrategyStatus};
use crate::risk::RiskLimits;
use crate::runner::strategy_runner::{RunnerParams, StrategyRunner};
use crate::strategy::build_decision;
use crate::Result;

/// Structured result of a start request; rejections carry a reason string
/// instead of an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartOutcome {
    pub started: bool,
    pub reason: Option<String>,
}

/// Structured result of a stop request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopOutcome {
    pub stopped: bool,
    pub remaining: usize,
    pub reason: Option<String>,
}

/// One row of `status()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveStrategy {
    pub symbol: String,
    pub mode: Mode,
    pub interval_secs: u64,
    pub started_at: DateTime<Utc>,
}

struct RunnerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
    config: StrategyConfig,
}

/// Owns the per-symbol runner tasks and the persisted strategy set.
///
/// This is the control surface: `start`/`stop`/`status` return structured
/// outcomes, and only persistence failures surface as errors (a start is
/// acknowledged strictly after its config row is committed).
pub struct StrategyManager {
    runners: Mutex<HashMap<String, RunnerHandle>>,
    feed: Arc<dyn MarketDataFeed>,
    executor: Arc<OrderExecutor>,
    store: Arc<PositionStore>,
    configs: Arc<dyn ConfigStore>,
    events: EventSender,
    limits: RiskLimits,
}

impl StrategyManager {
    pub fn new(
        feed: Arc<dyn MarketDataFeed>,
        executor: Arc<OrderExecutor>,
        store: Arc<PositionStore>,
        configs: Arc<dyn ConfigStore>,
        events: EventSender,
        limits: RiskLimits,
    ) -> Self {
        Self {
            runners: Mutex::new(HashMap::new()),
            feed,
            executor,
            store,
            configs,
            events,
            limits,
        }
    }

    /// Parse mode and runner params without side effects, so a start can
    /// be rejected before anything is persisted or spawned.
    fn validate(
        config: &StrategyConfig,
    ) -> Result<(Box<dyn crate::strategy::DecisionFunction>, RunnerParams)> {
        if config.interval_secs == 0 {
            return Err(crate::BotError::Config(
                "tick interval must be at least one second".to_string(),
            ));
        }
        let decision = build_decision(config.mode, &config.params)?;
        let params: RunnerParams = crate::strategy::parse_params(&config.params)?;
        Ok((decision, params))
    }

    fn spawn_runner(&self, config: &StrategyConfig) -> Result<RunnerHandle> {
        let (decision, params) = Self::validate(config)?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = StrategyRunner::new(
            config.symbol.clone(),
            Duration::from_secs(config.interval_secs),
            decision,
            params,
            self.feed.clone(),
            self.executor.clone(),
            self.store.clone(),
            self.events.clone(),
        );
        let join = tokio::spawn(runner.run(shutdown_rx));

        Ok(RunnerHandle {
            shutdown: shutdown_tx,
            join,
            config: config.clone(),
        })
    }

    /// Start a strategy for a symbol. The config row is committed before
    /// this returns `started: true`; a duplicate symbol, a full roster, or
    /// bad params reject with a reason.
    pub async fn start(
        &self,
        symbol: &str,
        mode: Mode,
        interval_secs: u64,
        params: serde_json::Value,
    ) -> Result<StartOutcome> {
        let mut runners = self.runners.lock().await;

        if runners.contains_key(symbol) {
            return Ok(StartOutcome {
                started: false,
                reason: Some("already_running".to_string()),
            });
        }
        if self.limits.check_strategy_count(runners.len()).is_err() {
            return Ok(StartOutcome {
                started: false,
                reason: Some("max_strategies".to_string()),
            });
        }
        if interval_secs == 0 {
            return Ok(StartOutcome {
                started: false,
                reason: Some("invalid_interval".to_string()),
            });
        }

        let config = StrategyConfig {
            symbol: symbol.to_string(),
            mode,
            interval_secs,
            params,
            started_at: Utc::now(),
            status: StrategyStatus::Running,
        };

        if let Err(e) = Self::validate(&config) {
            return Ok(StartOutcome {
                started: false,
                reason: Some(format!("invalid_params: {e}")),
            });
        }

        // Commit synchronously before spawning or acknowledging: a crash
        // between accept and ack must not lose the config, and the runner
        // must never act before its row is durable.
        self.configs.save_config(&config).await?;

        let handle = self.spawn_runner(&config)?;

        tracing::info!(
            symbol,
            mode = mode.as_str(),
            interval_secs,
            "Strategy started"
        );
        runners.insert(symbol.to_string(), handle);

        Ok(StartOutcome {
            started: true,
            reason: None,
        })
    }

    /// Stop one symbol's runner, wait for any in-flight action to resolve,
    /// then delete its persisted config.
    pub async fn stop(&self, symbol: &str) -> Result<StopOutcome> {
        let handle = {
            let mut runners = self.runners.lock().await;
            runners.remove(symbol)
        };

        let Some(handle) = handle else {
            return Ok(StopOutcome {
                stopped: false,
                remaining: self.active_count().await,
                reason: Some("not_running".to_string()),
            });
        };

        let _ = handle.shutdown.send(true);
        // Joining guarantees an in-flight close has resolved
        if let Err(e) = handle.join.await {
            tracing::error!(symbol, "Runner task join failed: {}", e);
        }

        self.configs.delete_config(symbol).await?;
        tracing::info!(symbol, "Strategy stopped");

        Ok(StopOutcome {
            stopped: true,
            remaining: self.active_count().await,
            reason: None,
        })
    }

    /// Stop every running strategy, deleting each persisted config. This
    /// is the control surface's "stop all"; process shutdown uses
    /// [`StrategyManager::shutdown_all`] instead.
    pub async fn stop_all(&self) -> Result<Vec<StopOutcome>> {
        let symbols: Vec<String> = {
            let runners = self.runners.lock().await;
            runners.keys().cloned().collect()
        };

        let mut outcomes = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            outcomes.push(self.stop(&symbol).await?);
        }
        Ok(outcomes)
    }

    /// Graceful process shutdown: cancel every runner and wait, but leave
    /// the persisted configs in place so the same set resumes on restart.
    pub async fn shutdown_all(&self) {
        let handles: Vec<(String, RunnerHandle)> = {
            let mut runners = self.runners.lock().await;
            runners.drain().collect()
        };

        for (_, handle) in &handles {
            let _ = handle.shutdown.send(true);
        }
        for (symbol, handle) in handles {
            if let Err(e) = handle.join.await {
                tracing::error!(symbol, "Runner task join failed: {}", e);
            }
        }

        tracing::info!("All strategy runners shut down");
    }

    /// Re-instantiate a runner for every persisted running config. Called
    /// once at startup; this is what lets a crashed or redeployed process
    /// resume exactly the strategies that were active.
    pub async fn restore(&self) -> Result<usize> {
        let configs = self.configs.load_running().await?;
        let mut restored = 0;

        let mut runners = self.runners.lock().await;
        for config in configs {
            if runners.contains_key(&config.symbol) {
                continue;
            }
            if self.limits.check_strategy_count(runners.len()).is_err() {
                tracing::warn!(
                    symbol = %config.symbol,
                    "Persisted strategy not restored: roster full"
                );
                continue;
            }

            match self.spawn_runner(&config) {
                Ok(handle) => {
                    runners.insert(config.symbol.clone(), handle);
                    restored += 1;
                }
                Err(e) => {
                    tracing::error!(
                        symbol = %config.symbol,
                        "Persisted strategy not restored, bad params: {}",
                        e
                    );
                }
            }
        }

        tracing::info!("Restored {} strategies from persistence", restored);
        Ok(restored)
    }

    pub async fn status(&self) -> Vec<ActiveStrategy> {
        let runners = self.runners.lock().await;
        let mut active: Vec<ActiveStrategy> = runners
            .values()
            .map(|handle| ActiveStrategy {
                symbol: handle.config.symbol.clone(),
                mode: handle.config.mode,
                interval_secs: handle.config.interval_secs,
                started_at: handle.config.started_at,
            })
            .collect();
        active.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        active
    }

    pub async fn active_count(&self) -> usize {
        self.runners.lock().await.len()
    }
}
