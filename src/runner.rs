use std::f64::consts::PI;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use log::{error, info, warn};
use tokio::task::JoinHandle;

use crate::config::{PaperConfig, Settings};
use crate::grid::{
    AlertSeverity, BotStatusReport, EngineState, EventSink, EventStreams, GridEngine, GridRunner,
    JsonFileStore, PaperExchange, RunnerConfig, StateStore,
};

/// Runner for the grid bot on the paper venue
pub struct BotRunner {
    config: Settings,
}

impl BotRunner {
    /// Create a new runner from a configuration file
    pub fn new(config_path: impl AsRef<Path>) -> Result<Self, crate::config::ConfigError> {
        let path = config_path.as_ref().to_string_lossy();
        let config = Settings::new(&path)?;
        Ok(Self { config })
    }

    pub fn from_settings(config: Settings) -> Self {
        Self { config }
    }

    /// Run the bot until Ctrl-C or until the engine stops on its own
    pub async fn run(self) -> Result<BotStatusReport, Box<dyn std::error::Error>> {
        // 1. Setup Logging
        if std::env::var("RUST_LOG").is_err() {
            std::env::set_var("RUST_LOG", &self.config.log.level);
        }
        env_logger::try_init().ok();

        let bot_id = self.config.bot_id.clone();
        let bot = self.config.bot.clone();
        info!(
            "Starting {} on {}: {:?}, {} levels, capital {}",
            bot_id, bot.symbol, bot.direction, bot.grid_count, bot.capital
        );

        // 2. Venue, store and event journal
        let venue = Arc::new(PaperExchange::new(&bot.symbol, self.config.paper.initial_price));
        let store: Arc<dyn StateStore> = Arc::new(JsonFileStore::new(&self.config.state.dir));
        let (sink, streams) = EventSink::channels();
        let journal = spawn_journal(streams);

        let runner_config = RunnerConfig::from_engine_config(&self.config.engine);
        let saved = if self.config.state.resume {
            store.load(&bot_id).await?
        } else {
            None
        };

        // 3. Resume or start fresh
        let (handle, task) = match saved {
            Some(saved) => {
                info!("Found saved state for {} ({})", bot_id, saved.state);
                let engine = GridEngine::resume(
                    bot_id.as_str(),
                    venue.clone(),
                    self.config.engine.clone(),
                    store.clone(),
                    sink,
                )
                .await?;
                match engine.state() {
                    EngineState::Running => GridRunner::attach(engine, runner_config).await,
                    EngineState::Error => {
                        return Err(format!(
                            "bot {} halted in error state; inspect {} before restarting",
                            bot_id, self.config.state.dir
                        )
                        .into())
                    }
                    _ => {
                        let (summary, handle, task) =
                            GridRunner::launch(engine, bot, runner_config).await?;
                        info!("Restarted: {:?}", summary);
                        (handle, task)
                    }
                }
            }
            None => {
                let engine = GridEngine::new(bot_id.as_str(), venue.clone(), self.config.engine.clone())
                    .with_store(store.clone())
                    .with_events(sink);
                let (summary, handle, task) = GridRunner::launch(engine, bot, runner_config).await?;
                info!("Started: {:?}", summary);
                (handle, task)
            }
        };

        // 4. Drive the simulated market
        let price_path = spawn_price_path(venue.clone(), self.config.paper.clone());

        // 5. Wait for Ctrl-C or the engine to finish
        let mut task = task;
        let status = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, stopping {}", bot_id);
                match handle.stop(self.config.state.close_on_exit).await {
                    Ok(summary) => info!("Stop summary: {:?}", summary),
                    Err(e) => error!("Stop failed: {}", e),
                }
                drop(handle);
                (&mut task).await?
            }
            status = &mut task => status?,
        };

        price_path.abort();
        journal.abort();
        print_summary(&status);
        Ok(status)
    }
}

/// Deterministic sine-wave mark price
fn paper_price(config: &PaperConfig, elapsed: Duration) -> f64 {
    let phase = 2.0 * PI * elapsed.as_secs_f64() / config.period_secs as f64;
    config.initial_price * (1.0 + config.amplitude_pct / 100.0 * phase.sin())
}

fn spawn_price_path(venue: Arc<PaperExchange>, config: PaperConfig) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start = tokio::time::Instant::now();
        let mut ticker = tokio::time::interval(Duration::from_millis(config.tick_ms));
        loop {
            ticker.tick().await;
            let price = paper_price(&config, start.elapsed());
            let fills = venue.set_price(price).await;
            if !fills.is_empty() {
                info!("Paper venue filled {} orders at {:.2}", fills.len(), price);
            }
        }
    })
}

/// Log trades and alerts as they happen
fn spawn_journal(mut streams: EventStreams) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(trade) = streams.trades.recv() => {
                    info!(
                        "[{}] TRADE {} {:?} {} @ {} level={:?} pnl={:.6} pos={}",
                        trade.bot_id,
                        format_millis(trade.timestamp),
                        trade.side,
                        trade.size,
                        trade.price,
                        trade.level_index,
                        trade.realized_pnl,
                        trade.position_after
                    );
                }
                Some(alert) = streams.alerts.recv() => match alert.severity {
                    AlertSeverity::Info => info!("[{}] {}", alert.bot_id, alert.message),
                    AlertSeverity::Warning => warn!("[{}] {:?}: {}", alert.bot_id, alert.class, alert.message),
                    AlertSeverity::Critical => error!(
                        "[{}] {:?}: {} (trading halted)",
                        alert.bot_id, alert.class, alert.message
                    ),
                },
                else => break,
            }
        }
    })
}

fn format_millis(millis: u64) -> String {
    Utc.timestamp_millis_opt(millis as i64)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| millis.to_string())
}

fn print_summary(status: &BotStatusReport) {
    info!("==================== SUMMARY ====================");
    info!("Bot:            {} ({})", status.bot_id, status.state);
    if let (Some(start), Some(stop)) = (status.started_at, status.stopped_at) {
        info!("Ran from {} to {}", format_millis(start), format_millis(stop));
    }
    info!("Fills:          {}", status.position.fill_count);
    info!("Round trips:    {}", status.round_trips);
    info!("Volume:         {:.2}", status.volume);
    info!("Net position:   {}", status.position.net_size);
    info!("Realized P&L:   {:.6}", status.realized_pnl);
    info!("Unrealized P&L: {:.6}", status.unrealized_pnl);
    if let Some(class) = status.last_error_class {
        info!("Last error:     {:?} ({} recorded)", class, status.recent_errors.len());
    }
    info!("=================================================");
}
