//! Grid runner - event loop that owns one engine
//!
//! Fills, operator commands and housekeeping timers are multiplexed onto a
//! single task so the engine never sees concurrent calls.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::config::{BotConfig, EngineConfig};
use super::engine::{BotStatusReport, GridEngine, ReconcileSummary, StartSummary, StopSummary};
use super::errors::{GridError, GridResult};
use super::executor::ExchangeGateway;
use super::types::{EngineState, Fill};

/// Runner timing
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Heartbeat and reconciliation period
    pub reconcile_interval: Duration,
    pub state_save_interval: Duration,
    pub command_buffer: usize,
}

impl RunnerConfig {
    pub fn from_engine_config(config: &EngineConfig) -> Self {
        Self {
            reconcile_interval: Duration::from_secs(config.reconcile_interval_secs.max(1)),
            state_save_interval: Duration::from_secs(config.state_save_interval_secs.max(1)),
            ..Self::default()
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(30),
            state_save_interval: Duration::from_secs(30),
            command_buffer: 16,
        }
    }
}

/// Operator requests delivered to the runner task
#[derive(Debug)]
pub enum RunnerCommand {
    Stop {
        close_on_exit: bool,
        reply: oneshot::Sender<GridResult<StopSummary>>,
    },
    Status {
        reply: oneshot::Sender<BotStatusReport>,
    },
    Reconcile {
        reply: oneshot::Sender<GridResult<ReconcileSummary>>,
    },
}

/// Cloneable control handle for a running bot
#[derive(Debug, Clone)]
pub struct EngineHandle {
    bot_id: String,
    commands: mpsc::Sender<RunnerCommand>,
}

impl EngineHandle {
    pub fn bot_id(&self) -> &str {
        &self.bot_id
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> RunnerCommand) -> GridResult<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| GridError::Channel(format!("runner for {} has exited", self.bot_id)))?;
        rx.await
            .map_err(|_| GridError::Channel(format!("runner for {} dropped the reply", self.bot_id)))
    }

    /// Stop the bot and wait for the result
    pub async fn stop(&self, close_on_exit: bool) -> GridResult<StopSummary> {
        self.request(|reply| RunnerCommand::Stop { close_on_exit, reply })
            .await?
    }

    pub async fn status(&self) -> GridResult<BotStatusReport> {
        self.request(|reply| RunnerCommand::Status { reply }).await
    }

    /// Force a reconciliation pass now
    pub async fn reconcile(&self) -> GridResult<ReconcileSummary> {
        self.request(|reply| RunnerCommand::Reconcile { reply })
            .await?
    }
}

/// Event loop around one engine
pub struct GridRunner<G: ExchangeGateway> {
    engine: GridEngine<G>,
    fills: Option<mpsc::UnboundedReceiver<Fill>>,
    commands: mpsc::Receiver<RunnerCommand>,
    config: RunnerConfig,
}

impl<G: ExchangeGateway + 'static> GridRunner<G> {
    pub fn new(
        engine: GridEngine<G>,
        fills: Option<mpsc::UnboundedReceiver<Fill>>,
        config: RunnerConfig,
    ) -> (Self, EngineHandle) {
        let (tx, rx) = mpsc::channel(config.command_buffer.max(1));
        let handle = EngineHandle {
            bot_id: engine.bot_id().to_string(),
            commands: tx,
        };
        (
            Self {
                engine,
                fills,
                commands: rx,
                config,
            },
            handle,
        )
    }

    /// Subscribe to fills, start the engine and spawn its loop
    ///
    /// The subscription is opened before any order is placed, so no fill
    /// can slip between placement and the first receive.
    pub async fn launch(
        mut engine: GridEngine<G>,
        bot_config: BotConfig,
        config: RunnerConfig,
    ) -> GridResult<(StartSummary, EngineHandle, JoinHandle<BotStatusReport>)> {
        let gateway: Arc<G> = engine.executor().gateway().clone();
        let fills = match gateway.subscribe_fills(&bot_config.symbol).await {
            Ok(rx) => Some(rx),
            Err(e) => {
                warn!("Fill stream unavailable, polling instead: {}", e);
                None
            }
        };
        let summary = engine.start(bot_config).await?;
        let (runner, handle) = Self::new(engine, fills, config);
        Ok((summary, handle, runner.spawn()))
    }

    /// Spawn the loop for an engine that is already running (e.g. resumed)
    pub async fn attach(
        engine: GridEngine<G>,
        config: RunnerConfig,
    ) -> (EngineHandle, JoinHandle<BotStatusReport>) {
        let fills = match engine.executor().subscribe_fills().await {
            Ok(rx) => Some(rx),
            Err(e) => {
                warn!("Fill stream unavailable, polling instead: {}", e);
                None
            }
        };
        let (runner, handle) = Self::new(engine, fills, config);
        (handle, runner.spawn())
    }

    pub fn spawn(self) -> JoinHandle<BotStatusReport> {
        tokio::spawn(self.run())
    }

    /// Run until stopped; returns the final status
    pub async fn run(mut self) -> BotStatusReport {
        let bot_id = self.engine.bot_id().to_string();
        info!("[{}] Runner started in {}", bot_id, self.engine.state());

        let mut housekeeping = interval_at(
            Instant::now() + self.config.reconcile_interval,
            self.config.reconcile_interval,
        );
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut save_timer = interval_at(
            Instant::now() + self.config.state_save_interval,
            self.config.state_save_interval,
        );
        save_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let fills_open = self.fills.is_some();

            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(command) => {
                        if self.handle_command(command).await {
                            break;
                        }
                    }
                    None => {
                        info!("[{}] All handles dropped, stopping", bot_id);
                        self.drain_queued_fills().await;
                        if self.engine.state().can_stop() {
                            if let Err(e) = self.engine.stop(false).await {
                                error!("[{}] Stop failed: {}", bot_id, e);
                            }
                        }
                        break;
                    }
                },

                fill = recv_fill(&mut self.fills), if fills_open => match fill {
                    Some(fill) => {
                        if let Err(e) = self.engine.on_fill(fill).await {
                            error!("[{}] Error handling fill: {}", bot_id, e);
                        }
                    }
                    None => {
                        warn!("[{}] Fill stream closed, falling back to polling", bot_id);
                        self.fills = None;
                    }
                },

                _ = housekeeping.tick() => self.housekeeping().await,

                _ = save_timer.tick() => self.engine.persist().await,
            }
        }

        let status = self.engine.status();
        info!(
            "[{}] Runner exited in {}, realized P&L {:.6}",
            bot_id, status.state, status.realized_pnl
        );
        status
    }

    /// Returns true when the loop should exit
    async fn handle_command(&mut self, command: RunnerCommand) -> bool {
        match command {
            RunnerCommand::Stop { close_on_exit, reply } => {
                self.drain_queued_fills().await;
                let result = self.engine.stop(close_on_exit).await;
                let done = result.is_ok() || !self.engine.state().can_stop();
                if reply.send(result).is_err() {
                    debug!("[{}] Stop requester went away", self.engine.bot_id());
                }
                done
            }
            RunnerCommand::Status { reply } => {
                let _ = reply.send(self.engine.status());
                false
            }
            RunnerCommand::Reconcile { reply } => {
                let _ = reply.send(self.engine.reconcile().await);
                false
            }
        }
    }

    /// Apply fills already delivered on the stream but not yet received
    async fn drain_queued_fills(&mut self) {
        let Some(rx) = self.fills.as_mut() else {
            return;
        };
        let mut queued = Vec::new();
        while let Ok(fill) = rx.try_recv() {
            queued.push(fill);
        }
        for fill in queued {
            debug!("[{}] Applying queued fill {}", self.engine.bot_id(), fill.fill_id);
            if let Err(e) = self.engine.on_fill(fill).await {
                error!("[{}] Error handling fill: {}", self.engine.bot_id(), e);
            }
        }
    }

    async fn housekeeping(&mut self) {
        let bot_id = self.engine.bot_id().to_string();
        if let Err(e) = self.engine.heartbeat().await {
            debug!("[{}] Heartbeat failed: {}", bot_id, e);
            return;
        }

        if self.fills.is_none() {
            match self.engine.poll_fills().await {
                Ok(0) => {}
                Ok(n) => info!("[{}] Polled {} fills", bot_id, n),
                Err(e) => warn!("[{}] Fill polling failed: {}", bot_id, e),
            }
            match self.engine.executor().subscribe_fills().await {
                Ok(rx) => {
                    info!("[{}] Fill stream re-established", bot_id);
                    self.fills = Some(rx);
                }
                Err(e) => debug!("[{}] Resubscribe failed: {}", bot_id, e),
            }
        }

        if self.engine.state() == EngineState::Running && !self.engine.is_suspended() {
            if let Err(e) = self.engine.reconcile().await {
                warn!("[{}] Reconciliation failed: {}", bot_id, e);
            }
        }
    }
}

async fn recv_fill(fills: &mut Option<mpsc::UnboundedReceiver<Fill>>) -> Option<Fill> {
    match fills {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::executor::mock::MockExchange;
    use crate::grid::types::{Direction, LevelState};

    fn fast_config() -> EngineConfig {
        EngineConfig::default()
            .with_retry_config(4, 1)
            .with_rate_limit(4, 0)
    }

    fn runner_config(period_ms: u64) -> RunnerConfig {
        RunnerConfig {
            reconcile_interval: Duration::from_millis(period_ms),
            state_save_interval: Duration::from_secs(60),
            command_buffer: 4,
        }
    }

    fn neutral_config() -> BotConfig {
        BotConfig::new("BTCUSDT", 3_000.0, 3, 2.0, Direction::Neutral).with_bounds(96.0, 102.0)
    }

    async fn wait_for<F>(handle: &EngineHandle, mut done: F) -> BotStatusReport
    where
        F: FnMut(&BotStatusReport) -> bool,
    {
        for _ in 0..200 {
            let status = handle.status().await.unwrap();
            if done(&status) {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_streamed_fill_and_stop() {
        let mock = Arc::new(MockExchange::new(100.0));
        let engine = GridEngine::new("bot-1", mock.clone(), fast_config());
        let (summary, handle, task) = GridRunner::launch(engine, neutral_config(), runner_config(60_000))
            .await
            .unwrap();
        assert_eq!(summary.placed, 3);

        let open = mock.get_open_orders("BTCUSDT").await.unwrap();
        let buy = open.iter().find(|o| o.price < 100.0).cloned().unwrap();
        mock.fill_order(&buy.order_id, None).await.unwrap();

        let status = wait_for(&handle, |s| s.position.fill_count == 1).await;
        assert!(status.position.net_size > 0.0);
        assert_eq!(status.state, EngineState::Running);

        let stop = handle.stop(false).await.unwrap();
        assert_eq!(stop.canceled.len(), 2);

        let final_status = task.await.unwrap();
        assert_eq!(final_status.state, EngineState::Stopped);
        assert!(handle.status().await.is_err());
    }

    #[tokio::test]
    async fn test_partial_fill_racing_stop_is_recorded() {
        let mock = Arc::new(MockExchange::new(100.0));
        let engine = GridEngine::new("bot-1", mock.clone(), fast_config());
        let (_, handle, task) = GridRunner::launch(engine, neutral_config(), runner_config(60_000))
            .await
            .unwrap();

        let open = mock.get_open_orders("BTCUSDT").await.unwrap();
        let buy = open.iter().find(|o| o.price < 100.0).cloned().unwrap();
        let half = buy.size / 2.0;
        mock.fill_order(&buy.order_id, Some(half)).await.unwrap();

        let stop = handle.stop(false).await.unwrap();
        assert_eq!(stop.canceled.len(), 3);
        assert!((stop.net_position - half).abs() < 1e-9);

        let final_status = task.await.unwrap();
        assert_eq!(final_status.state, EngineState::Stopped);
        assert_eq!(final_status.position.fill_count, 1);
        assert!((final_status.position.net_size - half).abs() < 1e-9);
        assert_eq!(final_status.open_orders, 0);
    }

    #[tokio::test]
    async fn test_polls_after_stream_loss() {
        let mock = Arc::new(MockExchange::new(100.0));
        let engine = GridEngine::new("bot-1", mock.clone(), fast_config());
        let (_, handle, task) = GridRunner::launch(engine, neutral_config(), runner_config(20))
            .await
            .unwrap();

        mock.disconnect_stream().await;
        let open = mock.get_open_orders("BTCUSDT").await.unwrap();
        let sell = open.iter().find(|o| o.price > 100.0).cloned().unwrap();
        mock.fill_order(&sell.order_id, None).await.unwrap();

        let status = wait_for(&handle, |s| s.position.fill_count == 1).await;
        assert!(status.position.net_size < 0.0);

        drop(handle);
        let final_status = task.await.unwrap();
        assert_eq!(final_status.state, EngineState::Stopped);
    }

    #[tokio::test]
    async fn test_housekeeping_replaces_vanished_order() {
        let mock = Arc::new(MockExchange::new(100.0));
        let mut engine = GridEngine::new("bot-1", mock.clone(), fast_config());
        engine.start(neutral_config()).await.unwrap();
        let expired = engine.levels()[0].order_id.clone().unwrap();
        assert_eq!(engine.levels()[0].state, LevelState::Open);

        let (handle, task) = GridRunner::attach(engine, runner_config(20)).await;
        mock.drop_order(&expired).await;

        let mut open = Vec::new();
        for _ in 0..200 {
            open = mock.get_open_orders("BTCUSDT").await.unwrap();
            if open.len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(open.len(), 3);
        assert!(open.iter().all(|o| o.order_id != expired));

        let status = wait_for(&handle, |s| s.open_orders == 3).await;
        assert_eq!(status.pending_levels, 0);

        handle.stop(false).await.unwrap();
        task.await.unwrap();
    }
}
