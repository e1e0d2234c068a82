//! Grid engine - the lifecycle state machine of one bot
//!
//! The engine owns the level set, the order ledger and the position
//! accountant, and drives the venue through an `OrderExecutor`. It is not
//! internally synchronized: a single consumer (see `runner`) calls into it.

use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use super::accountant::{PositionAccountant, PositionSnapshot};
use super::config::{BotConfig, EngineConfig};
use super::errors::{ErrorClass, GridError, GridResult};
use super::events::{AlertEvent, ErrorRecord, EventSink, TradeEvent};
use super::executor::{CancelOutcome, ExchangeGateway, OrderExecutor};
use super::ledger::{FillCheck, OrderLedger};
use super::planner::GridPlanner;
use super::state::{PersistedBot, StateStore, STATE_VERSION};
use super::types::{
    now_millis, AckStatus, ContractType, Direction, EngineState, Fill, GridLevel, LevelRole,
    LevelState, Order, OrderAck, OrderRequest, OrderSide, OrderStatus, EPSILON,
};

/// What happened to an incoming fill
#[derive(Debug, Clone, PartialEq)]
pub enum FillOutcome {
    /// Same fill id seen before
    Duplicate,
    /// Fill exceeds the order's remaining size
    Overfill,
    /// Fill for an order the ledger does not know
    UnknownOrder,
    /// Accounted; order still partially open
    Partial { order_id: String },
    /// Accounted; no replacement (not trading, or no grid level)
    Recorded,
    /// Replacement order placed
    Replaced { level_index: u32, order_id: String },
    /// Replacement level already holds an order
    TargetOccupied { level_index: u32 },
    /// Replacement left pending for the next reconciliation
    Deferred { level_index: u32 },
    /// No level left on that side of the grid
    Exhausted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StartSummary {
    pub reference_price: f64,
    pub levels: usize,
    pub placed: usize,
    pub pending: usize,
    /// Size of the initial market order, net of any carried position
    pub initial_size: Option<f64>,
    /// Leverage-adjusted capital committed by the plan
    pub committed_capital: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StopSummary {
    pub canceled: Vec<String>,
    /// Orders that were already gone when canceled
    pub already_closed: Vec<String>,
    pub failed: Vec<String>,
    /// Size closed at market on exit
    pub closed_size: Option<f64>,
    pub net_position: f64,
    pub realized_pnl: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileSummary {
    pub adopted: usize,
    pub orphans_canceled: usize,
    pub missing_resolved: usize,
    pub fills_recovered: usize,
    pub placed: usize,
}

/// Answer to a status query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotStatusReport {
    pub bot_id: String,
    pub state: EngineState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    pub open_orders: usize,
    pub pending_levels: usize,
    pub position: PositionSnapshot,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub round_trips: u64,
    pub volume: f64,
    pub recent_errors: Vec<ErrorRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_class: Option<ErrorClass>,
    /// Whether the bot is placing orders
    pub trading_active: bool,
    /// Replacement issuance paused after a connectivity failure
    pub suspended: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<u64>,
}

/// Outcome of individual cancel requests
#[derive(Debug, Default)]
struct CancelTally {
    canceled: Vec<String>,
    not_found: Vec<String>,
    failed: Vec<(String, GridError)>,
}

/// Directional grid engine for one bot on one symbol
pub struct GridEngine<G: ExchangeGateway> {
    bot_id: String,
    executor: OrderExecutor<G>,
    engine_config: EngineConfig,
    store: Option<Arc<dyn StateStore>>,
    events: EventSink,
    planner: GridPlanner,
    config: Option<BotConfig>,
    state: EngineState,
    reference_price: f64,
    levels: Vec<GridLevel>,
    ledger: OrderLedger,
    accountant: PositionAccountant,
    errors: VecDeque<ErrorRecord>,
    last_error_class: Option<ErrorClass>,
    suspended: bool,
    started_at: Option<u64>,
    stopped_at: Option<u64>,
    /// Fills reported in placement acks, processed after the placement pass
    immediate_fills: VecDeque<Fill>,
}

impl<G: ExchangeGateway> GridEngine<G> {
    pub fn new(bot_id: impl Into<String>, gateway: Arc<G>, engine_config: EngineConfig) -> Self {
        Self {
            bot_id: bot_id.into(),
            executor: OrderExecutor::new(gateway, "", &engine_config),
            engine_config,
            store: None,
            events: EventSink::disabled(),
            planner: GridPlanner::new(),
            config: None,
            state: EngineState::Idle,
            reference_price: 0.0,
            levels: Vec::new(),
            ledger: OrderLedger::new(),
            accountant: PositionAccountant::new(Direction::Neutral, ContractType::Linear),
            errors: VecDeque::new(),
            last_error_class: None,
            suspended: false,
            started_at: None,
            stopped_at: None,
            immediate_fills: VecDeque::new(),
        }
    }

    /// Builder: persist state through this store
    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Builder: publish trade and alert events
    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn bot_id(&self) -> &str {
        &self.bot_id
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn config(&self) -> Option<&BotConfig> {
        self.config.as_ref()
    }

    pub fn levels(&self) -> &[GridLevel] {
        &self.levels
    }

    pub fn ledger(&self) -> &OrderLedger {
        &self.ledger
    }

    pub fn position(&self) -> PositionSnapshot {
        self.accountant.snapshot()
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn executor(&self) -> &OrderExecutor<G> {
        &self.executor
    }

    fn invalid_state(&self, operation: &'static str) -> GridError {
        GridError::InvalidState {
            operation,
            current_state: self.state.to_string(),
        }
    }

    fn set_state(&mut self, state: EngineState) {
        if self.state != state {
            info!("[{}] {} -> {}", self.bot_id, self.state, state);
            self.state = state;
        }
    }

    /// Attach an error to the status record and forward it as an alert
    fn record_error(&mut self, err: &GridError, trading_continues: bool) {
        self.errors.push_back(ErrorRecord::new(err));
        while self.errors.len() > self.engine_config.error_history_limit.max(1) {
            self.errors.pop_front();
        }
        self.last_error_class = Some(err.class());
        self.events
            .alert(AlertEvent::from_error(&self.bot_id, err, trading_continues));
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Start the bot: compute the grid, open the initial position, place orders
    ///
    /// Configuration problems are returned before the engine leaves its
    /// current state. Failing to open the initial position, or to place any
    /// grid order at all, moves the engine to `Error`.
    pub async fn start(&mut self, config: BotConfig) -> GridResult<StartSummary> {
        if !self.state.can_start() {
            return Err(self.invalid_state("start"));
        }
        config.validate()?;

        if !self.accountant.is_flat() {
            if self.accountant.direction() != config.direction {
                return Err(GridError::Configuration(format!(
                    "open {:?} position of {} must be closed before running {:?}",
                    self.accountant.direction(),
                    self.accountant.net_size(),
                    config.direction
                )));
            }
            if self.accountant.contract_type() != config.contract_type {
                return Err(GridError::Configuration(format!(
                    "open {:?} position of {} must be closed before switching to {:?} contracts",
                    self.accountant.contract_type(),
                    self.accountant.net_size(),
                    config.contract_type
                )));
            }
        }

        self.executor.set_symbol(&config.symbol);
        let reference = match self.executor.get_price().await {
            Ok(price) => price,
            Err(e) => {
                self.record_error(&e, false);
                return Err(e);
            }
        };

        let levels = self.planner.compute_levels(&config, reference)?;
        let held = self.accountant.net_size().abs();
        let target_size = self.planner.initial_position_size(&config, reference)?;
        let initial_size = self.planner.initial_top_up(&config, target_size, held);
        let position_size = held + initial_size.unwrap_or(0.0);
        let committed = self.planner.check_capital(
            &config,
            &levels,
            (position_size > EPSILON).then_some(position_size),
            reference,
        )?;
        if held > EPSILON {
            info!(
                "[{}] Carrying position of {}, initial order reduced to {:?}",
                self.bot_id,
                self.accountant.net_size(),
                initial_size
            );
        }

        info!(
            "[{}] Starting {:?} grid on {}: {} levels around {}, committed {:.2} of {:.2}",
            self.bot_id,
            config.direction,
            config.symbol,
            levels.len(),
            reference,
            committed,
            config.capital
        );

        // Reconfiguration keeps the position but starts a fresh order book
        if self.accountant.is_flat() {
            self.accountant = PositionAccountant::new(config.direction, config.contract_type);
        }
        self.accountant.set_mark_price(reference);
        self.ledger = OrderLedger::new();
        self.levels = levels;
        self.reference_price = reference;
        self.config = Some(config.clone());
        self.suspended = false;
        self.started_at = Some(now_millis());
        self.stopped_at = None;
        self.set_state(EngineState::Initializing);

        if let Err(e) = self.executor.set_leverage(config.leverage).await {
            error!("[{}] Setting leverage {}x failed: {}", self.bot_id, config.leverage, e);
            self.set_state(EngineState::Error);
            self.record_error(&e, false);
            self.persist().await;
            return Err(e);
        }

        if let (Some(size), Some(side)) = (initial_size, config.direction.bias_side()) {
            let request = OrderRequest::market(&config.symbol, side, size);
            info!(
                "[{}] Opening initial {:?} position of {} at market",
                self.bot_id, side, size
            );
            let result = self.executor.place(&request).await;
            if let Err(e) = self.apply_placement(None, &request, result) {
                error!("[{}] Initial position failed: {}", self.bot_id, e);
                self.set_state(EngineState::Error);
                self.record_error(&e, false);
                self.persist().await;
                return Err(e);
            }
            self.drain_immediate_fills().await;
        }

        let eligible = self.placeable_levels(self.levels.iter().map(|l| l.index).collect());
        let attempted = eligible.len();
        let (placed, last_failure) = self.place_levels(eligible).await;

        if attempted > 0 && placed == 0 {
            let err = last_failure.unwrap_or_else(|| {
                GridError::ExchangeRejection("no grid order could be placed".into())
            });
            error!("[{}] No grid order placed: {}", self.bot_id, err);
            self.set_state(EngineState::Error);
            self.record_error(&err, false);
            self.persist().await;
            return Err(err);
        }

        self.set_state(EngineState::Running);
        self.drain_immediate_fills().await;
        self.persist().await;

        let pending = self
            .levels
            .iter()
            .filter(|l| l.state == LevelState::Pending)
            .count();
        Ok(StartSummary {
            reference_price: reference,
            levels: self.levels.len(),
            placed,
            pending,
            initial_size,
            committed_capital: committed,
        })
    }

    /// Stop the bot: cancel all open orders, optionally close the position
    pub async fn stop(&mut self, close_on_exit: bool) -> GridResult<StopSummary> {
        if !self.state.can_stop() {
            return Err(self.invalid_state("stop"));
        }
        self.set_state(EngineState::Stopping);

        let tally = self.cancel_all_open().await;
        // A canceled order may have partly filled before the cancel landed
        for id in tally.not_found.iter().chain(&tally.canceled) {
            self.settle_vanished(id).await;
        }
        for (id, err) in &tally.failed {
            warn!("[{}] Cancel of {} failed: {}", self.bot_id, id, err);
        }
        let failures: Vec<GridError> = tally.failed.iter().map(|(_, e)| e.clone()).collect();
        for err in &failures {
            self.record_error(err, false);
        }

        let mut closed_size = None;
        if close_on_exit && !self.accountant.is_flat() {
            closed_size = self.close_position().await;
        }

        self.cancel_untracked_levels();

        self.stopped_at = Some(now_millis());
        if self.state == EngineState::Stopping {
            self.set_state(EngineState::Stopped);
        }
        self.persist().await;

        let snapshot = self.accountant.snapshot();
        info!(
            "[{}] Stopped: {} canceled, net position {}, realized P&L {:.6}, {} round trips",
            self.bot_id,
            tally.canceled.len(),
            snapshot.net_size,
            snapshot.realized_pnl,
            snapshot.round_trips
        );

        Ok(StopSummary {
            canceled: tally.canceled,
            already_closed: tally.not_found,
            failed: tally.failed.into_iter().map(|(id, _)| id).collect(),
            closed_size,
            net_position: snapshot.net_size,
            realized_pnl: snapshot.realized_pnl,
        })
    }

    async fn close_position(&mut self) -> Option<f64> {
        let config = self.config.clone()?;
        let net = self.accountant.net_size();
        let side = if net > 0.0 { OrderSide::Sell } else { OrderSide::Buy };
        let size = net.abs();
        let request = OrderRequest::market(&config.symbol, side, size).reduce_only(true);
        info!("[{}] Closing position: {:?} {} at market", self.bot_id, side, size);

        let result = self.executor.place(&request).await;
        match self.apply_placement(None, &request, result) {
            Ok(_) => {
                self.drain_immediate_fills().await;
                Some(size)
            }
            Err(e) => {
                error!("[{}] Failed to close position: {}", self.bot_id, e);
                self.record_error(&e, false);
                None
            }
        }
    }

    /// Move to `Error`, cancel what we can and keep the books
    async fn halt(&mut self, err: GridError) -> GridError {
        error!("[{}] Halting trading: {}", self.bot_id, err);
        self.set_state(EngineState::Error);
        self.record_error(&err, false);

        let tally = self.cancel_all_open().await;
        for (id, e) in &tally.failed {
            warn!("[{}] Best-effort cancel of {} failed: {}", self.bot_id, id, e);
            self.record_error(e, false);
        }
        for id in &tally.not_found {
            self.archive_closed(id).await;
        }
        self.cancel_untracked_levels();
        self.persist().await;
        err
    }

    /// Archive an order the venue no longer has open, without applying fills
    async fn archive_closed(&mut self, order_id: &str) {
        let status = match self.executor.order(order_id).await {
            Ok(venue) if venue.status.is_terminal() => venue.status,
            Ok(_) => return,
            Err(GridError::OrderNotFound(_)) => OrderStatus::Canceled,
            Err(e) => {
                warn!("[{}] Status query for {} failed: {}", self.bot_id, order_id, e);
                return;
            }
        };
        if self.ledger.resolve_missing(order_id, status).is_some() {
            info!("[{}] Archived closed order {} as {:?}", self.bot_id, order_id, status);
        }
    }

    /// Cancel levels whose order is gone; levels still holding an open order
    /// (failed cancel) stay open so they match the ledger
    fn cancel_untracked_levels(&mut self) {
        for level in self.levels.iter_mut() {
            let tracked = level
                .order_id
                .as_deref()
                .is_some_and(|id| self.ledger.is_open(id));
            if tracked {
                continue;
            }
            if level.state == LevelState::Open || level.state == LevelState::Pending {
                level.mark_canceled();
            }
        }
    }

    // ------------------------------------------------------------------
    // Fills
    // ------------------------------------------------------------------

    /// Process a fill event from the venue
    pub async fn on_fill(&mut self, fill: Fill) -> GridResult<FillOutcome> {
        let outcome = self.handle_fill(fill).await?;
        self.drain_immediate_fills().await;
        Ok(outcome)
    }

    async fn drain_immediate_fills(&mut self) {
        while let Some(fill) = self.immediate_fills.pop_front() {
            if let Err(e) = self.handle_fill(fill).await {
                warn!("[{}] Immediate fill failed: {}", self.bot_id, e);
            }
        }
    }

    async fn handle_fill(&mut self, mut fill: Fill) -> GridResult<FillOutcome> {
        if !self.state.accepts_fills() {
            return Err(self.invalid_state("on_fill"));
        }

        let level_index = match self.ledger.check_fill(&fill) {
            FillCheck::Accept { level_index, .. } => level_index,
            FillCheck::Duplicate => {
                debug!("[{}] Duplicate fill {} ignored", self.bot_id, fill.fill_id);
                return Ok(FillOutcome::Duplicate);
            }
            FillCheck::Overfill { remaining } => {
                warn!(
                    "[{}] Fill {} of {} exceeds remaining {} on {}, ignored",
                    self.bot_id, fill.fill_id, fill.size, remaining, fill.order_id
                );
                return Ok(FillOutcome::Overfill);
            }
            FillCheck::UnknownOrder => {
                warn!(
                    "[{}] Fill {} for unknown order {} ignored",
                    self.bot_id, fill.fill_id, fill.order_id
                );
                return Ok(FillOutcome::UnknownOrder);
            }
        };

        let realized = match self.accountant.apply_fill(&fill) {
            Ok(realized) => realized,
            Err(e) => return Err(self.halt(e).await),
        };
        fill.realized_pnl = realized;
        self.accountant.set_mark_price(fill.price);

        let record = match self.ledger.record_fill(&fill) {
            Ok(record) => record,
            Err(e) => return Err(self.halt(e).await),
        };

        info!(
            "[{}] Fill {:?} {} @ {} (order {}, level {:?}) realized {:.6}, position {}",
            self.bot_id,
            fill.side,
            fill.size,
            fill.price,
            fill.order_id,
            level_index,
            realized,
            self.accountant.net_size()
        );

        self.events.trade(TradeEvent {
            bot_id: self.bot_id.clone(),
            order_id: fill.order_id.clone(),
            fill_id: fill.fill_id.clone(),
            level_index,
            side: fill.side,
            price: fill.price,
            size: fill.size,
            realized_pnl: realized,
            position_after: self.accountant.net_size(),
            timestamp: fill.timestamp,
        });

        if !record.completed {
            return Ok(FillOutcome::Partial {
                order_id: fill.order_id,
            });
        }

        let Some(index) = level_index else {
            return Ok(FillOutcome::Recorded);
        };
        let Some(level) = self.levels.get_mut(index as usize) else {
            return Ok(FillOutcome::Recorded);
        };
        if level.order_id.as_deref() == Some(fill.order_id.as_str()) {
            level.mark_filled(record.order.avg_fill_price);
        }

        if !self.state.is_trading() {
            debug!(
                "[{}] Engine {}, no replacement for level {}",
                self.bot_id, self.state, index
            );
            return Ok(FillOutcome::Recorded);
        }

        Ok(self.place_replacement(index).await)
    }

    /// Issue the replacement order for a completely filled level
    async fn place_replacement(&mut self, filled_index: u32) -> FillOutcome {
        let Some(config) = self.config.as_ref() else {
            return FillOutcome::Recorded;
        };
        let direction = config.direction;
        let Some(filled) = self.levels.get(filled_index as usize).cloned() else {
            return FillOutcome::Recorded;
        };

        let Some(target) = self.planner.replacement_for(&self.levels, &filled, direction) else {
            self.events.alert(AlertEvent::info(
                &self.bot_id,
                format!(
                    "grid exhausted: {:?} fill at {} has no replacement level",
                    filled.side, filled.price
                ),
            ));
            return FillOutcome::Exhausted;
        };

        if let Some(existing) = self.ledger.order_for_level(target.index) {
            debug!(
                "[{}] Level {} already has order {}, no replacement",
                self.bot_id, target.index, existing.order_id
            );
            return FillOutcome::TargetOccupied {
                level_index: target.index,
            };
        }

        let count = self.levels.len() as u32;
        let paired = self
            .planner
            .compute_reentry_level(count, target.index, target.side, direction)
            .map(|t| t.index);
        if let Some(level) = self.levels.get_mut(target.index as usize) {
            level.side = target.side;
            level.role = target.role;
            level.paired_index = paired;
            level.mark_pending();
        }

        if self.suspended {
            info!(
                "[{}] Issuance suspended, level {} left pending",
                self.bot_id, target.index
            );
            return FillOutcome::Deferred {
                level_index: target.index,
            };
        }
        if !self.exposure_allows(target.index) {
            info!(
                "[{}] Take-profit at level {} exceeds position, left pending",
                self.bot_id, target.index
            );
            return FillOutcome::Deferred {
                level_index: target.index,
            };
        }

        let Some(request) = self.level_request(target.index) else {
            return FillOutcome::Deferred {
                level_index: target.index,
            };
        };
        let result = self.executor.place(&request).await;
        match self.apply_placement(Some(target.index), &request, result) {
            Ok(order_id) => {
                debug!(
                    "[{}] Replacement {:?} @ {:?} placed at level {}",
                    self.bot_id, request.side, request.price, target.index
                );
                FillOutcome::Replaced {
                    level_index: target.index,
                    order_id,
                }
            }
            Err(e) => {
                self.placement_failed(target.index, e).await;
                FillOutcome::Deferred {
                    level_index: target.index,
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Placement helpers
    // ------------------------------------------------------------------

    fn level_request(&self, index: u32) -> Option<OrderRequest> {
        let config = self.config.as_ref()?;
        let level = self.levels.get(index as usize)?;
        Some(
            OrderRequest::limit(&config.symbol, level.index, level.side, level.price, level.size)
                .reduce_only(level.role.reduce_only()),
        )
    }

    /// Position size not yet covered by open reduce-only orders
    fn reduce_only_headroom(&self) -> f64 {
        let outstanding: f64 = self
            .ledger
            .open_orders()
            .into_iter()
            .filter(|o| o.reduce_only)
            .map(|o| o.remaining())
            .sum();
        self.accountant.net_size().abs() - outstanding
    }

    /// Take-profit orders must stay covered by the current position
    fn exposure_allows(&self, index: u32) -> bool {
        !self.placeable_levels(vec![index]).is_empty()
    }

    /// Filter candidate levels down to those the position can cover,
    /// lowest index first
    fn placeable_levels(&self, candidates: Vec<u32>) -> Vec<u32> {
        let mut headroom = self.reduce_only_headroom();
        candidates
            .into_iter()
            .filter(|&index| {
                let Some(level) = self.levels.get(index as usize) else {
                    return false;
                };
                if level.role != LevelRole::TakeProfit {
                    return true;
                }
                if level.size <= headroom + EPSILON {
                    headroom -= level.size;
                    true
                } else {
                    debug!(
                        "[{}] Take-profit at level {} not covered by position",
                        self.bot_id, index
                    );
                    false
                }
            })
            .collect()
    }

    /// Book a placement result into the ledger and level set
    fn apply_placement(
        &mut self,
        level_index: Option<u32>,
        request: &OrderRequest,
        result: GridResult<OrderAck>,
    ) -> GridResult<String> {
        let ack = result?;
        let reference = request.price.unwrap_or(self.reference_price);
        let order = Order::from_request(&ack.order_id, request, reference);
        self.ledger.record_placement(order)?;

        if let Some(index) = level_index {
            if let Some(level) = self.levels.get_mut(index as usize) {
                level.mark_open(&ack.order_id);
            }
        }

        if let AckStatus::Filled {
            avg_price,
            filled_size,
        } = ack.status
        {
            self.immediate_fills.push_back(
                Fill::new(&ack.order_id, request.side, avg_price, filled_size)
                    .with_fill_id(format!("ack:{}", ack.order_id)),
            );
        }
        Ok(ack.order_id)
    }

    /// Handle an exhausted or rejected placement: level waits, alert goes out
    async fn placement_failed(&mut self, index: u32, err: GridError) {
        if err.class() == ErrorClass::InvariantViolation {
            self.halt(err).await;
            return;
        }
        if let Some(level) = self.levels.get_mut(index as usize) {
            level.mark_pending();
        }
        warn!(
            "[{}] Placement at level {} failed, left pending: {}",
            self.bot_id, index, err
        );
        if err.class() == ErrorClass::Connectivity && !self.suspended {
            warn!("[{}] Venue unreachable, suspending replacement issuance", self.bot_id);
            self.suspended = true;
        }
        self.record_error(&err, true);
    }

    /// Place orders for the given levels with bounded concurrency
    ///
    /// Returns the number placed and the last failure, if any.
    async fn place_levels(&mut self, indices: Vec<u32>) -> (usize, Option<GridError>) {
        let requests: Vec<(u32, OrderRequest)> = indices
            .into_iter()
            .filter_map(|i| self.level_request(i).map(|r| (i, r)))
            .collect();
        if requests.is_empty() {
            return (0, None);
        }

        let concurrency = self.engine_config.max_in_flight.max(1);
        let executor = &self.executor;
        let results: Vec<(u32, OrderRequest, GridResult<OrderAck>)> = stream::iter(requests)
            .map(|(index, request)| async move {
                let result = executor.place(&request).await;
                (index, request, result)
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut placed = 0;
        let mut last_failure = None;
        for (index, request, result) in results {
            match self.apply_placement(Some(index), &request, result) {
                Ok(_) => placed += 1,
                Err(e) => {
                    last_failure = Some(e.clone());
                    self.placement_failed(index, e).await;
                }
            }
        }
        (placed, last_failure)
    }

    async fn cancel_all_open(&mut self) -> CancelTally {
        let ids: Vec<String> = self
            .ledger
            .open_orders()
            .into_iter()
            .map(|o| o.order_id.clone())
            .collect();
        let concurrency = self.engine_config.max_in_flight.max(1);
        let executor = &self.executor;
        let results: Vec<(String, GridResult<CancelOutcome>)> = stream::iter(ids)
            .map(|id| async move {
                let result = executor.cancel(&id).await;
                (id, result)
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut tally = CancelTally::default();
        for (id, result) in results {
            match result {
                Ok(CancelOutcome::Canceled) => {
                    self.ledger.mark_terminal(&id, OrderStatus::Canceled);
                    self.unlink_level(&id, LevelState::Canceled);
                    tally.canceled.push(id);
                }
                Ok(CancelOutcome::NotFound) => tally.not_found.push(id),
                Err(GridError::OrderNotFound(_)) => tally.not_found.push(id),
                Err(e) => tally.failed.push((id, e)),
            }
        }
        tally.canceled.sort();
        tally.not_found.sort();
        tally
    }

    fn unlink_level(&mut self, order_id: &str, state: LevelState) {
        if let Some(level) = self
            .levels
            .iter_mut()
            .find(|l| l.order_id.as_deref() == Some(order_id))
        {
            match state {
                LevelState::Canceled => level.mark_canceled(),
                _ => level.mark_pending(),
            }
        }
    }

    /// Settle an order the venue no longer has open: recover unseen fills,
    /// then archive it with the venue's final status
    ///
    /// Returns whether a fill was recovered.
    async fn settle_vanished(&mut self, order_id: &str) -> bool {
        let venue = match self.executor.order(order_id).await {
            Ok(venue) => venue,
            Err(GridError::OrderNotFound(_)) => {
                info!("[{}] Order {} unknown to venue, marking canceled", self.bot_id, order_id);
                if self.ledger.resolve_missing(order_id, OrderStatus::Canceled).is_some() {
                    self.unlink_level(order_id, LevelState::Pending);
                }
                return false;
            }
            Err(e) => {
                warn!("[{}] Status query for {} failed: {}", self.bot_id, order_id, e);
                self.record_error(&e, true);
                return false;
            }
        };

        let mut recovered = false;
        if let Some(fill) = self.ledger.missing_fill(&venue) {
            info!(
                "[{}] Recovering unseen fill of {} on {}",
                self.bot_id, fill.size, order_id
            );
            match self.handle_fill(fill).await {
                Ok(_) => recovered = true,
                Err(e) => warn!("[{}] Recovered fill rejected: {}", self.bot_id, e),
            }
        }

        if venue.status.is_terminal() && self.ledger.is_open(order_id) {
            self.ledger.resolve_missing(order_id, venue.status);
            if venue.status != OrderStatus::Filled {
                self.unlink_level(order_id, LevelState::Pending);
            }
        }
        recovered
    }

    // ------------------------------------------------------------------
    // Reconciliation and recovery
    // ------------------------------------------------------------------

    /// Align the ledger with the venue and re-place pending levels
    pub async fn reconcile(&mut self) -> GridResult<ReconcileSummary> {
        if self.state != EngineState::Running {
            return Err(self.invalid_state("reconcile"));
        }

        let snapshot = match self.executor.open_orders().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                if e.class() == ErrorClass::Connectivity {
                    self.suspended = true;
                }
                self.record_error(&e, true);
                return Err(e);
            }
        };

        let tolerance = self.level_step() / 2.0;
        let report = self.ledger.reconcile(&snapshot, &self.levels, tolerance);
        let mut summary = ReconcileSummary {
            adopted: report.adopted.len(),
            ..Default::default()
        };

        for (order_id, index) in &report.adopted {
            if let Some(level) = self.levels.get_mut(*index as usize) {
                level.mark_open(order_id);
            }
        }

        for order_id in &report.missing {
            if self.settle_vanished(order_id).await {
                summary.fills_recovered += 1;
            }
            if !self.ledger.is_open(order_id) {
                summary.missing_resolved += 1;
            }
            if self.state != EngineState::Running {
                return Ok(summary);
            }
        }

        for order_id in self.ledger.orphaned_ids() {
            match self.executor.cancel(&order_id).await {
                Ok(_) | Err(GridError::OrderNotFound(_)) => {
                    info!("[{}] Canceled orphaned order {}", self.bot_id, order_id);
                    self.ledger.release_orphan(&order_id);
                    summary.orphans_canceled += 1;
                }
                Err(e) => {
                    warn!("[{}] Cancel of orphan {} failed: {}", self.bot_id, order_id, e);
                    self.record_error(&e, true);
                }
            }
        }

        // Levels whose order vanished without filling go back on the book
        for level in self.levels.iter_mut() {
            let tracked = level
                .order_id
                .as_deref()
                .is_some_and(|id| self.ledger.is_open(id));
            if level.state == LevelState::Open && !tracked {
                level.mark_pending();
            }
        }

        if !self.suspended {
            let pending: Vec<u32> = self
                .levels
                .iter()
                .filter(|l| l.state == LevelState::Pending)
                .filter(|l| self.ledger.order_for_level(l.index).is_none())
                .map(|l| l.index)
                .collect();
            let pending = self.placeable_levels(pending);
            let (placed, _) = self.place_levels(pending).await;
            summary.placed = placed;
        }

        self.drain_immediate_fills().await;
        self.persist().await;

        if summary != ReconcileSummary::default() {
            info!("[{}] Reconciled: {:?}", self.bot_id, summary);
        }
        Ok(summary)
    }

    /// Smallest gap between adjacent levels
    fn level_step(&self) -> f64 {
        let step = self
            .levels
            .windows(2)
            .map(|w| w[1].price - w[0].price)
            .fold(f64::INFINITY, f64::min);
        if step.is_finite() {
            step
        } else {
            0.0
        }
    }

    /// Probe the venue; on recovery from a connectivity outage, reconcile
    pub async fn heartbeat(&mut self) -> GridResult<()> {
        match self.executor.probe_price().await {
            Ok(price) => {
                self.accountant.set_mark_price(price);
                if self.suspended {
                    info!("[{}] Venue reachable again, resuming issuance", self.bot_id);
                    self.suspended = false;
                    self.events
                        .alert(AlertEvent::info(&self.bot_id, "connectivity restored"));
                    if self.state == EngineState::Running {
                        self.reconcile().await?;
                    }
                }
                Ok(())
            }
            Err(e) => {
                if e.class() == ErrorClass::Connectivity && !self.suspended {
                    warn!("[{}] Heartbeat failed, suspending issuance: {}", self.bot_id, e);
                    self.suspended = true;
                    self.record_error(&e, true);
                }
                Err(e)
            }
        }
    }

    /// Pull fills from the venue when no stream is available
    pub async fn poll_fills(&mut self) -> GridResult<usize> {
        let fills = self.executor.poll_fills().await?;
        let count = fills.len();
        for fill in fills {
            self.on_fill(fill).await?;
        }
        Ok(count)
    }

    /// Status snapshot; valid in any state
    pub fn status(&self) -> BotStatusReport {
        let position = self.accountant.snapshot();
        BotStatusReport {
            bot_id: self.bot_id.clone(),
            state: self.state,
            symbol: self.config.as_ref().map(|c| c.symbol.clone()),
            open_orders: self.ledger.open_count(),
            pending_levels: self
                .levels
                .iter()
                .filter(|l| l.state == LevelState::Pending)
                .count(),
            realized_pnl: position.realized_pnl,
            unrealized_pnl: position.unrealized_pnl,
            round_trips: position.round_trips,
            volume: position.volume,
            position,
            recent_errors: self.errors.iter().cloned().collect(),
            last_error_class: self.last_error_class,
            trading_active: self.state.is_trading() && !self.suspended,
            suspended: self.suspended,
            started_at: self.started_at,
            stopped_at: self.stopped_at,
        }
    }

    fn persisted(&self) -> Option<PersistedBot> {
        let config = self.config.clone()?;
        Some(PersistedBot {
            version: STATE_VERSION,
            bot_id: self.bot_id.clone(),
            config,
            state: self.state,
            reference_price: self.reference_price,
            levels: self.levels.clone(),
            ledger: self.ledger.snapshot(),
            position: self.accountant.snapshot(),
            started_at: self.started_at,
            stopped_at: self.stopped_at,
            errors: self.errors.iter().cloned().collect(),
            last_updated: now_millis(),
        })
    }

    /// Save state through the store; failures are reported, not fatal
    pub async fn persist(&mut self) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let Some(snapshot) = self.persisted() else {
            return;
        };
        if let Err(e) = store.save(&self.bot_id, &snapshot).await {
            warn!("[{}] Failed to persist state: {}", self.bot_id, e);
            self.record_error(&e, true);
        }
    }

    /// Rebuild an engine from persisted state and reconcile it with the venue
    pub async fn resume(
        bot_id: impl Into<String>,
        gateway: Arc<G>,
        engine_config: EngineConfig,
        store: Arc<dyn StateStore>,
        events: EventSink,
    ) -> GridResult<Self> {
        let bot_id = bot_id.into();
        let persisted = store.load(&bot_id).await?.ok_or_else(|| {
            GridError::StatePersistence(format!("no persisted state for bot {}", bot_id))
        })?;
        persisted.validate(&bot_id)?;

        let mut engine = Self::new(bot_id, gateway, engine_config)
            .with_store(store)
            .with_events(events);
        let interrupted_stop = persisted.state == EngineState::Stopping;
        engine.restore(persisted);

        info!(
            "[{}] Resumed in {} with {} levels, {} open orders, position {}",
            engine.bot_id,
            engine.state,
            engine.levels.len(),
            engine.ledger.open_count(),
            engine.accountant.net_size()
        );

        if interrupted_stop {
            engine.stop(false).await?;
        } else if engine.state == EngineState::Running {
            if let Err(e) = engine.reconcile().await {
                warn!("[{}] Reconcile after resume failed: {}", engine.bot_id, e);
            }
        }
        Ok(engine)
    }

    fn restore(&mut self, persisted: PersistedBot) {
        self.executor.set_symbol(&persisted.config.symbol);
        self.accountant =
            PositionAccountant::from_snapshot(&persisted.position, persisted.config.contract_type);
        self.ledger = OrderLedger::from_snapshot(persisted.ledger);
        self.levels = persisted.levels;
        self.reference_price = persisted.reference_price;
        self.started_at = persisted.started_at;
        self.stopped_at = persisted.stopped_at;
        self.errors = persisted.errors.into_iter().collect();
        self.last_error_class = self.errors.back().map(|e| e.class);
        self.config = Some(persisted.config);

        // Level links follow the ledger, which is authoritative
        for level in self.levels.iter_mut() {
            match self.ledger.order_for_level(level.index) {
                Some(order) => {
                    if level.order_id.as_deref() != Some(order.order_id.as_str()) {
                        level.side = order.side;
                    }
                    level.mark_open(order.order_id.clone());
                }
                None if level.state == LevelState::Open => level.mark_pending(),
                None => {}
            }
        }

        self.state = match persisted.state {
            EngineState::Initializing | EngineState::Running | EngineState::Stopping => {
                EngineState::Running
            }
            other => other,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::events::{AlertSeverity, EventStreams};
    use crate::grid::executor::mock::MockExchange;
    use crate::grid::executor::GatewayError;
    use crate::grid::state::MemoryStore;
    use crate::grid::types::{OrderType, VenueOrder};

    fn fast_engine_config() -> EngineConfig {
        EngineConfig::default()
            .with_retry_config(4, 1)
            .with_rate_limit(4, 0)
    }

    fn scenario_config() -> BotConfig {
        BotConfig::new("BTCUSDT", 50_000.0, 10, 2.0, Direction::Long)
            .with_leverage(2)
            .with_initial_position_pct(50.0)
    }

    /// Three levels: buys at 96 and 98, sell at 102
    fn three_level_config() -> BotConfig {
        BotConfig::new("BTCUSDT", 3_000.0, 3, 2.0, Direction::Neutral).with_bounds(96.0, 102.0)
    }

    fn engine(mock: &Arc<MockExchange>) -> (GridEngine<MockExchange>, EventStreams) {
        let (sink, streams) = EventSink::channels();
        let engine = GridEngine::new("bot-1", mock.clone(), fast_engine_config()).with_events(sink);
        (engine, streams)
    }

    fn level_order(engine: &GridEngine<MockExchange>, price: f64) -> String {
        engine
            .levels()
            .iter()
            .find(|l| (l.price - price).abs() < EPSILON)
            .and_then(|l| l.order_id.clone())
            .unwrap()
    }

    #[tokio::test]
    async fn test_start_long_scenario() {
        let mock = Arc::new(MockExchange::new(100_000.0));
        let (mut engine, _streams) = engine(&mock);

        let summary = engine.start(scenario_config()).await.unwrap();
        assert_eq!(engine.state(), EngineState::Running);
        assert_eq!(summary.levels, 10);
        assert_eq!(summary.placed, 10);
        assert_eq!(summary.initial_size, Some(0.5));
        assert!(summary.committed_capital <= 50_000.0 + 1e-6);

        let placed = mock.placed_orders().await;
        // Initial market buy goes first
        assert_eq!(placed[0].order_type, OrderType::Market);
        assert_eq!(placed[0].side, OrderSide::Buy);
        assert!((placed[0].size * 100_000.0 - 50_000.0).abs() < 1e-6);

        let mut sells: Vec<f64> = placed.iter().filter(|r| r.side == OrderSide::Sell).filter_map(|r| r.price).collect();
        sells.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(sells, vec![100_200.0, 100_400.0, 100_600.0, 100_800.0, 101_000.0]);
        assert!(placed.iter().filter(|r| r.side == OrderSide::Sell).all(|r| r.reduce_only));

        let status = engine.status();
        assert_eq!(status.open_orders, 10);
        assert!((status.position.net_size - 0.5).abs() < EPSILON);
        assert!(status.trading_active);
    }

    #[tokio::test]
    async fn test_sell_fill_places_buy_below() {
        let mock = Arc::new(MockExchange::new(100_000.0));
        let (mut engine, mut streams) = engine(&mock);
        engine.start(scenario_config()).await.unwrap();

        // Free the buy level at 99,800 so the replacement is not blocked
        let buy_id = level_order(&engine, 99_800.0);
        let buy_fill = mock.fill_order(&buy_id, None).await.unwrap();
        let outcome = engine.on_fill(buy_fill).await.unwrap();
        assert_eq!(outcome, FillOutcome::TargetOccupied { level_index: 5 });

        let entry = engine.position().avg_entry_price;
        let sell_id = level_order(&engine, 100_200.0);
        let sell_fill = mock.fill_order(&sell_id, None).await.unwrap();
        let size = sell_fill.size;
        let outcome = engine.on_fill(sell_fill).await.unwrap();

        match outcome {
            FillOutcome::Replaced { level_index, .. } => assert_eq!(level_index, 4),
            other => panic!("unexpected outcome {:?}", other),
        }
        let last = mock.placed_orders().await.last().cloned().unwrap();
        assert_eq!(last.side, OrderSide::Buy);
        assert_eq!(last.price, Some(99_800.0));
        assert!(!last.reduce_only);

        let mut trades = Vec::new();
        while let Ok(t) = streams.trades.try_recv() {
            trades.push(t);
        }
        let sell_trade = trades.iter().find(|t| t.order_id == sell_id).unwrap();
        assert!((sell_trade.realized_pnl - (100_200.0 - entry) * size).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_replacement_skipped_when_level_open() {
        let mock = Arc::new(MockExchange::new(100_000.0));
        let (mut engine, _streams) = engine(&mock);
        engine.start(scenario_config()).await.unwrap();
        let before = mock.placed_orders().await.len();

        let sell_id = level_order(&engine, 100_200.0);
        let fill = mock.fill_order(&sell_id, None).await.unwrap();
        let outcome = engine.on_fill(fill).await.unwrap();

        assert_eq!(outcome, FillOutcome::TargetOccupied { level_index: 4 });
        assert_eq!(mock.placed_orders().await.len(), before);
    }

    #[tokio::test]
    async fn test_connectivity_failure_leaves_level_pending() {
        let mock = Arc::new(MockExchange::new(100_000.0));
        let (mut engine, mut streams) = engine(&mock);
        engine.start(scenario_config()).await.unwrap();

        let buy_id = level_order(&engine, 99_800.0);
        let fill = mock.fill_order(&buy_id, None).await.unwrap();
        engine.on_fill(fill).await.unwrap();
        let sell_id = level_order(&engine, 100_200.0);
        let fill = mock.fill_order(&sell_id, None).await.unwrap();

        let calls_before = mock.place_calls();
        mock.fail_next_places((0..4).map(|_| GatewayError::Connectivity("venue down".into())))
            .await;
        let outcome = engine.on_fill(fill).await.unwrap();

        assert_eq!(outcome, FillOutcome::Deferred { level_index: 4 });
        assert_eq!(mock.place_calls() - calls_before, 4);
        assert_eq!(engine.state(), EngineState::Running);
        assert_eq!(engine.levels()[4].state, LevelState::Pending);

        let status = engine.status();
        assert_eq!(status.last_error_class, Some(ErrorClass::Connectivity));
        assert!(status.suspended);
        assert!(!status.recent_errors.is_empty());

        let mut alerts = Vec::new();
        while let Ok(a) = streams.alerts.try_recv() {
            alerts.push(a);
        }
        let alert = alerts.iter().find(|a| a.class == Some(ErrorClass::Connectivity)).unwrap();
        assert!(alert.trading_continues);
        assert_eq!(alert.severity, AlertSeverity::Warning);

        // Recovery: heartbeat succeeds and the pending level is placed
        engine.heartbeat().await.unwrap();
        assert!(!engine.is_suspended());
        assert_eq!(engine.levels()[4].state, LevelState::Open);
        assert_eq!(engine.levels()[4].side, OrderSide::Buy);
    }

    #[tokio::test]
    async fn test_stop_cancels_and_late_fill_is_recorded() {
        let mock = Arc::new(MockExchange::new(100.0));
        let (mut engine, _streams) = engine(&mock);
        engine.start(three_level_config()).await.unwrap();
        assert_eq!(engine.status().open_orders, 3);

        let victim = level_order(&engine, 98.0);
        let summary = engine.stop(false).await.unwrap();
        assert_eq!(summary.canceled.len(), 3);
        assert_eq!(mock.cancelled_ids().await.len(), 3);
        assert_eq!(engine.state(), EngineState::Stopped);

        let placed_before = mock.placed_orders().await.len();
        let late = Fill::new(&victim, OrderSide::Buy, 98.0, engine.ledger().get(&victim).unwrap().size);
        let outcome = engine.on_fill(late).await.unwrap();

        assert_eq!(outcome, FillOutcome::Recorded);
        assert_eq!(mock.placed_orders().await.len(), placed_before);
        assert!(engine.position().net_size > 0.0);
    }

    #[tokio::test]
    async fn test_stop_recovers_fill_of_vanished_order() {
        let mock = Arc::new(MockExchange::new(100.0));
        let (mut engine, _streams) = engine(&mock);
        engine.start(three_level_config()).await.unwrap();

        let id = level_order(&engine, 102.0);
        let fill = mock.fill_order(&id, None).await.unwrap();

        let summary = engine.stop(false).await.unwrap();
        assert_eq!(summary.canceled.len(), 2);
        assert_eq!(summary.already_closed, vec![id.clone()]);
        assert!((engine.position().net_size + fill.size).abs() < EPSILON);

        // The streamed copy of the same fill is not applied twice
        assert_eq!(engine.on_fill(fill).await.unwrap(), FillOutcome::Overfill);
    }

    #[tokio::test]
    async fn test_stop_with_close_flattens_position() {
        let mock = Arc::new(MockExchange::new(100_000.0));
        let (mut engine, _streams) = engine(&mock);
        engine.start(scenario_config()).await.unwrap();

        let summary = engine.stop(true).await.unwrap();
        assert_eq!(summary.closed_size, Some(0.5));
        assert!(engine.position().net_size.abs() < EPSILON);

        let close = mock.placed_orders().await.last().cloned().unwrap();
        assert_eq!(close.order_type, OrderType::Market);
        assert_eq!(close.side, OrderSide::Sell);
        assert!(close.reduce_only);
    }

    #[tokio::test]
    async fn test_invalid_config_keeps_idle() {
        let mock = Arc::new(MockExchange::new(100.0));
        let (mut engine, _streams) = engine(&mock);

        let bad = three_level_config().with_bounds(102.0, 96.0);
        assert!(matches!(engine.start(bad).await, Err(GridError::Configuration(_))));
        assert_eq!(engine.state(), EngineState::Idle);
        assert_eq!(mock.place_calls(), 0);
    }

    #[tokio::test]
    async fn test_initial_order_failure_is_error() {
        let mock = Arc::new(MockExchange::new(100_000.0));
        let (mut engine, _streams) = engine(&mock);
        mock.fail_next_places([GatewayError::InsufficientMargin("no margin".into())]).await;

        let result = engine.start(scenario_config()).await;
        assert!(matches!(result, Err(GridError::ExchangeRejection(_))));
        assert_eq!(engine.state(), EngineState::Error);
        assert!(!engine.status().trading_active);
    }

    #[tokio::test]
    async fn test_fill_rejected_when_idle() {
        let mock = Arc::new(MockExchange::new(100.0));
        let (mut engine, _streams) = engine(&mock);
        let fill = Fill::new("x", OrderSide::Buy, 100.0, 1.0);
        assert!(matches!(
            engine.on_fill(fill).await,
            Err(GridError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_duplicate_fill_ignored() {
        let mock = Arc::new(MockExchange::new(100.0));
        let (mut engine, _streams) = engine(&mock);
        engine.start(three_level_config()).await.unwrap();

        let id = level_order(&engine, 98.0);
        let fill = mock.fill_order(&id, None).await.unwrap();
        engine.on_fill(fill.clone()).await.unwrap();
        let position = engine.position();

        assert_eq!(engine.on_fill(fill).await.unwrap(), FillOutcome::Duplicate);
        assert_eq!(engine.position(), position);
    }

    #[tokio::test]
    async fn test_partial_fill_waits_for_completion() {
        let mock = Arc::new(MockExchange::new(100.0));
        let (mut engine, _streams) = engine(&mock);
        engine.start(three_level_config()).await.unwrap();
        let placed = mock.placed_orders().await.len();

        let id = level_order(&engine, 98.0);
        let size = engine.ledger().get(&id).unwrap().size;
        let first = mock.fill_order(&id, Some(size / 2.0)).await.unwrap();
        assert!(matches!(engine.on_fill(first).await.unwrap(), FillOutcome::Partial { .. }));
        assert_eq!(mock.placed_orders().await.len(), placed);

        let rest = mock.fill_order(&id, None).await.unwrap();
        // Sell replacement at level 2 (102) is already open
        assert_eq!(
            engine.on_fill(rest).await.unwrap(),
            FillOutcome::TargetOccupied { level_index: 2 }
        );
    }

    #[tokio::test]
    async fn test_flip_halts_engine() {
        let mock = Arc::new(MockExchange::new(100_000.0));
        let (mut engine, mut streams) = engine(&mock);
        engine.start(scenario_config()).await.unwrap();

        // Free the sell level at 100,200, then let a foreign sell be adopted there
        let sell_id = level_order(&engine, 100_200.0);
        let fill = mock.fill_order(&sell_id, None).await.unwrap();
        engine.on_fill(fill).await.unwrap();

        mock.inject_order(VenueOrder {
            order_id: "big".into(),
            client_order_id: None,
            side: OrderSide::Sell,
            price: 100_200.0,
            size: 5.0,
            filled_size: 0.0,
            avg_fill_price: 0.0,
            status: OrderStatus::Open,
        })
        .await;
        let summary = engine.reconcile().await.unwrap();
        assert_eq!(summary.adopted, 1);
        assert_eq!(
            engine.ledger().order_for_level(5).map(|o| o.order_id.as_str()),
            Some("big")
        );

        let position = engine.position();
        let big_fill = mock.fill_order("big", None).await.unwrap();
        let result = engine.on_fill(big_fill).await;

        assert!(matches!(result, Err(GridError::InvariantViolation(_))));
        assert_eq!(engine.state(), EngineState::Error);
        assert_eq!(engine.position().net_size, position.net_size);
        assert_eq!(mock.open_order_count().await, 0);
        // The rejected fill's order is archived with the venue's status
        assert_eq!(engine.status().open_orders, 0);
        assert_eq!(engine.ledger().get("big").map(|o| o.status), Some(OrderStatus::Filled));
        assert!(engine.levels().iter().all(|l| l.state != LevelState::Open));

        let mut critical = false;
        while let Ok(a) = streams.alerts.try_recv() {
            critical |= a.severity == AlertSeverity::Critical && !a.trading_continues;
        }
        assert!(critical);
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let mock = Arc::new(MockExchange::new(100.0));
        let (mut engine, _streams) = engine(&mock);
        engine.start(three_level_config()).await.unwrap();

        mock.inject_order(VenueOrder {
            order_id: "foreign".into(),
            client_order_id: None,
            side: OrderSide::Sell,
            price: 150.0,
            size: 1.0,
            filled_size: 0.0,
            avg_fill_price: 0.0,
            status: OrderStatus::Open,
        })
        .await;

        let first = engine.reconcile().await.unwrap();
        assert_eq!(first.orphans_canceled, 1);

        let log_len = engine.ledger().log().len();
        let placed = mock.place_calls();
        let cancels = mock.cancelled_ids().await.len();

        let second = engine.reconcile().await.unwrap();
        assert_eq!(second, ReconcileSummary::default());
        assert_eq!(engine.ledger().log().len(), log_len);
        assert_eq!(mock.place_calls(), placed);
        assert_eq!(mock.cancelled_ids().await.len(), cancels);
    }

    #[tokio::test]
    async fn test_restart_recovery() {
        let mock = Arc::new(MockExchange::new(100_000.0));
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        {
            let (engine, _streams) = engine(&mock);
            let mut engine = engine.with_store(store.clone());
            engine.start(scenario_config()).await.unwrap();
        }

        // While the bot was down: a buy filled unseen, one order expired,
        // and a stray order appeared
        let state = store.load("bot-1").await.unwrap().unwrap();
        let filled_id = state.levels[4].order_id.clone().unwrap();
        let expired_id = state.levels[0].order_id.clone().unwrap();
        mock.fill_silently(&filled_id, None).await.unwrap();
        mock.drop_order(&expired_id).await;
        mock.inject_order(VenueOrder {
            order_id: "stray".into(),
            client_order_id: None,
            side: OrderSide::Buy,
            price: 50_000.0,
            size: 0.01,
            filled_size: 0.0,
            avg_fill_price: 0.0,
            status: OrderStatus::Open,
        })
        .await;

        let engine = GridEngine::resume(
            "bot-1",
            mock.clone(),
            fast_engine_config(),
            store.clone(),
            EventSink::disabled(),
        )
        .await
        .unwrap();

        assert_eq!(engine.state(), EngineState::Running);
        // Recovered buy fill adds to the position
        assert!(engine.position().net_size > 0.5);

        let venue_open = mock.get_open_orders("BTCUSDT").await.unwrap();
        let mut prices: Vec<f64> = venue_open.iter().map(|o| o.price).collect();
        prices.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let unique = prices.windows(2).all(|w| w[0] < w[1]);
        assert!(unique, "duplicate price levels: {:?}", prices);

        // Every venue order is tracked on a level; the stray one is gone
        assert!(venue_open.iter().all(|o| engine.ledger().is_open(&o.order_id)));
        assert!(!venue_open.iter().any(|o| o.order_id == "stray"));
        assert_eq!(engine.ledger().open_count(), venue_open.len());
        // The expired level was re-placed
        assert_eq!(engine.levels()[0].state, LevelState::Open);
        assert_ne!(engine.levels()[0].order_id.as_deref(), Some(expired_id.as_str()));
    }

    #[tokio::test]
    async fn test_restart_after_stop_allows_reconfiguration() {
        let mock = Arc::new(MockExchange::new(100.0));
        let (mut engine, _streams) = engine(&mock);
        engine.start(three_level_config()).await.unwrap();
        engine.stop(false).await.unwrap();

        let summary = engine.start(three_level_config()).await.unwrap();
        assert_eq!(summary.placed, 3);
        assert_eq!(engine.state(), EngineState::Running);
        assert!(matches!(
            engine.start(three_level_config()).await,
            Err(GridError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_restart_with_held_position_stays_within_capital() {
        let mock = Arc::new(MockExchange::new(100_000.0));
        let (mut engine, _streams) = engine(&mock);
        engine.start(scenario_config()).await.unwrap();
        engine.stop(false).await.unwrap();
        let held = engine.position().net_size;
        assert!((held - 0.5).abs() < EPSILON);

        let summary = engine.start(scenario_config()).await.unwrap();
        assert_eq!(summary.initial_size, None);
        assert!(summary.committed_capital <= 50_000.0 + 1e-6);
        // Committed capital covers the carried position, not just the levels
        assert!(summary.committed_capital > 25_000.0 + 1e-6);
        assert!((engine.position().net_size - held).abs() < EPSILON);

        let markets = mock
            .placed_orders()
            .await
            .iter()
            .filter(|r| r.order_type == OrderType::Market)
            .count();
        assert_eq!(markets, 1);

        // Margin in use: held position plus resting levels
        let levels_notional: f64 = engine.levels().iter().map(|l| l.size * l.price).sum();
        let margin = (engine.position().net_size * 100_000.0 + levels_notional) / 2.0;
        assert!(margin <= 50_000.0 + 1e-6, "margin {} exceeds capital", margin);
    }

    #[tokio::test]
    async fn test_restart_rejects_contract_type_change_with_open_position() {
        let mock = Arc::new(MockExchange::new(100_000.0));
        let (mut engine, _streams) = engine(&mock);
        engine.start(scenario_config()).await.unwrap();
        engine.stop(false).await.unwrap();
        let placed = mock.place_calls();

        let inverse = scenario_config().with_contract_type(ContractType::Inverse);
        assert!(matches!(
            engine.start(inverse).await,
            Err(GridError::Configuration(_))
        ));
        assert_eq!(engine.state(), EngineState::Stopped);
        assert_eq!(mock.place_calls(), placed);
    }

    #[tokio::test]
    async fn test_start_sets_venue_leverage() {
        let mock = Arc::new(MockExchange::new(100_000.0));
        let (mut engine, _streams) = engine(&mock);
        engine.start(scenario_config()).await.unwrap();
        assert_eq!(mock.current_leverage().await, Some(2));
    }

    #[tokio::test]
    async fn test_leverage_failure_is_error() {
        let mock = Arc::new(MockExchange::new(100_000.0));
        let (mut engine, _streams) = engine(&mock);
        mock.fail_next_leverage([GatewayError::InsufficientMargin("max 1x".into())]).await;

        let result = engine.start(scenario_config()).await;
        assert!(matches!(result, Err(GridError::ExchangeRejection(_))));
        assert_eq!(engine.state(), EngineState::Error);
        assert_eq!(mock.place_calls(), 0);
        assert_eq!(engine.status().last_error_class, Some(ErrorClass::ExchangeRejection));
    }

    #[tokio::test]
    async fn test_stop_with_failed_cancel_keeps_order_tracked() {
        let mock = Arc::new(MockExchange::new(100.0));
        let (mut engine, _streams) = engine(&mock);
        engine.start(three_level_config()).await.unwrap();
        mock.fail_next_cancels([GatewayError::Rejected("busy".into())]).await;

        let summary = engine.stop(false).await.unwrap();
        assert_eq!(engine.state(), EngineState::Stopped);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.canceled.len(), 2);

        let stuck = &summary.failed[0];
        assert!(engine.ledger().is_open(stuck));
        assert_eq!(engine.status().open_orders, 1);
        assert_eq!(mock.open_order_count().await, 1);
        for level in engine.levels() {
            let tracked = level.order_id.as_deref() == Some(stuck.as_str());
            assert_eq!(level.state == LevelState::Open, tracked, "level {:?}", level);
        }

        let status = engine.status();
        assert_eq!(status.last_error_class, Some(ErrorClass::ExchangeRejection));
        assert!(!status.recent_errors.is_empty());
    }

    #[tokio::test]
    async fn test_halt_with_failed_cancel_keeps_books_consistent() {
        let mock = Arc::new(MockExchange::new(100_000.0));
        let (mut engine, _streams) = engine(&mock);
        engine.start(scenario_config()).await.unwrap();

        let sell_id = level_order(&engine, 100_200.0);
        let fill = mock.fill_order(&sell_id, None).await.unwrap();
        engine.on_fill(fill).await.unwrap();
        mock.inject_order(VenueOrder {
            order_id: "big".into(),
            client_order_id: None,
            side: OrderSide::Sell,
            price: 100_200.0,
            size: 5.0,
            filled_size: 0.0,
            avg_fill_price: 0.0,
            status: OrderStatus::Open,
        })
        .await;
        engine.reconcile().await.unwrap();

        mock.fail_next_cancels([GatewayError::Rejected("busy".into())]).await;
        let big_fill = mock.fill_order("big", None).await.unwrap();
        assert!(engine.on_fill(big_fill).await.is_err());
        assert_eq!(engine.state(), EngineState::Error);

        // One cancel failed; exactly that order is still on the books
        assert_eq!(engine.ledger().open_count(), 1);
        for level in engine.levels() {
            let tracked = level
                .order_id
                .as_deref()
                .is_some_and(|id| engine.ledger().is_open(id));
            assert_eq!(level.state == LevelState::Open, tracked, "level {:?}", level);
        }
        let rejections = engine
            .status()
            .recent_errors
            .iter()
            .filter(|e| e.class == ErrorClass::ExchangeRejection)
            .count();
        assert_eq!(rejections, 1);
    }

    #[tokio::test]
    async fn test_heartbeat_price_failure_suspends_until_recovery() {
        let mock = Arc::new(MockExchange::new(100.0));
        let (mut engine, mut streams) = engine(&mock);
        engine.start(three_level_config()).await.unwrap();

        mock.fail_next_prices([GatewayError::Connectivity("no route".into())]).await;
        assert!(engine.heartbeat().await.is_err());
        let status = engine.status();
        assert!(status.suspended);
        assert!(!status.trading_active);
        assert_eq!(status.state, EngineState::Running);
        assert_eq!(status.last_error_class, Some(ErrorClass::Connectivity));

        engine.heartbeat().await.unwrap();
        assert!(!engine.is_suspended());
        assert!(engine.status().trading_active);

        let mut restored = false;
        while let Ok(a) = streams.alerts.try_recv() {
            restored |= a.severity == AlertSeverity::Info && a.message.contains("restored");
        }
        assert!(restored);
    }
}
