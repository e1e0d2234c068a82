//! Directional grid trading engine
//!
//! A grid bot places a ladder of limit orders around a reference price and
//! re-arms each level's neighbour when it fills. The direction (long, short
//! or neutral) decides whether an initial position is opened and which side
//! of the ladder takes profit.
//!
//! # Architecture
//!
//! - [`config`] - Bot and engine configuration with validation
//! - [`types`] - Core data types (GridLevel, Order, Fill, EngineState, ...)
//! - [`errors`] - Error classes and the engine error type
//! - [`planner`] - Level layout, sizing and re-entry mapping (pure)
//! - [`ledger`] - Order/fill ledger with reconciliation
//! - [`accountant`] - Net position and P&L
//! - [`executor`] - Venue boundary, retries and rate limiting (mockable)
//! - [`paper`] - Simulated venue
//! - [`state`] - Persistence of bot state
//! - [`events`] - Trade and alert events
//! - [`engine`] - Lifecycle state machine
//! - [`runner`] - Event loop and control handle
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use directional_grid::grid::{
//!     BotConfig, Direction, EngineConfig, GridEngine, GridRunner, PaperExchange, RunnerConfig,
//! };
//!
//! // $50k, 10 levels over a 2% range, half the capital in an initial long
//! let config = BotConfig::new("BTCUSDT", 50_000.0, 10, 2.0, Direction::Long)
//!     .with_leverage(2)
//!     .with_initial_position_pct(50.0);
//!
//! let venue = Arc::new(PaperExchange::new("BTCUSDT", 100_000.0));
//! let engine = GridEngine::new("btc-long", venue, EngineConfig::default());
//! let (summary, handle, task) =
//!     GridRunner::launch(engine, config, RunnerConfig::default()).await?;
//!
//! let status = handle.status().await?;
//! handle.stop(true).await?;
//! ```

pub mod accountant;
pub mod config;
pub mod engine;
pub mod errors;
pub mod events;
pub mod executor;
pub mod ledger;
pub mod paper;
pub mod planner;
pub mod runner;
pub mod state;
pub mod types;

// Re-export commonly used types
pub use accountant::{PositionAccountant, PositionSnapshot};
pub use self::config::{BotConfig, EngineConfig, SymbolPrecision};
pub use engine::{BotStatusReport, FillOutcome, GridEngine, ReconcileSummary, StartSummary, StopSummary};
pub use errors::{ErrorClass, GridError, GridResult};
pub use events::{AlertEvent, AlertSeverity, ErrorRecord, EventSink, EventStreams, TradeEvent};
pub use executor::{CancelOutcome, ExchangeGateway, GatewayError, OrderExecutor};
pub use ledger::{OrderLedger, ReconcileReport};
pub use paper::PaperExchange;
pub use planner::{GridPlanner, ReentryTarget};
pub use runner::{EngineHandle, GridRunner, RunnerConfig};
pub use state::{JsonFileStore, MemoryStore, PersistedBot, StateStore};
pub use types::{
    ContractType, Direction, EngineState, Fill, GridLevel, LevelRole, LevelState, Order,
    OrderRequest, OrderSide, OrderStatus, OrderType, VenueOrder,
};
