//! Bot and engine configuration

use serde::{Deserialize, Serialize};

use super::errors::{GridError, GridResult};
use super::types::{ContractType, Direction, EPSILON};

/// Highest leverage accepted by `validate`
pub const MAX_LEVERAGE: u32 = 125;

/// Venue trading filters for a symbol
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SymbolPrecision {
    /// Minimum price increment
    #[serde(default = "default_tick_size")]
    pub tick_size: f64,
    /// Minimum size increment
    #[serde(default = "default_lot_size")]
    pub lot_size: f64,
    /// Smallest order size the venue accepts
    #[serde(default = "default_lot_size")]
    pub min_qty: f64,
}

fn default_tick_size() -> f64 {
    0.01
}

fn default_lot_size() -> f64 {
    0.0001
}

impl Default for SymbolPrecision {
    fn default() -> Self {
        Self {
            tick_size: default_tick_size(),
            lot_size: default_lot_size(),
            min_qty: default_lot_size(),
        }
    }
}

impl SymbolPrecision {
    pub fn new(tick_size: f64, lot_size: f64, min_qty: f64) -> Self {
        Self {
            tick_size,
            lot_size,
            min_qty,
        }
    }

    /// Round a price to the nearest tick
    pub fn round_price(&self, price: f64) -> f64 {
        snap(price, self.tick_size, (price / self.tick_size).round())
    }

    /// Round a size down to the lot size
    pub fn round_size(&self, size: f64) -> f64 {
        snap(size, self.lot_size, (size / self.lot_size + EPSILON).floor())
    }

    pub fn validate(&self) -> GridResult<()> {
        if self.tick_size <= 0.0 || self.lot_size <= 0.0 || self.min_qty < 0.0 {
            return Err(GridError::Configuration(
                "tick_size and lot_size must be positive, min_qty non-negative".into(),
            ));
        }
        Ok(())
    }
}

/// Multiply back to a step multiple and clean the float tail
fn snap(value: f64, step: f64, units: f64) -> f64 {
    if step <= 0.0 {
        return value;
    }
    let decimals = step_decimals(step);
    let factor = 10f64.powi(decimals as i32);
    (units * step * factor).round() / factor
}

/// Number of decimal places needed to represent `step`
fn step_decimals(step: f64) -> u32 {
    (0..=12)
        .find(|d| {
            let scaled = step * 10f64.powi(*d as i32);
            (scaled - scaled.round()).abs() < 1e-7
        })
        .unwrap_or(12)
}

/// Immutable configuration of one bot run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotConfig {
    /// Symbol to trade (e.g., "BTCUSDT")
    pub symbol: String,

    /// Capital committed to the bot, in quote currency
    pub capital: f64,

    /// Number of grid levels
    pub grid_count: u32,

    /// Explicit lower bound (overrides range_pct together with upper_price)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lower_price: Option<f64>,

    /// Explicit upper bound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upper_price: Option<f64>,

    /// Full range width as a percentage of the reference price
    /// (bounds = reference ± reference × range_pct / 100 / 2)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_pct: Option<f64>,

    pub direction: Direction,

    #[serde(default = "default_leverage")]
    pub leverage: u32,

    /// Share of capital used as margin for the initial directional position
    #[serde(default)]
    pub initial_position_pct: f64,

    #[serde(default)]
    pub contract_type: ContractType,

    #[serde(default)]
    pub precision: SymbolPrecision,
}

fn default_leverage() -> u32 {
    1
}

impl BotConfig {
    /// Create a configuration using a percentage range around the reference price
    pub fn new(
        symbol: impl Into<String>,
        capital: f64,
        grid_count: u32,
        range_pct: f64,
        direction: Direction,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            capital,
            grid_count,
            lower_price: None,
            upper_price: None,
            range_pct: Some(range_pct),
            direction,
            leverage: default_leverage(),
            initial_position_pct: 0.0,
            contract_type: ContractType::default(),
            precision: SymbolPrecision::default(),
        }
    }

    /// Builder: set explicit bounds
    pub fn with_bounds(mut self, lower: f64, upper: f64) -> Self {
        self.lower_price = Some(lower);
        self.upper_price = Some(upper);
        self
    }

    pub fn with_leverage(mut self, leverage: u32) -> Self {
        self.leverage = leverage;
        self
    }

    pub fn with_initial_position_pct(mut self, pct: f64) -> Self {
        self.initial_position_pct = pct;
        self
    }

    pub fn with_contract_type(mut self, contract_type: ContractType) -> Self {
        self.contract_type = contract_type;
        self
    }

    pub fn with_precision(mut self, precision: SymbolPrecision) -> Self {
        self.precision = precision;
        self
    }

    /// Capital left for grid levels after the initial position margin
    pub fn allocated_capital(&self) -> f64 {
        self.capital * (1.0 - self.initial_position_pct / 100.0)
    }

    /// Margin used by the initial directional position
    pub fn initial_position_margin(&self) -> f64 {
        self.capital * self.initial_position_pct / 100.0
    }

    /// Capital backing each level
    pub fn capital_per_level(&self) -> f64 {
        self.allocated_capital() / self.grid_count.max(1) as f64
    }

    /// Validate the configuration
    pub fn validate(&self) -> GridResult<()> {
        if self.symbol.is_empty() {
            return Err(GridError::Configuration("symbol cannot be empty".into()));
        }

        if !(self.capital > 0.0) {
            return Err(GridError::Configuration("capital must be positive".into()));
        }

        if self.grid_count < 1 {
            return Err(GridError::Configuration(
                "grid_count must be at least 1".into(),
            ));
        }

        if self.leverage == 0 || self.leverage > MAX_LEVERAGE {
            return Err(GridError::Configuration(format!(
                "leverage must be between 1 and {}",
                MAX_LEVERAGE
            )));
        }

        if !(0.0..100.0).contains(&self.initial_position_pct) {
            return Err(GridError::Configuration(
                "initial_position_pct must be in [0, 100)".into(),
            ));
        }

        if self.direction == Direction::Neutral && self.initial_position_pct > 0.0 {
            return Err(GridError::Configuration(
                "neutral grids do not take an initial position".into(),
            ));
        }

        match (self.lower_price, self.upper_price, self.range_pct) {
            (Some(lower), Some(upper), _) => {
                if lower <= 0.0 {
                    return Err(GridError::Configuration(
                        "lower_price must be positive".into(),
                    ));
                }
                if lower >= upper {
                    return Err(GridError::Configuration(
                        "lower_price must be less than upper_price".into(),
                    ));
                }
            }
            (None, None, Some(pct)) => {
                if !(pct > 0.0 && pct < 200.0) {
                    return Err(GridError::Configuration(
                        "range_pct must be in (0, 200)".into(),
                    ));
                }
            }
            _ => {
                return Err(GridError::Configuration(
                    "either both lower_price/upper_price or range_pct is required".into(),
                ));
            }
        }

        self.precision.validate()
    }
}

/// Engine tuning: retries, rate limits and housekeeping intervals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum attempts per exchange request (including the first)
    #[serde(default = "default_max_retries")]
    pub max_order_retries: u32,

    /// Base delay for exponential backoff (milliseconds)
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,

    /// Backoff cap (milliseconds)
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_ms: u64,

    /// Maximum concurrent exchange requests
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Minimum spacing between request starts (milliseconds)
    #[serde(default = "default_min_request_spacing")]
    pub min_request_spacing_ms: u64,

    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,

    #[serde(default = "default_save_interval")]
    pub state_save_interval_secs: u64,

    /// Number of errors kept in the status record
    #[serde(default = "default_error_history")]
    pub error_history_limit: usize,
}

fn default_max_retries() -> u32 {
    4
}

fn default_retry_base_delay() -> u64 {
    100
}

fn default_retry_max_delay() -> u64 {
    2_000
}

fn default_max_in_flight() -> usize {
    4
}

fn default_min_request_spacing() -> u64 {
    50
}

fn default_reconcile_interval() -> u64 {
    30
}

fn default_save_interval() -> u64 {
    30
}

fn default_error_history() -> usize {
    50
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_order_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay(),
            retry_max_delay_ms: default_retry_max_delay(),
            max_in_flight: default_max_in_flight(),
            min_request_spacing_ms: default_min_request_spacing(),
            reconcile_interval_secs: default_reconcile_interval(),
            state_save_interval_secs: default_save_interval(),
            error_history_limit: default_error_history(),
        }
    }
}

impl EngineConfig {
    /// Builder: set retry parameters
    pub fn with_retry_config(mut self, max_retries: u32, base_delay_ms: u64) -> Self {
        self.max_order_retries = max_retries;
        self.retry_base_delay_ms = base_delay_ms;
        self
    }

    /// Builder: set rate limits
    pub fn with_rate_limit(mut self, max_in_flight: usize, min_spacing_ms: u64) -> Self {
        self.max_in_flight = max_in_flight;
        self.min_request_spacing_ms = min_spacing_ms;
        self
    }
}
