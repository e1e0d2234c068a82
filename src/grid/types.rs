//! Core data types for the grid engine

use serde::{Deserialize, Serialize};

/// Tolerance used for size/price comparisons
pub const EPSILON: f64 = 1e-9;

/// Current time as unix milliseconds
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Returns the opposite side
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    /// +1 for buys, -1 for sells
    pub fn sign(&self) -> f64 {
        match self {
            OrderSide::Buy => 1.0,
            OrderSide::Sell => -1.0,
        }
    }
}

/// Net exposure the bot keeps throughout operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
    Neutral,
}

impl Direction {
    /// Side that builds exposure in the bias direction
    pub fn bias_side(&self) -> Option<OrderSide> {
        match self {
            Direction::Long => Some(OrderSide::Buy),
            Direction::Short => Some(OrderSide::Sell),
            Direction::Neutral => None,
        }
    }
}

/// Contract denomination convention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContractType {
    /// Size in base-asset units, P&L in quote currency
    #[default]
    Linear,
    /// Size in contracts of one quote unit each, P&L in base asset
    Inverse,
}

impl ContractType {
    /// Quote-currency notional of `size` at `price`
    pub fn notional(&self, size: f64, price: f64) -> f64 {
        match self {
            ContractType::Linear => size * price,
            ContractType::Inverse => size,
        }
    }
}

/// Engine lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineState {
    Idle,
    Initializing,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl EngineState {
    /// Whether new replacement orders may be issued
    pub fn is_trading(&self) -> bool {
        matches!(self, EngineState::Running)
    }

    /// Whether fills are accepted at all (for accounting)
    pub fn accepts_fills(&self) -> bool {
        !matches!(self, EngineState::Idle)
    }

    pub fn can_stop(&self) -> bool {
        matches!(self, EngineState::Running | EngineState::Initializing)
    }

    pub fn can_start(&self) -> bool {
        matches!(self, EngineState::Idle | EngineState::Stopped)
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Status of an individual grid level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LevelState {
    /// No outstanding order; waiting for placement
    Pending,
    /// Order resting on the book
    Open,
    /// Order filled; waiting for the price to come back
    Filled,
    /// Order cancelled (stop or shutdown)
    Canceled,
}

/// What an order at this level does to the bot's exposure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LevelRole {
    /// Reduces exposure on the bias side (reduce-only)
    TakeProfit,
    /// Rebuilds exposure after a take-profit
    ReEntry,
    /// Plain grid order, no bias
    Neutral,
}

impl LevelRole {
    pub fn for_side(direction: Direction, side: OrderSide) -> Self {
        match direction.bias_side() {
            None => LevelRole::Neutral,
            Some(bias) if bias == side => LevelRole::ReEntry,
            Some(_) => LevelRole::TakeProfit,
        }
    }

    /// Take-profit orders may only shrink the position
    pub fn reduce_only(&self) -> bool {
        matches!(self, LevelRole::TakeProfit)
    }
}

/// Individual grid level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridLevel {
    /// Index of this level (0 = lowest price)
    pub index: u32,
    pub price: f64,
    pub side: OrderSide,
    pub size: f64,
    pub state: LevelState,
    pub role: LevelRole,
    /// Level the replacement goes to once this level fills
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paired_index: Option<u32>,
    /// Outstanding exchange order (if any)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fill_price: Option<f64>,
}

impl GridLevel {
    pub fn new(index: u32, price: f64, side: OrderSide, size: f64, role: LevelRole) -> Self {
        Self {
            index,
            price,
            side,
            size,
            state: LevelState::Pending,
            role,
            paired_index: None,
            order_id: None,
            last_fill_price: None,
        }
    }

    pub fn has_outstanding_order(&self) -> bool {
        self.order_id.is_some() && self.state == LevelState::Open
    }

    pub fn mark_open(&mut self, order_id: impl Into<String>) {
        self.order_id = Some(order_id.into());
        self.state = LevelState::Open;
    }

    pub fn mark_pending(&mut self) {
        self.order_id = None;
        self.state = LevelState::Pending;
    }

    pub fn mark_filled(&mut self, fill_price: f64) {
        self.order_id = None;
        self.state = LevelState::Filled;
        self.last_fill_price = Some(fill_price);
    }

    pub fn mark_canceled(&mut self) {
        self.order_id = None;
        self.state = LevelState::Canceled;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Limit,
    Market,
}

/// Order status, as tracked locally and reported by venues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Open,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected
        )
    }
}

/// Request to place an order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Idempotency key used to re-query ambiguous placements
    pub client_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    /// Limit price (None for market orders)
    pub price: Option<f64>,
    pub size: f64,
    pub reduce_only: bool,
    /// Grid level this order belongs to
    pub level_index: Option<u32>,
}

impl OrderRequest {
    pub fn limit(symbol: impl Into<String>, level_index: u32, side: OrderSide, price: f64, size: f64) -> Self {
        Self {
            client_order_id: uuid::Uuid::new_v4().to_string(),
            symbol: symbol.into(),
            side,
            order_type: OrderType::Limit,
            price: Some(price),
            size,
            reduce_only: false,
            level_index: Some(level_index),
        }
    }

    pub fn market(symbol: impl Into<String>, side: OrderSide, size: f64) -> Self {
        Self {
            client_order_id: uuid::Uuid::new_v4().to_string(),
            symbol: symbol.into(),
            side,
            order_type: OrderType::Market,
            price: None,
            size,
            reduce_only: false,
            level_index: None,
        }
    }

    /// Set reduce_only flag
    pub fn reduce_only(mut self, reduce_only: bool) -> Self {
        self.reduce_only = reduce_only;
        self
    }
}

/// Placement acknowledgement
#[derive(Debug, Clone, PartialEq)]
pub struct OrderAck {
    pub order_id: String,
    pub status: AckStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AckStatus {
    /// Order is resting on the book
    Resting,
    /// Order was immediately filled
    Filled { avg_price: f64, filled_size: f64 },
}

/// Locally tracked order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub client_order_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level_index: Option<u32>,
    pub side: OrderSide,
    pub order_type: OrderType,
    /// Limit price, or reference price for market orders
    pub price: f64,
    pub size: f64,
    pub filled_size: f64,
    pub avg_fill_price: f64,
    pub status: OrderStatus,
    pub reduce_only: bool,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Order {
    pub fn from_request(order_id: impl Into<String>, request: &OrderRequest, reference_price: f64) -> Self {
        let now = now_millis();
        Self {
            order_id: order_id.into(),
            client_order_id: request.client_order_id.clone(),
            level_index: request.level_index,
            side: request.side,
            order_type: request.order_type,
            price: request.price.unwrap_or(reference_price),
            size: request.size,
            filled_size: 0.0,
            avg_fill_price: 0.0,
            status: OrderStatus::Open,
            reduce_only: request.reduce_only,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn remaining(&self) -> f64 {
        (self.size - self.filled_size).max(0.0)
    }

    pub fn is_complete(&self) -> bool {
        self.remaining() <= EPSILON
    }
}

/// Fill event from the venue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    /// Venue trade id, used for de-duplication
    pub fill_id: String,
    pub order_id: String,
    pub side: OrderSide,
    pub price: f64,
    pub size: f64,
    pub timestamp: u64,
    /// Filled in by the accountant when the fill is applied
    #[serde(default)]
    pub realized_pnl: f64,
}

impl Fill {
    pub fn new(order_id: impl Into<String>, side: OrderSide, price: f64, size: f64) -> Self {
        Self {
            fill_id: uuid::Uuid::new_v4().to_string(),
            order_id: order_id.into(),
            side,
            price,
            size,
            timestamp: now_millis(),
            realized_pnl: 0.0,
        }
    }

    pub fn with_fill_id(mut self, fill_id: impl Into<String>) -> Self {
        self.fill_id = fill_id.into();
        self
    }
}

/// Order as reported by the venue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenueOrder {
    pub order_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_order_id: Option<String>,
    pub side: OrderSide,
    pub price: f64,
    pub size: f64,
    pub filled_size: f64,
    pub avg_fill_price: f64,
    pub status: OrderStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_for_side() {
        assert_eq!(LevelRole::for_side(Direction::Long, OrderSide::Sell), LevelRole::TakeProfit);
        assert_eq!(LevelRole::for_side(Direction::Long, OrderSide::Buy), LevelRole::ReEntry);
        assert_eq!(LevelRole::for_side(Direction::Short, OrderSide::Buy), LevelRole::TakeProfit);
        assert_eq!(LevelRole::for_side(Direction::Short, OrderSide::Sell), LevelRole::ReEntry);
        assert_eq!(LevelRole::for_side(Direction::Neutral, OrderSide::Buy), LevelRole::Neutral);
    }

    #[test]
    fn test_contract_notional() {
        assert!((ContractType::Linear.notional(0.5, 100_000.0) - 50_000.0).abs() < EPSILON);
        assert!((ContractType::Inverse.notional(500.0, 100_000.0) - 500.0).abs() < EPSILON);
    }

    #[test]
    fn test_level_transitions() {
        let mut level = GridLevel::new(3, 99_600.0, OrderSide::Buy, 0.05, LevelRole::ReEntry);
        assert_eq!(level.state, LevelState::Pending);
        assert!(!level.has_outstanding_order());

        level.mark_open("abc");
        assert!(level.has_outstanding_order());

        level.mark_filled(99_600.0);
        assert_eq!(level.state, LevelState::Filled);
        assert_eq!(level.order_id, None);
        assert_eq!(level.last_fill_price, Some(99_600.0));
    }

    #[test]
    fn test_engine_state_permissions() {
        assert!(EngineState::Idle.can_start());
        assert!(EngineState::Stopped.can_start());
        assert!(!EngineState::Running.can_start());
        assert!(EngineState::Initializing.can_stop());
        assert!(!EngineState::Error.can_stop());
        assert!(!EngineState::Idle.accepts_fills());
        assert!(EngineState::Stopping.accepts_fills());
    }
}
