//! Grid engine error taxonomy

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::executor::GatewayError;

/// Coarse error classes reported in status and alerts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Invalid grid parameters
    Configuration,
    /// Timeouts and rate limits
    TransientExchange,
    /// Venue refused the order (margin, price, size)
    ExchangeRejection,
    /// Venue unreachable
    Connectivity,
    /// Internal consistency guard tripped
    InvariantViolation,
    /// Persistence, channel and state-machine misuse
    Internal,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Configuration => write!(f, "configuration"),
            ErrorClass::TransientExchange => write!(f, "transient_exchange"),
            ErrorClass::ExchangeRejection => write!(f, "exchange_rejection"),
            ErrorClass::Connectivity => write!(f, "connectivity"),
            ErrorClass::InvariantViolation => write!(f, "invariant_violation"),
            ErrorClass::Internal => write!(f, "internal"),
        }
    }
}

/// Errors that can occur in grid engine operations
#[derive(Error, Debug, Clone)]
pub enum GridError {
    #[error("Invalid grid configuration: {0}")]
    Configuration(String),

    #[error("Transient exchange error: {0}")]
    TransientExchange(String),

    #[error("Exchange rejected request: {0}")]
    ExchangeRejection(String),

    #[error("Exchange unreachable: {0}")]
    Connectivity(String),

    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Order placement failed after {attempts} attempts: {reason}")]
    RetriesExhausted {
        attempts: u32,
        class: ErrorClass,
        reason: String,
    },

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Engine is in invalid state for {operation}: {current_state}")]
    InvalidState {
        operation: &'static str,
        current_state: String,
    },

    #[error("State persistence error: {0}")]
    StatePersistence(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("JSON parse error: {0}")]
    JsonParse(String),
}

impl GridError {
    /// Error class used for status reporting and alerting
    pub fn class(&self) -> ErrorClass {
        match self {
            GridError::Configuration(_) => ErrorClass::Configuration,
            GridError::TransientExchange(_) => ErrorClass::TransientExchange,
            GridError::ExchangeRejection(_) | GridError::OrderNotFound(_) => {
                ErrorClass::ExchangeRejection
            }
            GridError::Connectivity(_) => ErrorClass::Connectivity,
            GridError::InvariantViolation(_) => ErrorClass::InvariantViolation,
            GridError::RetriesExhausted { class, .. } => *class,
            GridError::InvalidState { .. }
            | GridError::StatePersistence(_)
            | GridError::Channel(_)
            | GridError::JsonParse(_) => ErrorClass::Internal,
        }
    }

    /// Whether this error halts trading for the bot
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::InvariantViolation | ErrorClass::Configuration
        )
    }
}

impl From<GatewayError> for GridError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::RateLimited(_) | GatewayError::Timeout(_) => {
                GridError::TransientExchange(err.to_string())
            }
            GatewayError::Connectivity(_) => GridError::Connectivity(err.to_string()),
            GatewayError::NotFound(id) => GridError::OrderNotFound(id),
            GatewayError::InvalidParams(_)
            | GatewayError::InsufficientMargin(_)
            | GatewayError::Rejected(_) => GridError::ExchangeRejection(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for GridError {
    fn from(err: serde_json::Error) -> Self {
        GridError::JsonParse(err.to_string())
    }
}

impl From<std::io::Error> for GridError {
    fn from(err: std::io::Error) -> Self {
        GridError::StatePersistence(err.to_string())
    }
}

/// Result type for grid operations
pub type GridResult<T> = std::result::Result<T, GridError>;
