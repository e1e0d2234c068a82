//! Trade and alert events produced by the engine

use log::debug;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::errors::{ErrorClass, GridError};
use super::types::{now_millis, OrderSide};

/// One confirmed fill, as seen by downstream consumers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeEvent {
    pub bot_id: String,
    pub order_id: String,
    pub fill_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level_index: Option<u32>,
    pub side: OrderSide,
    pub price: f64,
    pub size: f64,
    pub realized_pnl: f64,
    /// Net position after this fill
    pub position_after: f64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub bot_id: String,
    pub severity: AlertSeverity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<ErrorClass>,
    pub message: String,
    /// Whether the bot keeps trading after this alert
    pub trading_continues: bool,
    pub timestamp: u64,
}

impl AlertEvent {
    pub fn info(bot_id: &str, message: impl Into<String>) -> Self {
        Self {
            bot_id: bot_id.to_string(),
            severity: AlertSeverity::Info,
            class: None,
            message: message.into(),
            trading_continues: true,
            timestamp: now_millis(),
        }
    }

    /// Alert describing an engine error
    pub fn from_error(bot_id: &str, err: &GridError, trading_continues: bool) -> Self {
        Self {
            bot_id: bot_id.to_string(),
            severity: if trading_continues {
                AlertSeverity::Warning
            } else {
                AlertSeverity::Critical
            },
            class: Some(err.class()),
            message: err.to_string(),
            trading_continues,
            timestamp: now_millis(),
        }
    }
}

/// Entry in a bot's bounded error history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub timestamp: u64,
    pub class: ErrorClass,
    pub message: String,
}

impl ErrorRecord {
    pub fn new(err: &GridError) -> Self {
        Self {
            timestamp: now_millis(),
            class: err.class(),
            message: err.to_string(),
        }
    }
}

/// Outbound event channels; either side may be absent
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    trades: Option<mpsc::UnboundedSender<TradeEvent>>,
    alerts: Option<mpsc::UnboundedSender<AlertEvent>>,
}

/// Receiving ends handed to whoever consumes the events
pub struct EventStreams {
    pub trades: mpsc::UnboundedReceiver<TradeEvent>,
    pub alerts: mpsc::UnboundedReceiver<AlertEvent>,
}

impl EventSink {
    /// Sink that drops every event
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Sink wired to a fresh pair of channels
    pub fn channels() -> (Self, EventStreams) {
        let (trade_tx, trade_rx) = mpsc::unbounded_channel();
        let (alert_tx, alert_rx) = mpsc::unbounded_channel();
        (
            Self {
                trades: Some(trade_tx),
                alerts: Some(alert_tx),
            },
            EventStreams {
                trades: trade_rx,
                alerts: alert_rx,
            },
        )
    }

    pub fn trade(&self, event: TradeEvent) {
        if let Some(tx) = &self.trades {
            if tx.send(event).is_err() {
                debug!("Trade event receiver dropped");
            }
        }
    }

    pub fn alert(&self, event: AlertEvent) {
        if let Some(tx) = &self.alerts {
            if tx.send(event).is_err() {
                debug!("Alert event receiver dropped");
            }
        }
    }
}
