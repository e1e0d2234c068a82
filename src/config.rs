use config::{Config, File};
pub use config::ConfigError;
use serde::Deserialize;

use crate::grid::state::is_valid_bot_id;
use crate::grid::{BotConfig, EngineConfig};

/// Main configuration struct
#[derive(Debug, Deserialize)]
pub struct Settings {
    /// Identifier used for logs, events and the state file
    #[serde(default = "default_bot_id")]
    pub bot_id: String,
    /// Grid parameters (symbol, capital, levels, direction, ...)
    pub bot: BotConfig,
    /// Retry, rate limit and housekeeping tuning
    #[serde(default)]
    pub engine: EngineConfig,
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
    /// Simulated venue price path
    #[serde(default)]
    pub paper: PaperConfig,
    /// Persistence
    #[serde(default)]
    pub state: StateConfig,
}

fn default_bot_id() -> String {
    "grid".to_string()
}

#[derive(Debug, Deserialize, Default)]
pub struct LogConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaperConfig {
    /// Starting mark price
    #[serde(default = "default_initial_price")]
    pub initial_price: f64,
    /// Oscillation amplitude as a percentage of the initial price
    #[serde(default = "default_amplitude_pct")]
    pub amplitude_pct: f64,
    /// Length of one full oscillation
    #[serde(default = "default_period_secs")]
    pub period_secs: u64,
    /// How often the mark price moves
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            initial_price: default_initial_price(),
            amplitude_pct: default_amplitude_pct(),
            period_secs: default_period_secs(),
            tick_ms: default_tick_ms(),
        }
    }
}

fn default_initial_price() -> f64 {
    100_000.0
}

fn default_amplitude_pct() -> f64 {
    1.5
}

fn default_period_secs() -> u64 {
    120
}

fn default_tick_ms() -> u64 {
    500
}

#[derive(Debug, Clone, Deserialize)]
pub struct StateConfig {
    /// Directory for state files
    #[serde(default = "default_state_dir")]
    pub dir: String,
    /// Resume from a saved state when one exists
    #[serde(default = "default_resume")]
    pub resume: bool,
    /// Close the position when the bot is stopped with Ctrl-C
    #[serde(default)]
    pub close_on_exit: bool,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: default_state_dir(),
            resume: default_resume(),
            close_on_exit: false,
        }
    }
}

fn default_state_dir() -> String {
    "state".to_string()
}

fn default_resume() -> bool {
    true
}

impl Settings {
    /// Load settings from a configuration file
    pub fn new(config_path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(config_path))
            // Environment overrides the file, e.g. GRID__BOT__CAPITAL=1000
            .add_source(config::Environment::with_prefix("GRID").separator("__"))
            .build()?;

        let settings: Settings = s.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bot
            .validate()
            .map_err(|e| ConfigError::Message(e.to_string()))?;
        if !is_valid_bot_id(&self.bot_id) {
            return Err(ConfigError::Message(format!(
                "bot_id {:?} may only contain ASCII letters, digits, '-' and '_'",
                self.bot_id
            )));
        }
        if !(self.paper.initial_price > 0.0) {
            return Err(ConfigError::Message(
                "paper.initial_price must be positive".into(),
            ));
        }
        if self.paper.tick_ms == 0 || self.paper.period_secs == 0 {
            return Err(ConfigError::Message(
                "paper.tick_ms and paper.period_secs must be positive".into(),
            ));
        }
        Ok(())
    }
}
