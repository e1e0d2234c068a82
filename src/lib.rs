#![deny(unreachable_pub)]
pub mod config;
pub mod grid;
pub mod runner;

pub use crate::config::{ConfigError, Settings};
pub use runner::BotRunner;
