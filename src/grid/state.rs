//! Persisted bot state with JSON file and in-memory stores

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::accountant::PositionSnapshot;
use super::config::BotConfig;
use super::errors::{GridError, GridResult};
use super::events::ErrorRecord;
use super::ledger::LedgerSnapshot;
use super::types::{EngineState, GridLevel};

/// Current on-disk format
pub const STATE_VERSION: u32 = 1;

/// Everything needed to rebuild an engine after restart
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedBot {
    #[serde(default = "default_version")]
    pub version: u32,

    pub bot_id: String,

    /// Configuration snapshot of the run
    pub config: BotConfig,

    pub state: EngineState,

    /// Reference price the ladder was computed from
    pub reference_price: f64,

    pub levels: Vec<GridLevel>,

    pub ledger: LedgerSnapshot,

    pub position: PositionSnapshot,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<u64>,

    #[serde(default)]
    pub errors: Vec<ErrorRecord>,

    pub last_updated: u64,
}

fn default_version() -> u32 {
    STATE_VERSION
}

impl PersistedBot {
    /// Sanity checks before an engine is rebuilt from this state
    pub fn validate(&self, bot_id: &str) -> GridResult<()> {
        if self.version > STATE_VERSION {
            return Err(GridError::StatePersistence(format!(
                "state version {} is newer than supported {}",
                self.version, STATE_VERSION
            )));
        }
        if self.bot_id != bot_id {
            return Err(GridError::StatePersistence(format!(
                "state belongs to bot '{}', not '{}'",
                self.bot_id, bot_id
            )));
        }
        if self.levels.windows(2).any(|w| w[1].price <= w[0].price) {
            return Err(GridError::StatePersistence(
                "persisted levels are not strictly increasing".into(),
            ));
        }
        self.config.validate()
    }
}

/// External persistence collaborator
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, bot_id: &str) -> GridResult<Option<PersistedBot>>;

    async fn save(&self, bot_id: &str, state: &PersistedBot) -> GridResult<()>;
}

/// One JSON file per bot, written atomically
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File for a bot: `{dir}/grid_{bot_id}.json`
    ///
    /// Ids are used verbatim, so only ASCII alphanumerics, `-` and `_` are
    /// accepted; anything else could alias another bot's file.
    pub fn path_for(&self, bot_id: &str) -> GridResult<PathBuf> {
        if !is_valid_bot_id(bot_id) {
            return Err(GridError::StatePersistence(format!(
                "bot id {:?} must be non-empty ASCII alphanumerics, '-' or '_'",
                bot_id
            )));
        }
        Ok(self.dir.join(format!("grid_{}.json", bot_id)))
    }
}

/// Whether `bot_id` can name a state file as is
pub fn is_valid_bot_id(bot_id: &str) -> bool {
    !bot_id.is_empty()
        && bot_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn load(&self, bot_id: &str) -> GridResult<Option<PersistedBot>> {
        let path = self.path_for(bot_id)?;
        if !tokio::fs::try_exists(&path).await? {
            debug!("No state file at {:?}", path);
            return Ok(None);
        }

        let content = tokio::fs::read_to_string(&path).await?;
        let state: PersistedBot = serde_json::from_str(&content)?;
        info!(
            "Loaded state for {}: {:?}, {} levels, {} open orders",
            bot_id,
            state.state,
            state.levels.len(),
            state.ledger.open.len()
        );
        Ok(Some(state))
    }

    /// Save state atomically (write to temp, then rename)
    async fn save(&self, bot_id: &str, state: &PersistedBot) -> GridResult<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(bot_id)?;
        let temp_path = path.with_extension("tmp");

        let content = serde_json::to_string_pretty(state)?;
        tokio::fs::write(&temp_path, content).await?;
        tokio::fs::rename(&temp_path, &path).await?;

        debug!("State saved to {:?}", path);
        Ok(())
    }
}

/// In-process store for tests and supervisors
#[derive(Debug, Default)]
pub struct MemoryStore {
    states: Mutex<HashMap<String, PersistedBot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn bot_count(&self) -> usize {
        self.states.lock().await.len()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load(&self, bot_id: &str) -> GridResult<Option<PersistedBot>> {
        Ok(self.states.lock().await.get(bot_id).cloned())
    }

    async fn save(&self, bot_id: &str, state: &PersistedBot) -> GridResult<()> {
        self.states
            .lock()
            .await
            .insert(bot_id.to_string(), state.clone());
        Ok(())
    }
}
