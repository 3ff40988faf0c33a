use anyhow::{bail, Context, Result};
use blindchat_core::AccountId;
use std::env;
use std::fmt;
use std::path::PathBuf;

/// File name of the SQLite database inside `state_dir`.
pub const STATE_DB_FILE: &str = "blindchat-state.db";

/// Where user records are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    /// SQLite database in `state_dir`.
    Sqlite,
    /// Process memory, lost on restart.
    Memory,
}

#[derive(Clone)]
pub struct Config {
    pub telegram_bot_token: String,
    /// The only account allowed to request usage statistics.
    /// If not set, statistics are disabled.
    pub admin_id: Option<AccountId>,
    pub storage_backend: StorageBackend,
    /// Directory for persistent state (SQLite database).
    /// Defaults to current working directory.
    pub state_dir: PathBuf,
    /// Port for the HTTP health endpoint. If not set, no HTTP server runs.
    pub health_port: Option<u16>,
}

// Keeps the bot token out of logs.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("telegram_bot_token", &"<redacted>")
            .field("admin_id", &self.admin_id)
            .field("storage_backend", &self.storage_backend)
            .field("state_dir", &self.state_dir)
            .field("health_port", &self.health_port)
            .finish()
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let telegram_bot_token = env::var("TELEGRAM_BOT_TOKEN")
            .context("TELEGRAM_BOT_TOKEN environment variable is required")?;
        if telegram_bot_token.trim().is_empty() {
            bail!("TELEGRAM_BOT_TOKEN must not be empty");
        }

        let admin_id = parse_admin_id(env::var("ADMIN_ID").ok())?;

        let storage_backend = parse_storage_backend(env::var("STORAGE_BACKEND").ok())?;

        let state_dir = env::var("STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));

        let health_port = parse_health_port(env::var("HEALTH_PORT").ok())?;

        Ok(Config {
            telegram_bot_token,
            admin_id,
            storage_backend,
            state_dir,
            health_port,
        })
    }

    pub fn db_path(&self) -> PathBuf {
        self.state_dir.join(STATE_DB_FILE)
    }
}

/// Parse ADMIN_ID from an optional string value.
///
/// Missing or whitespace-only values disable the admin. Anything else must be
/// a valid account number.
pub fn parse_admin_id(value: Option<String>) -> Result<Option<AccountId>> {
    let Some(value) = value.filter(|s| !s.trim().is_empty()) else {
        return Ok(None);
    };
    let id = value
        .trim()
        .parse::<u64>()
        .context("ADMIN_ID must be a valid number")?;
    Ok(Some(AccountId(id)))
}

/// Parse STORAGE_BACKEND, defaulting to SQLite.
pub fn parse_storage_backend(value: Option<String>) -> Result<StorageBackend> {
    let Some(value) = value.filter(|s| !s.trim().is_empty()) else {
        return Ok(StorageBackend::Sqlite);
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "sqlite" => Ok(StorageBackend::Sqlite),
        "memory" => Ok(StorageBackend::Memory),
        other => bail!("STORAGE_BACKEND must be 'sqlite' or 'memory', got '{other}'"),
    }
}

/// Parse HEALTH_PORT. Unset or blank disables the health endpoint.
pub fn parse_health_port(value: Option<String>) -> Result<Option<u16>> {
    value
        .filter(|s| !s.trim().is_empty())
        .map(|s| {
            s.trim()
                .parse::<u16>()
                .context("HEALTH_PORT must be a valid port number")
        })
        .transpose()
}
