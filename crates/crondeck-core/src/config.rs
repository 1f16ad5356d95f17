use std::{path::PathBuf, time::Duration};

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_RETRY_BACKOFF_SECS: u64 = 5;
pub const DEFAULT_RUN_TAIL: usize = 30;
pub const CORE_LOG_FILE: &str = "core.crondeck.log";
pub const DB_FILE: &str = "crondeck.sqlite3";

/// Top-level config (crondeck.toml + CRONDECK_* env overrides).
///
/// Every field has a default, so an absent file yields a usable config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrondeckConfig {
    /// State directory holding the core log and the default run-log database.
    #[serde(default = "default_home")]
    pub home: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Human-readable console logs instead of JSON lines.
    #[serde(default)]
    pub pretty: bool,
    /// Capture job output without echoing it, and keep console logging quiet.
    #[serde(default)]
    pub suppress_logs: bool,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
    /// Number of recent runs each job keeps in memory.
    #[serde(default = "default_run_tail")]
    pub run_tail: usize,
}

impl Default for CrondeckConfig {
    fn default() -> Self {
        Self {
            home: default_home(),
            log_level: default_log_level(),
            pretty: false,
            suppress_logs: false,
            database: DatabaseConfig::default(),
            retry_backoff_secs: DEFAULT_RETRY_BACKOFF_SECS,
            run_tail: DEFAULT_RUN_TAIL,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// Defaults to `<home>/crondeck.sqlite3` when unset.
    pub path: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
        }
    }
}

fn bool_true() -> bool {
    true
}

fn default_home() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.crondeck", home)
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_retry_backoff_secs() -> u64 {
    DEFAULT_RETRY_BACKOFF_SECS
}

fn default_run_tail() -> usize {
    DEFAULT_RUN_TAIL
}

impl CrondeckConfig {
    /// Load config: explicit path > `~/.crondeck/crondeck.toml`, then
    /// `CRONDECK_*` env vars (nested keys joined with `__`, e.g.
    /// `CRONDECK_DATABASE__PATH`).
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: CrondeckConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CRONDECK_").split("__"))
            .extract()
            .map_err(|e| crate::error::CrondeckError::Config(e.to_string()))?;

        tracing::debug!(%path, home = %config.home, "config loaded");
        Ok(config)
    }

    pub fn db_path(&self) -> PathBuf {
        match &self.database.path {
            Some(p) => PathBuf::from(p),
            None => PathBuf::from(&self.home).join(DB_FILE),
        }
    }

    pub fn core_log_path(&self) -> PathBuf {
        PathBuf::from(&self.home).join(CORE_LOG_FILE)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_secs)
    }
}

fn default_config_path() -> String {
    format!("{}/crondeck.toml", default_home())
}
