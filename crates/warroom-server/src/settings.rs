//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with [`WarRoomSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `WARROOM_*` environment overrides (highest priority)

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid settings JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WarRoomSettings {
    pub server: ServerSettings,
    pub ticker: TickerSettings,
    pub database: DatabaseSettings,
    pub logging: LoggingSettings,
    /// Emails seeded as administrators at startup.
    pub initial_admins: Vec<String>,
    pub max_code_attempts: u32,
}

impl Default for WarRoomSettings {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            ticker: TickerSettings::default(),
            database: DatabaseSettings::default(),
            logging: LoggingSettings::default(),
            initial_admins: Vec::new(),
            max_code_attempts: 5,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub max_send_queue: usize,
    pub send_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 9191,
            max_send_queue: 256,
            send_timeout_ms: 5000,
        }
    }
}

impl ServerSettings {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TickerSettings {
    pub period_secs: u64,
}

impl Default for TickerSettings {
    fn default() -> Self {
        Self { period_secs: 30 }
    }
}

impl TickerSettings {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs.max(1))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseSettings {
    pub path: String,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: warroom_home()
                .join("database")
                .join("warroom.db")
                .to_string_lossy()
                .into_owned(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: true,
        }
    }
}

fn warroom_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".warroom")
}

/// `~/.warroom/settings.json`
pub fn settings_path() -> PathBuf {
    warroom_home().join("settings.json")
}

pub fn load_settings() -> Result<WarRoomSettings, SettingsError> {
    load_settings_from_path(&settings_path())
}

/// A missing file yields defaults; malformed JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<WarRoomSettings, SettingsError> {
    let mut settings = load_file(path)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

fn load_file(path: &Path) -> Result<WarRoomSettings, SettingsError> {
    let defaults = serde_json::to_value(WarRoomSettings::default())?;
    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };
    Ok(serde_json::from_value(merged)?)
}

/// Objects merge per key, everything else is replaced. Nulls in `source`
/// keep the target value.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Invalid values are ignored.
pub fn apply_env_overrides(settings: &mut WarRoomSettings) {
    apply_overrides_from(settings, |key| std::env::var(key).ok());
}

fn apply_overrides_from<F>(settings: &mut WarRoomSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let read = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

    if let Some(port) = read("WARROOM_PORT").and_then(|v| v.parse::<u16>().ok()).filter(|p| *p > 0) {
        settings.server.port = port;
    }
    if let Some(host) = read("WARROOM_HOST") {
        settings.server.host = host;
    }
    if let Some(path) = read("WARROOM_DB") {
        settings.database.path = path;
    }
    if let Some(secs) = read("WARROOM_TICK_SECS")
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|s| (1..=3600).contains(s))
    {
        settings.ticker.period_secs = secs;
    }
    if let Some(admins) = read("WARROOM_INITIAL_ADMINS") {
        settings.initial_admins = admins
            .split(',')
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(str::to_owned)
            .collect();
    }
    if let Some(level) = read("WARROOM_LOG_LEVEL") {
        settings.logging.level = level;
    }
}
