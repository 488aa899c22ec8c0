//! Runtime configuration.
//!
//! Defaults, then an optional `kost-sync.json` in the data directory, then
//! `KOST_*` environment variables.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::api::normalize_base_url;
use crate::error::{ConfigError, StoreError};
use crate::storage::{KeyValueStore, KEY_API_TOKEN};
use crate::sync::FailurePolicy;

pub const CONFIG_FILE_NAME: &str = "kost-sync.json";
const APP_DIR_NAME: &str = "kost-sync";

const ENV_API_URL: &str = "KOST_API_URL";
const ENV_DATA_DIR: &str = "KOST_DATA_DIR";
const ENV_REQUEST_TIMEOUT_MS: &str = "KOST_REQUEST_TIMEOUT_MS";
const ENV_MAX_RETRIES: &str = "KOST_MAX_RETRIES";
const ENV_FAILURE_POLICY: &str = "KOST_FAILURE_POLICY";
const ENV_LOG_JSON: &str = "KOST_LOG_JSON";
pub const ENV_API_TOKEN: &str = "KOST_API_TOKEN";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub api_base_url: String,
    pub data_dir: PathBuf,
    pub request_timeout_ms: u64,
    pub probe_interval_secs: u64,
    pub sync_interval_secs: u64,
    pub debounce_ms: u64,
    pub max_retries: u32,
    pub max_queue_len: usize,
    pub failure_policy: FailurePolicy,
    /// Write the log file as JSON lines instead of plain text.
    pub log_json: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:3000".to_string(),
            data_dir: default_data_dir(),
            request_timeout_ms: 30_000,
            probe_interval_secs: 15,
            sync_interval_secs: 60,
            debounce_ms: 500,
            max_retries: 3,
            max_queue_len: 1_000,
            failure_policy: FailurePolicy::Halt,
            log_json: false,
        }
    }
}

impl SyncConfig {
    /// Load the configuration. `data_dir` overrides both the default and
    /// `KOST_DATA_DIR` when given.
    pub fn load(data_dir: Option<PathBuf>) -> Result<Self, ConfigError> {
        let dir = data_dir
            .or_else(|| env_var(ENV_DATA_DIR).map(PathBuf::from))
            .unwrap_or_else(default_data_dir);

        let mut config = Self::from_file(&dir.join(CONFIG_FILE_NAME))?.unwrap_or_default();
        config.data_dir = dir;
        config.apply_env()?;
        config.api_base_url = normalize_base_url(&config.api_base_url);
        config.validate()?;
        debug!(data_dir = %config.data_dir.display(), api = %config.api_base_url, "configuration loaded");
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Option<Self>, ConfigError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.display().to_string(),
                    source,
                })
            }
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(url) = env_var(ENV_API_URL) {
            self.api_base_url = url;
        }
        if let Some(raw) = env_var(ENV_REQUEST_TIMEOUT_MS) {
            self.request_timeout_ms = parse_env(ENV_REQUEST_TIMEOUT_MS, &raw)?;
        }
        if let Some(raw) = env_var(ENV_MAX_RETRIES) {
            self.max_retries = parse_env(ENV_MAX_RETRIES, &raw)?;
        }
        if let Some(raw) = env_var(ENV_FAILURE_POLICY) {
            self.failure_policy = raw
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("{ENV_FAILURE_POLICY}: {e}")))?;
        }
        if let Some(raw) = env_var(ENV_LOG_JSON) {
            self.log_json = matches!(raw.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if reqwest::Url::parse(&self.api_base_url).is_err() {
            return Err(ConfigError::Invalid(format!(
                "api_base_url is not a valid URL: {}",
                self.api_base_url
            )));
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid("request_timeout_ms must be > 0".into()));
        }
        if self.max_retries == 0 {
            return Err(ConfigError::Invalid("max_retries must be > 0".into()));
        }
        if self.max_queue_len == 0 {
            return Err(ConfigError::Invalid("max_queue_len must be > 0".into()));
        }
        if self.probe_interval_secs == 0 || self.sync_interval_secs == 0 {
            return Err(ConfigError::Invalid("intervals must be > 0".into()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

/// Platform data directory for the app.
pub fn default_data_dir() -> PathBuf {
    let base = std::env::var("LOCALAPPDATA")
        .or_else(|_| std::env::var("XDG_DATA_HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            #[cfg(target_os = "windows")]
            {
                PathBuf::from(std::env::var("USERPROFILE").unwrap_or_else(|_| ".".into()))
                    .join("AppData")
                    .join("Local")
            }
            #[cfg(not(target_os = "windows"))]
            {
                PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                    .join(".local")
                    .join("share")
            }
        });
    base.join(APP_DIR_NAME)
}

/// Bearer token: `KOST_API_TOKEN` first, then the credential store.
pub fn resolve_api_token(store: &dyn KeyValueStore) -> Result<Option<String>, StoreError> {
    if let Some(token) = env_var(ENV_API_TOKEN) {
        return Ok(Some(token));
    }
    match store.get(KEY_API_TOKEN) {
        Ok(token) => Ok(token.filter(|t| !t.trim().is_empty())),
        Err(e) => {
            warn!(error = %e, "failed to read API token from credential store");
            Err(e)
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_env<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.parse()
        .map_err(|e| ConfigError::Invalid(format!("{name}={raw}: {e}")))
}
