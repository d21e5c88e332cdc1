//! Runtime configuration
//!
//! Environment-driven settings shared across components. Everything is
//! optional with sensible defaults; [`Configuration::from_env`] reads the
//! `CRAWLKIT_*` variables and falls back to defaults for anything unset or
//! unparsable.

use std::path::PathBuf;
use std::time::Duration;

use log::warn;

/// Environment variable prefix.
const ENV_PREFIX: &str = "CRAWLKIT";

/// Global runtime configuration.
#[derive(Debug, Clone)]
pub struct Configuration {
    /// Drop default queue/dataset/key-value state on startup.
    pub purge_on_start: bool,
    /// Persist queue/statistics/session state to the key-value store.
    pub persist_storage: bool,
    /// Period for statistics and session-pool persistence.
    pub persist_state_interval: Duration,
    /// Period for system-info sampling.
    pub system_info_interval: Duration,
    /// Path for the browser collaborator, when one is attached.
    pub default_browser_path: Option<PathBuf>,
    /// Root directory for file-system storage backends.
    pub storage_dir: PathBuf,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            purge_on_start: false,
            persist_storage: false,
            persist_state_interval: Duration::from_secs(60),
            system_info_interval: Duration::from_secs(1),
            default_browser_path: None,
            storage_dir: PathBuf::from("./storage"),
        }
    }
}

impl Configuration {
    /// Build a configuration from `CRAWLKIT_*` environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            purge_on_start: env_bool("PURGE_ON_START").unwrap_or(defaults.purge_on_start),
            persist_storage: env_bool("PERSIST_STORAGE").unwrap_or(defaults.persist_storage),
            persist_state_interval: env_secs("PERSIST_STATE_INTERVAL_SECS")
                .unwrap_or(defaults.persist_state_interval),
            system_info_interval: env_secs("SYSTEM_INFO_INTERVAL_SECS")
                .unwrap_or(defaults.system_info_interval),
            default_browser_path: std::env::var(format!("{ENV_PREFIX}_DEFAULT_BROWSER_PATH"))
                .ok()
                .map(PathBuf::from),
            storage_dir: std::env::var(format!("{ENV_PREFIX}_STORAGE_DIR"))
                .map(PathBuf::from)
                .unwrap_or(defaults.storage_dir),
        }
    }
}

fn env_bool(name: &str) -> Option<bool> {
    let raw = std::env::var(format!("{ENV_PREFIX}_{name}")).ok()?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        other => {
            warn!("Ignoring unparsable boolean {ENV_PREFIX}_{name}={other}");
            None
        }
    }
}

fn env_secs(name: &str) -> Option<Duration> {
    let raw = std::env::var(format!("{ENV_PREFIX}_{name}")).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(secs) => Some(Duration::from_secs(secs)),
        Err(_) => {
            warn!("Ignoring unparsable duration {ENV_PREFIX}_{name}={raw}");
            None
        }
    }
}
