//! Runtime configuration.
//!
//! All timing contracts of the popup live here. Every field has a default,
//! so an empty (or missing) config file is valid.
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// How often the owner lease is refreshed / checked for staleness.
    #[serde(default = "default_liveness_interval_secs")]
    pub liveness_interval_secs: u64,
    /// Owner records older than this are considered dead.
    #[serde(default = "default_owner_stale_after_secs")]
    pub owner_stale_after_secs: u64,
    /// Auctions ending within this distance of each other are staggered.
    #[serde(default = "default_deconflict_window_ms")]
    pub deconflict_window_ms: i64,
    /// Distance between staggered bid times.
    #[serde(default = "default_deconflict_stagger_ms")]
    pub deconflict_stagger_ms: i64,
    #[serde(default = "default_tab_scan_interval_secs")]
    pub tab_scan_interval_secs: u64,
    /// Tabs without a heartbeat for this long are treated as closed.
    #[serde(default = "default_tab_stale_after_secs")]
    pub tab_stale_after_secs: u64,
    /// Minimum distance between heartbeat-triggered reconciliations.
    #[serde(default = "default_render_min_interval_ms")]
    pub render_min_interval_ms: u64,
    #[serde(default)]
    pub messaging: MessagingConfig,
}

/// Retry policy for messages sent to tabs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagingConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_max_jitter_ms")]
    pub max_jitter_ms: u64,
}

fn default_liveness_interval_secs() -> u64 {
    60
}

fn default_owner_stale_after_secs() -> u64 {
    300
}

fn default_deconflict_window_ms() -> i64 {
    1_000
}

fn default_deconflict_stagger_ms() -> i64 {
    2_000
}

fn default_tab_scan_interval_secs() -> u64 {
    30
}

fn default_tab_stale_after_secs() -> u64 {
    90
}

fn default_render_min_interval_ms() -> u64 {
    1_000
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_jitter_ms() -> u64 {
    100
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_retries: default_max_retries(),
            max_jitter_ms: default_max_jitter_ms(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            liveness_interval_secs: default_liveness_interval_secs(),
            owner_stale_after_secs: default_owner_stale_after_secs(),
            deconflict_window_ms: default_deconflict_window_ms(),
            deconflict_stagger_ms: default_deconflict_stagger_ms(),
            tab_scan_interval_secs: default_tab_scan_interval_secs(),
            tab_stale_after_secs: default_tab_stale_after_secs(),
            render_min_interval_ms: default_render_min_interval_ms(),
            messaging: MessagingConfig::default(),
        }
    }
}

impl Config {
    /// Load from `path` if given, otherwise use defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                tracing::warn!("no config file given, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_secs(self.liveness_interval_secs)
    }

    pub fn owner_stale_after(&self) -> Duration {
        Duration::from_secs(self.owner_stale_after_secs)
    }

    pub fn tab_scan_interval(&self) -> Duration {
        Duration::from_secs(self.tab_scan_interval_secs)
    }

    pub fn tab_stale_after(&self) -> Duration {
        Duration::from_secs(self.tab_stale_after_secs)
    }

    pub fn render_min_interval(&self) -> Duration {
        Duration::from_millis(self.render_min_interval_ms)
    }
}
