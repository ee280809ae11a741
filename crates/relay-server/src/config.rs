//! Relay configuration: JSON file, command-line overrides and validation.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use relay_proto::{DEFAULT_MAX_FRAME_SIZE, DEFAULT_PORT};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::{RelayError, Result};

pub const CONFIG_FILENAME: &str = "config.json";

const KNOWN_KEYS: &[&str] = &[
    "listen",
    "heartbeatTimeoutSecs",
    "sweepIntervalSecs",
    "controlIdleTimeoutSecs",
    "classifyTimeoutSecs",
    "maxFrameBytes",
    "displayNames",
];

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT))
}

fn default_heartbeat_timeout() -> u64 {
    60
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_control_idle_timeout() -> u64 {
    60
}

fn default_classify_timeout() -> u64 {
    30
}

fn default_max_frame_bytes() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Silence after which a controlled endpoint is evicted
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Idle time before a control session is sent a ping
    #[serde(default = "default_control_idle_timeout")]
    pub control_idle_timeout_secs: u64,

    /// Time a new connection has to send its registration frame
    #[serde(default = "default_classify_timeout")]
    pub classify_timeout_secs: u64,

    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    /// Operator display names keyed by endpoint identity
    #[serde(default)]
    pub display_names: HashMap<String, String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            control_idle_timeout_secs: default_control_idle_timeout(),
            classify_timeout_secs: default_classify_timeout(),
            max_frame_bytes: default_max_frame_bytes(),
            display_names: HashMap::new(),
        }
    }
}

impl RelayConfig {
    /// Load config from file. A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or contains invalid JSON.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        warn_unknown_fields(&content, &path.display().to_string());
        let config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Check the timing and size settings.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Config` for zero intervals or a zero frame limit.
    pub fn validate(&self) -> Result<()> {
        let intervals = [
            ("heartbeatTimeoutSecs", self.heartbeat_timeout_secs),
            ("sweepIntervalSecs", self.sweep_interval_secs),
            ("controlIdleTimeoutSecs", self.control_idle_timeout_secs),
            ("classifyTimeoutSecs", self.classify_timeout_secs),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(RelayError::Config(format!("{name} must be greater than 0")));
            }
        }
        if self.max_frame_bytes == 0 {
            return Err(RelayError::Config(
                "maxFrameBytes must be greater than 0".to_string(),
            ));
        }
        if u32::try_from(self.max_frame_bytes).is_err() {
            return Err(RelayError::Config(format!(
                "maxFrameBytes must fit a 4-byte length prefix (got {})",
                self.max_frame_bytes
            )));
        }
        if self.heartbeat_timeout_secs <= self.sweep_interval_secs {
            warn!(
                "heartbeatTimeoutSecs ({}) should exceed sweepIntervalSecs ({}); endpoints may be evicted between heartbeats",
                self.heartbeat_timeout_secs, self.sweep_interval_secs
            );
        }
        Ok(())
    }

    #[must_use]
    pub fn settings(&self) -> RelaySettings {
        RelaySettings {
            listen: self.listen,
            heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            control_idle_timeout: Duration::from_secs(self.control_idle_timeout_secs),
            classify_timeout: Duration::from_secs(self.classify_timeout_secs),
            max_frame_size: self.max_frame_bytes,
            display_names: self.display_names.clone(),
        }
    }
}

/// Resolved runtime settings the server is started with.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub listen: SocketAddr,
    pub heartbeat_timeout: Duration,
    pub sweep_interval: Duration,
    pub control_idle_timeout: Duration,
    pub classify_timeout: Duration,
    pub max_frame_size: usize,
    pub display_names: HashMap<String, String>,
}

impl Default for RelaySettings {
    fn default() -> Self {
        RelayConfig::default().settings()
    }
}

/// `<config dir>/remote-relay/config.json`, if the platform has a config dir.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "remote-relay")
        .map(|project| project.config_dir().join(CONFIG_FILENAME))
}

/// Warn about top-level keys the relay does not understand.
pub fn warn_unknown_fields(content: &str, config_name: &str) {
    for key in unknown_keys(content) {
        warn!("Unknown config field in {config_name}: {key}");
    }
}

fn unknown_keys(content: &str) -> Vec<String> {
    let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(content) else {
        return Vec::new();
    };
    let known: HashSet<&str> = KNOWN_KEYS.iter().copied().collect();
    obj.keys()
        .filter(|key| !known.contains(key.as_str()))
        .cloned()
        .collect()
}
