//! Configuration for the edge node.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $TETHER_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/tether/config.toml
//!   3. ~/.config/tether/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    pub node: NodeConfig,
    pub remote: RemoteConfig,
    pub listener: ListenerConfig,
    pub generation: GenerationConfig,
    pub confidence: ConfidenceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Reported as `local_server_id` in heartbeats and status snapshots.
    pub node_id: String,
    /// tracing filter directive used when RUST_LOG is unset.
    pub log_level: String,
}

/// Outbound connection to the cloud node. Durations are seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub host: String,
    pub port: u16,
    /// Default wait for a refinement response.
    pub cloud_request_timeout_secs: f64,
    pub heartbeat_interval_secs: f64,
    /// First reconnect wait; doubles per failed attempt.
    pub reconnect_delay_secs: f64,
    pub max_reconnect_delay_secs: f64,
    pub connect_timeout_secs: f64,
}

/// Inbound command socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    pub bind_host: String,
    /// 0 = OS-assigned.
    pub port: u16,
}

/// OpenAI-compatible local generation server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub api_base_url: String,
    pub model: String,
    pub default_max_tokens: u32,
    pub default_temperature: f64,
    pub request_timeout_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceConfig {
    /// Similarity below this escalates to the cloud. Range [0, 1].
    pub similarity_threshold: f64,
    /// JSON list of trigger phrases. Missing file = no keywords.
    pub keyword_triggers_file: PathBuf,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "local_server_dev_01".into(),
            log_level: "info".into(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 5000,
            cloud_request_timeout_secs: 15.0,
            heartbeat_interval_secs: 30.0,
            reconnect_delay_secs: 5.0,
            max_reconnect_delay_secs: 60.0,
            connect_timeout_secs: 10.0,
        }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".into(),
            port: 5001,
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8000/v1".into(),
            model: "Qwen/Qwen1.5-14B-Chat-AWQ".into(),
            default_max_tokens: 1024,
            default_temperature: 0.7,
            request_timeout_secs: 60.0,
        }
    }
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.3,
            keyword_triggers_file: PathBuf::from("config/keyword_triggers.json"),
        }
    }
}

// ── Duration views ────────────────────────────────────────────────────────────

impl RemoteConfig {
    pub fn cloud_request_timeout(&self) -> Duration {
        secs(self.cloud_request_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        secs(self.heartbeat_interval_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        secs(self.reconnect_delay_secs)
    }

    pub fn max_reconnect_delay(&self) -> Duration {
        secs(self.max_reconnect_delay_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        secs(self.connect_timeout_secs)
    }
}

impl GenerationConfig {
    pub fn request_timeout(&self) -> Duration {
        secs(self.request_timeout_secs)
    }
}

impl ListenerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.port)
    }
}

/// Clamped so a bad value can never panic `Duration::from_secs_f64`.
fn secs(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value)
    } else {
        Duration::ZERO
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("tether")
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl TetherConfig {
    /// Load config: env vars → file → defaults. The result is validated.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            TetherConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("TETHER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&TetherConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Reject values no component can run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let threshold = self.confidence.similarity_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigError::Invalid {
                field: "confidence.similarity_threshold",
                reason: format!("{threshold} is outside [0, 1]"),
            });
        }

        let positive = [
            ("remote.cloud_request_timeout_secs", self.remote.cloud_request_timeout_secs),
            ("remote.heartbeat_interval_secs", self.remote.heartbeat_interval_secs),
            ("remote.reconnect_delay_secs", self.remote.reconnect_delay_secs),
            ("remote.max_reconnect_delay_secs", self.remote.max_reconnect_delay_secs),
            ("remote.connect_timeout_secs", self.remote.connect_timeout_secs),
            ("generation.request_timeout_secs", self.generation.request_timeout_secs),
        ];
        for (field, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("{value} must be a positive number of seconds"),
                });
            }
        }

        if self.remote.max_reconnect_delay_secs < self.remote.reconnect_delay_secs {
            return Err(ConfigError::Invalid {
                field: "remote.max_reconnect_delay_secs",
                reason: "must not be below remote.reconnect_delay_secs".into(),
            });
        }
        if self.node.node_id.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "node.node_id",
                reason: "must not be empty".into(),
            });
        }
        Ok(())
    }

    /// Apply TETHER_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Overrides from an arbitrary lookup. Unparseable numbers are ignored.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parse<T: std::str::FromStr>(v: Option<String>, slot: &mut T) {
            if let Some(p) = v.and_then(|v| v.trim().parse().ok()) {
                *slot = p;
            }
        }

        if let Some(v) = lookup("TETHER_NODE__NODE_ID") {
            self.node.node_id = v;
        }
        if let Some(v) = lookup("TETHER_NODE__LOG_LEVEL") {
            self.node.log_level = v;
        }
        if let Some(v) = lookup("TETHER_REMOTE__HOST") {
            self.remote.host = v;
        }
        parse(lookup("TETHER_REMOTE__PORT"), &mut self.remote.port);
        parse(
            lookup("TETHER_REMOTE__CLOUD_REQUEST_TIMEOUT_SECS"),
            &mut self.remote.cloud_request_timeout_secs,
        );
        parse(
            lookup("TETHER_REMOTE__HEARTBEAT_INTERVAL_SECS"),
            &mut self.remote.heartbeat_interval_secs,
        );
        parse(
            lookup("TETHER_REMOTE__RECONNECT_DELAY_SECS"),
            &mut self.remote.reconnect_delay_secs,
        );
        parse(
            lookup("TETHER_REMOTE__MAX_RECONNECT_DELAY_SECS"),
            &mut self.remote.max_reconnect_delay_secs,
        );
        parse(
            lookup("TETHER_REMOTE__CONNECT_TIMEOUT_SECS"),
            &mut self.remote.connect_timeout_secs,
        );
        if let Some(v) = lookup("TETHER_LISTENER__BIND_HOST") {
            self.listener.bind_host = v;
        }
        parse(lookup("TETHER_LISTENER__PORT"), &mut self.listener.port);
        if let Some(v) = lookup("TETHER_GENERATION__API_BASE_URL") {
            self.generation.api_base_url = v;
        }
        if let Some(v) = lookup("TETHER_GENERATION__MODEL") {
            self.generation.model = v;
        }
        parse(
            lookup("TETHER_GENERATION__DEFAULT_MAX_TOKENS"),
            &mut self.generation.default_max_tokens,
        );
        parse(
            lookup("TETHER_GENERATION__DEFAULT_TEMPERATURE"),
            &mut self.generation.default_temperature,
        );
        parse(
            lookup("TETHER_GENERATION__REQUEST_TIMEOUT_SECS"),
            &mut self.generation.request_timeout_secs,
        );
        parse(
            lookup("TETHER_CONFIDENCE__SIMILARITY_THRESHOLD"),
            &mut self.confidence.similarity_threshold,
        );
        if let Some(v) = lookup("TETHER_CONFIDENCE__KEYWORD_TRIGGERS_FILE") {
            self.confidence.keyword_triggers_file = PathBuf::from(v);
        }
    }
}
