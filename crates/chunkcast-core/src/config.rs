//! Configuration system for chunkcast.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $CHUNKCAST_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/chunkcast/config.toml
//!   3. ~/.config/chunkcast/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::chunking::DEFAULT_CHUNK_SIZE;
use crate::wire::DEFAULT_NAMESPACE;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkcastConfig {
    pub broker: BrokerConfig,
    pub topics: TopicsConfig,
    pub transfer: TransferConfig,
    pub receiver: ReceiverConfig,
    pub services: ServicesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive_secs: u64,
    /// How long to wait for CONNACK before giving up.
    pub connect_timeout_secs: u64,
    /// Largest packet accepted or sent. 0 = derive from chunk size.
    pub max_packet_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicsConfig {
    /// Prefix for meta/chunk/complete topics.
    pub namespace: String,
    /// Topic for single-message (unchunked) file publication.
    pub whole_file: String,
    pub lamp_command: String,
    pub lamp_ack: String,
    pub color: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub chunk_size: usize,
    /// Pause after each acknowledged chunk.
    pub chunk_delay_ms: u64,
    /// Pause between the metadata message and the first chunk.
    pub metadata_delay_ms: u64,
    /// Per-message acknowledgment deadline.
    pub ack_timeout_ms: u64,
    /// Tag transfers with an identifier. Off keeps the legacy topic layout.
    pub session_ids: bool,
    /// Attach a BLAKE3 digest of the payload to the descriptor.
    pub include_digest: bool,
    /// Whole-session restarts after a retryable failure.
    pub retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    pub output_dir: PathBuf,
    /// Sessions with no traffic for this long are abandoned.
    pub inactivity_timeout_secs: u64,
    /// How long an incomplete session survives after its completion marker.
    pub grace_period_secs: u64,
    pub sweep_interval_secs: u64,
    /// Descriptors announcing more than this are rejected. 0 = unlimited.
    pub max_transfer_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    pub transfers: bool,
    pub lamp: bool,
    pub color: bool,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "test.mosquitto.org".to_string(),
            port: 1883,
            client_id: "chunkcast".to_string(),
            keep_alive_secs: 60,
            connect_timeout_secs: 10,
            max_packet_bytes: 0,
        }
    }
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            whole_file: DEFAULT_NAMESPACE.to_string(),
            lamp_command: "esp32/lampe".to_string(),
            lamp_ack: "esp32/lampe/ack".to_string(),
            color: "esp32/color".to_string(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_delay_ms: 500,
            metadata_delay_ms: 1000,
            ack_timeout_ms: 10_000,
            session_ids: false,
            include_digest: true,
            retries: 0,
        }
    }
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            output_dir: data_dir().join("received"),
            inactivity_timeout_secs: 60,
            grace_period_secs: 10,
            sweep_interval_secs: 1,
            max_transfer_bytes: 64 * 1024 * 1024,
        }
    }
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            transfers: true,
            lamp: true,
            color: true,
        }
    }
}

// ── Derived values ────────────────────────────────────────────────────────────

impl BrokerConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Packet size limit large enough for one chunk plus topic and header.
    pub fn packet_limit(&self, chunk_size: usize) -> usize {
        if self.max_packet_bytes > 0 {
            self.max_packet_bytes
        } else {
            chunk_size.max(DEFAULT_CHUNK_SIZE) + PACKET_OVERHEAD
        }
    }
}

/// Largest packet MQTT's remaining-length field can describe.
pub const MQTT_MAX_PACKET: usize = 268_435_455;

/// Fixed header, topic and properties around a payload.
const PACKET_OVERHEAD: usize = 4096;

impl ChunkcastConfig {
    /// Incoming packet limit for the receiving daemon.
    ///
    /// Sized from `max_transfer_bytes` rather than the local chunk size:
    /// senders pick their own chunk size, and rumqttc drops the connection on
    /// any packet above the limit.
    pub fn receive_packet_limit(&self) -> usize {
        if self.broker.max_packet_bytes > 0 {
            return self.broker.max_packet_bytes;
        }
        if self.receiver.max_transfer_bytes == 0 {
            return MQTT_MAX_PACKET;
        }
        let transfer = usize::try_from(self.receiver.max_transfer_bytes).unwrap_or(MQTT_MAX_PACKET);
        transfer
            .saturating_add(PACKET_OVERHEAD)
            .max(self.broker.packet_limit(self.transfer.chunk_size))
            .min(MQTT_MAX_PACKET)
    }
}

impl TransferConfig {
    pub fn chunk_delay(&self) -> Duration {
        Duration::from_millis(self.chunk_delay_ms)
    }

    pub fn metadata_delay(&self) -> Duration {
        Duration::from_millis(self.metadata_delay_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

impl ReceiverConfig {
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("chunkcast")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("chunkcast")
}

fn dirs_or_home() -> PathBuf {
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
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl ChunkcastConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            ChunkcastConfig::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("CHUNKCAST_CONFIG")
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
            let text = toml::to_string_pretty(&ChunkcastConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Reject values the protocol cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.transfer.chunk_size == 0 {
            return invalid("transfer.chunk_size must be greater than zero");
        }
        if u32::try_from(self.transfer.chunk_size).is_err() {
            return invalid("transfer.chunk_size does not fit in 32 bits");
        }
        if self.transfer.ack_timeout_ms == 0 {
            return invalid("transfer.ack_timeout_ms must be greater than zero");
        }
        if self.receiver.inactivity_timeout_secs == 0 {
            return invalid("receiver.inactivity_timeout_secs must be greater than zero");
        }
        if self.receiver.sweep_interval_secs == 0 {
            return invalid("receiver.sweep_interval_secs must be greater than zero");
        }
        if self.topics.namespace.trim_matches('/').is_empty() {
            return invalid("topics.namespace must not be empty");
        }
        if self.topics.namespace.contains(['+', '#']) {
            return invalid("topics.namespace must not contain wildcards");
        }
        if self.broker.host.is_empty() {
            return invalid("broker.host must not be empty");
        }
        Ok(())
    }

    /// Apply CHUNKCAST_* env var overrides, plus the MQTT_* names the lamp
    /// simulator has always read.
    ///
    /// `lookup` is `std::env::var` in production and a map in tests.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let first = |keys: &[&str]| keys.iter().find_map(|&k| lookup(k));
        let flag = |v: String| v == "true" || v == "1";

        if let Some(v) = first(&["CHUNKCAST_BROKER__HOST", "MQTT_BROKER"]) {
            self.broker.host = v;
        }
        if let Some(v) = first(&["CHUNKCAST_BROKER__PORT", "MQTT_PORT"]) {
            if let Ok(p) = v.parse() {
                self.broker.port = p;
            }
        }
        if let Some(v) = first(&["CHUNKCAST_BROKER__CLIENT_ID", "MQTT_CLIENT_ID"]) {
            self.broker.client_id = v;
        }
        if let Some(v) = first(&["CHUNKCAST_TOPICS__NAMESPACE"]) {
            self.topics.namespace = v;
        }
        if let Some(v) = first(&["CHUNKCAST_TOPICS__LAMP_COMMAND", "MQTT_TOPIC_CMD"]) {
            self.topics.lamp_command = v;
        }
        if let Some(v) = first(&["CHUNKCAST_TOPICS__LAMP_ACK", "MQTT_TOPIC_ACK"]) {
            self.topics.lamp_ack = v;
        }
        if let Some(v) = first(&["CHUNKCAST_TRANSFER__CHUNK_SIZE"]) {
            if let Ok(n) = v.parse() {
                self.transfer.chunk_size = n;
            }
        }
        if let Some(v) = first(&["CHUNKCAST_TRANSFER__CHUNK_DELAY_MS"]) {
            if let Ok(n) = v.parse() {
                self.transfer.chunk_delay_ms = n;
            }
        }
        if let Some(v) = first(&["CHUNKCAST_TRANSFER__ACK_TIMEOUT_MS"]) {
            if let Ok(n) = v.parse() {
                self.transfer.ack_timeout_ms = n;
            }
        }
        if let Some(v) = first(&["CHUNKCAST_TRANSFER__SESSION_IDS"]) {
            self.transfer.session_ids = flag(v);
        }
        if let Some(v) = first(&["CHUNKCAST_RECEIVER__OUTPUT_DIR"]) {
            self.receiver.output_dir = PathBuf::from(v);
        }
        if let Some(v) = first(&["CHUNKCAST_RECEIVER__INACTIVITY_TIMEOUT_SECS"]) {
            if let Ok(n) = v.parse() {
                self.receiver.inactivity_timeout_secs = n;
            }
        }
        if let Some(v) = first(&["CHUNKCAST_SERVICES__TRANSFERS"]) {
            self.services.transfers = flag(v);
        }
        if let Some(v) = first(&["CHUNKCAST_SERVICES__LAMP"]) {
            self.services.lamp = flag(v);
        }
        if let Some(v) = first(&["CHUNKCAST_SERVICES__COLOR"]) {
            self.services.color = flag(v);
        }
    }
}
