//! Cluster configuration shared by every member of a gossip cluster.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::NetworkError;

/// Default upper bound on a single frame's payload.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Smallest accepted frame limit; anything lower cannot carry a 1 MB payload.
pub const MIN_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Configuration for a gossip cluster.
///
/// The cluster key is distributed out of band. It never appears on the wire;
/// it only keys the handshake proofs.
#[derive(Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Shared secret establishing trust among members.
    #[serde(with = "hex_serde")]
    pub cluster_key: Vec<u8>,

    /// Timeout for establishing the TCP connection to a member.
    #[serde(rename = "connect_timeout_ms", with = "duration_ms")]
    pub connect_timeout: Duration,

    /// Timeout for the whole challenge/response exchange.
    #[serde(rename = "handshake_timeout_ms", with = "duration_ms")]
    pub handshake_timeout: Duration,

    /// Largest payload accepted in a single frame.
    pub max_frame_size: usize,

    /// Number of frames that may wait in a connection's send queue before
    /// senders are made to wait.
    pub send_queue_depth: usize,
}

impl ClusterConfig {
    /// Create a config with the given key and default limits.
    pub fn new(cluster_key: impl Into<Vec<u8>>) -> Self {
        Self {
            cluster_key: cluster_key.into(),
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            send_queue_depth: 64,
        }
    }

    /// Check the config is usable.
    pub fn validate(&self) -> Result<(), NetworkError> {
        if self.cluster_key.is_empty() {
            return Err(NetworkError::Config("Cluster key must not be empty".to_string()));
        }
        if self.send_queue_depth == 0 {
            return Err(NetworkError::Config("Send queue depth must be at least 1".to_string()));
        }
        if self.max_frame_size < MIN_MAX_FRAME_SIZE {
            return Err(NetworkError::Config(format!(
                "Max frame size must be at least {MIN_MAX_FRAME_SIZE} bytes"
            )));
        }
        if self.connect_timeout.is_zero() || self.handshake_timeout.is_zero() {
            return Err(NetworkError::Config("Timeouts must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Save the config to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), NetworkError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from a JSON file.
    pub fn load_from_file(path: &Path) -> Result<Self, NetworkError> {
        let data = std::fs::read_to_string(path)?;
        let config: ClusterConfig = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a JSON file, or fall back to `default` if the file is
    /// missing or unusable.
    pub fn load_or_default(path: &Path, default: ClusterConfig) -> Self {
        if path.exists() {
            match Self::load_from_file(path) {
                Ok(config) => return config,
                Err(e) => {
                    tracing::warn!("Unusable cluster config file, using defaults: {e}");
                }
            }
        }
        default
    }
}

impl fmt::Debug for ClusterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterConfig")
            .field("cluster_key", &"<redacted>")
            .field("connect_timeout", &self.connect_timeout)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("max_frame_size", &self.max_frame_size)
            .field("send_queue_depth", &self.send_queue_depth)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod hex_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

/// Durations are stored as whole milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(dur.as_millis()).unwrap_or(u64::MAX);
        s.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
