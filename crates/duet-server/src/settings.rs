use serde::{Deserialize, Serialize};
use std::path::Path;

/// Runtime relay settings, loaded from a JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Signals a peer may publish back to back.
    #[serde(default = "default_publish_burst")]
    pub publish_burst: f64,

    /// Sustained publish rate per peer, in signals per second.
    #[serde(default = "default_publish_rate")]
    pub publish_rate_per_sec: f64,

    /// Largest accepted signaling payload in bytes. SDP blobs stay well below.
    #[serde(default = "default_max_payload_len")]
    pub max_payload_len: usize,
}

fn default_publish_burst() -> f64 {
    20.0
}
fn default_publish_rate() -> f64 {
    10.0
}
fn default_max_payload_len() -> usize {
    16 * 1024
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            publish_burst: default_publish_burst(),
            publish_rate_per_sec: default_publish_rate(),
            max_payload_len: default_max_payload_len(),
        }
    }
}

impl ServerSettings {
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}
