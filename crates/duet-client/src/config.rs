use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::session::SessionConfig;

/// Persistent client configuration, saved as `settings.json` in the Duet data directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Relay address as `host:port` (or `[v6]:port`).
    pub relay_address: String,
    /// PEM file with the CA (or self-signed certificate) trusted for the relay.
    /// None = the public web PKI roots.
    pub ca_cert_path: Option<String>,

    // Identity on the relay
    pub peer_id: Option<String>,
    pub username: Option<String>,

    /// Path to the key file. None = `keys.json` in the data directory.
    pub key_file: Option<String>,

    /// Give up on a connection attempt whose signaling has not completed in
    /// this many seconds. None = wait indefinitely.
    pub signaling_timeout_secs: Option<u64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_address: "localhost:7443".into(),
            ca_cert_path: None,
            peer_id: None,
            username: None,
            key_file: None,
            signaling_timeout_secs: None,
        }
    }
}

impl ClientConfig {
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read client config: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("invalid client config: {}", path.display()))
    }

    /// Load `settings.json` from the data directory, defaults if it does not exist yet.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = data_dir()?.join("settings.json");
        if path.exists() {
            Self::load_from_file(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save_to_file(&self, path: &Path) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("failed to write client config: {}", path.display()))
    }

    /// Where the device keypair lives.
    pub fn key_store_path(&self) -> anyhow::Result<PathBuf> {
        match &self.key_file {
            Some(path) => Ok(PathBuf::from(path)),
            None => Ok(data_dir()?.join("keys.json")),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            signaling_timeout: self.signaling_timeout_secs.map(Duration::from_secs),
        }
    }
}

/// Returns the Duet data directory (~/.config/Duet/ on Linux, %APPDATA%/Duet on Windows).
/// Creates the directory if it doesn't exist.
pub fn data_dir() -> anyhow::Result<PathBuf> {
    let dir = dirs::config_dir()
        .context("failed to determine config directory")?
        .join("Duet");
    if !dir.exists() {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    Ok(dir)
}
