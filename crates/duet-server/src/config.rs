use serde::Deserialize;

/// Server configuration, loaded from a TOML file.
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// IP address to bind on (default "0.0.0.0").
    #[serde(default = "default_host")]
    pub host: String,

    /// TCP port for relay connections.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Maximum concurrently authenticated peers.
    #[serde(default = "default_max_peers")]
    pub max_peers: u32,

    /// Path to TLS certificate file (PEM).
    pub cert_path: String,

    /// Path to TLS private key file (PEM).
    pub key_path: String,
}

fn default_host() -> String {
    "0.0.0.0".into()
}

fn default_port() -> u16 {
    7443
}

fn default_max_peers() -> u32 {
    256
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_peers: default_max_peers(),
            cert_path: "certs/server.crt".into(),
            key_path: "certs/server.key".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 7443);
        assert_eq!(config.max_peers, 256);
    }

    #[test]
    fn config_toml_deserialization() {
        let toml = r#"
            port = 9000
            max_peers = 8
            cert_path = "test.crt"
            key_path = "test.key"
        "#;
        let config: ServerConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.max_peers, 8);
        assert_eq!(config.key_path, "test.key");
    }

    #[test]
    fn cert_paths_are_required_in_toml() {
        assert!(toml::from_str::<ServerConfig>("port = 1").is_err());
    }
}
