//! Relay configuration.

use serde::{Deserialize, Serialize};

use crate::net::{Endpoint, DEFAULT_MAX_CONNECTIONS};

/// Runtime relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Endpoint the SOCKS server listens on. Port 0 binds an ephemeral
    /// port.
    pub listen: Endpoint,
    /// Admission limit for concurrent client connections.
    pub max_connections: usize,
    /// Ask the transport factory for an obfuscated peer connection. The
    /// relay core only plumbs this through; the transport interprets it.
    pub obfuscate: bool,
}

impl RelayConfig {
    /// Create a configuration with defaults for everything but the listen
    /// endpoint.
    pub fn new(listen: Endpoint) -> Self {
        Self {
            listen,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            obfuscate: false,
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.listen.address.is_empty() {
            return Err("listen address cannot be empty".into());
        }
        if self.max_connections == 0 {
            return Err("max_connections must be at least 1".into());
        }
        Ok(())
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::new(Endpoint::new("127.0.0.1", 1080))
    }
}

/// Configuration file format for serialization.
#[derive(Serialize, Deserialize)]
pub struct RelayConfigFile {
    /// Listen address
    pub listen_addr: String,
    /// Listen port
    pub listen_port: u16,
    /// Maximum concurrent client connections
    pub max_connections: Option<usize>,
    /// Request an obfuscated peer connection
    pub obfuscate: Option<bool>,
}

impl RelayConfigFile {
    /// Convert to runtime configuration.
    pub fn to_config(&self) -> Result<RelayConfig, String> {
        let config = RelayConfig {
            listen: Endpoint::new(self.listen_addr.clone(), self.listen_port),
            max_connections: self.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS),
            obfuscate: self.obfuscate.unwrap_or(false),
        };
        config.validate()?;
        Ok(config)
    }

    /// Create from runtime configuration.
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            listen_addr: config.listen.address.clone(),
            listen_port: config.listen.port,
            max_connections: Some(config.max_connections),
            obfuscate: Some(config.obfuscate),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.listen, Endpoint::new("127.0.0.1", 1080));
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert!(!config.obfuscate);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let config = RelayConfig::new(Endpoint::new("", 1080));
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.max_connections = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_round_trip() {
        let mut config = RelayConfig::new(Endpoint::new("0.0.0.0", 9050));
        config.obfuscate = true;

        let file = RelayConfigFile::from_config(&config);
        let json = serde_json::to_string(&file).unwrap();
        let parsed: RelayConfigFile = serde_json::from_str(&json).unwrap();
        let restored = parsed.to_config().unwrap();

        assert_eq!(restored.listen, config.listen);
        assert_eq!(restored.max_connections, config.max_connections);
        assert!(restored.obfuscate);
    }

    #[test]
    fn test_file_defaults_missing_fields() {
        let parsed: RelayConfigFile =
            serde_json::from_str(r#"{"listen_addr":"127.0.0.1","listen_port":1080}"#).unwrap();
        let config = parsed.to_config().unwrap();
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert!(!config.obfuscate);
    }
}
