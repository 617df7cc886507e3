//! Configuration module
//!
//! Handles loading and saving the server configuration: listener settings,
//! user credentials and the static topology definitions.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::network::ListenerConfig;
use crate::protocol::DEFAULT_PORT;
use crate::topology::TopologyDescriptor;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Listener settings
    #[serde(default)]
    pub network: NetworkConfig,

    /// Username -> password. The server never sends these; clients prove
    /// knowledge through salted digests.
    #[serde(default)]
    pub users: HashMap<String, String>,

    /// Topologies clients may open
    #[serde(default)]
    pub topologies: Vec<TopologyDescriptor>,
}

/// Listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Address to bind
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Close sessions that have not authenticated within this many
    /// milliseconds. Absent means wait forever; the protocol mandates no
    /// timeout, so this is purely local policy.
    pub auth_timeout_ms: Option<u64>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: default_bind_address(),
            auth_timeout_ms: None,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default locations
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("simbridge/config.toml")),
            Some(PathBuf::from("./simbridge.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                return Self::load(path);
            }
        }

        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Listener configuration derived from this config
    pub fn listener(&self) -> ListenerConfig {
        ListenerConfig {
            port: self.network.port,
            bind_address: self.network.bind_address.clone(),
            auth_timeout: self.network.auth_timeout_ms.map(Duration::from_millis),
        }
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    use crate::topology::InterfaceSpec;
    use std::net::Ipv4Addr;

    let config = Config {
        network: NetworkConfig::default(),
        users: {
            let mut m = HashMap::new();
            m.insert("alice".to_string(), "alicepw".to_string());
            m
        },
        topologies: vec![TopologyDescriptor {
            id: 5,
            interfaces: vec![
                InterfaceSpec {
                    name: "eth0".to_string(),
                    mac: "02:00:00:00:01:01".to_string(),
                    ip: Ipv4Addr::new(10, 0, 1, 1),
                    mask: Ipv4Addr::new(255, 255, 255, 0),
                    port: 1,
                },
                InterfaceSpec {
                    name: "eth1".to_string(),
                    mac: "02:00:00:00:01:02".to_string(),
                    ip: Ipv4Addr::new(10, 0, 2, 1),
                    mask: Ipv4Addr::new(255, 255, 255, 0),
                    port: 2,
                },
            ],
            rtable: "0.0.0.0 10.0.1.1 0.0.0.0 eth0\n".to_string(),
        }],
    };

    Ok(toml::to_string_pretty(&config)?)
}
