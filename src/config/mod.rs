//! Configuration module
//!
//! Handles loading and saving PeerChat configuration.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::peer::{KeepaliveConfig, NodeConfig};
use crate::protocol::{DEFAULT_PEER_PORT, DEFAULT_RENDEZVOUS_PORT};
use crate::reactor::ReactorConfig;

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

    #[error("Invalid bind address: {0}")]
    InvalidAddress(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Peer network settings
    #[serde(default)]
    pub network: NetworkConfig,

    /// Rendezvous settings
    #[serde(default)]
    pub rendezvous: RendezvousConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Nickname announced to peers
    #[serde(default = "default_name")]
    pub name: String,
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
    /// Log file path (optional)
    pub log_file: Option<PathBuf>,
}

fn default_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            verbose: false,
            log_file: None,
        }
    }
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Port to accept peers on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Interface to bind to (default: all)
    pub bind_address: Option<String>,
    /// Connection timeout in ms
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Quiet period before the first PING in ms
    #[serde(default = "default_keepalive_delay")]
    pub keepalive_delay_ms: u64,
    /// Time between PINGs in ms
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_ms: u64,
    /// Bytes requested per socket read
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,
    /// Unsent bytes allowed per peer before frames are dropped
    #[serde(default = "default_high_water")]
    pub outbound_high_water: usize,
}

fn default_port() -> u16 {
    DEFAULT_PEER_PORT
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_keepalive_delay() -> u64 {
    5000
}

fn default_keepalive_interval() -> u64 {
    10000
}

fn default_read_chunk_size() -> usize {
    4096
}

fn default_high_water() -> usize {
    4 * 1024 * 1024 // 4 MB
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: None,
            connect_timeout_ms: default_connect_timeout(),
            keepalive_delay_ms: default_keepalive_delay(),
            keepalive_interval_ms: default_keepalive_interval(),
            read_chunk_size: default_read_chunk_size(),
            outbound_high_water: default_high_water(),
        }
    }
}

/// Rendezvous configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RendezvousConfig {
    /// Server to register with and list from
    #[serde(default = "default_rendezvous_host")]
    pub host: String,
    /// Server port, also the port `peerchat rendezvous` listens on
    #[serde(default = "default_rendezvous_port")]
    pub port: u16,
    /// Interface the server binds to (default: all)
    pub bind_address: Option<String>,
}

fn default_rendezvous_host() -> String {
    "localhost".to_string()
}

fn default_rendezvous_port() -> u16 {
    DEFAULT_RENDEZVOUS_PORT
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            host: default_rendezvous_host(),
            port: default_rendezvous_port(),
            bind_address: None,
        }
    }
}

/// Parse an optional interface address, defaulting to all interfaces
fn bind_addr(interface: Option<&str>, port: u16) -> ConfigResult<SocketAddr> {
    let ip = match interface {
        Some(s) => s
            .parse::<IpAddr>()
            .map_err(|_| ConfigError::InvalidAddress(s.to_string()))?,
        None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
    };
    Ok(SocketAddr::new(ip, port))
}

impl NetworkConfig {
    pub fn keepalive(&self) -> KeepaliveConfig {
        KeepaliveConfig {
            delay: Duration::from_millis(self.keepalive_delay_ms),
            interval: Duration::from_millis(self.keepalive_interval_ms),
        }
    }

    /// Reactor settings for the peer listener
    pub fn reactor(&self) -> ReactorConfig {
        ReactorConfig {
            read_chunk_size: self.read_chunk_size.max(1),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            tick_interval: None,
            outbound_high_water: self.outbound_high_water,
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

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("peerchat/config.toml")),
            Some(PathBuf::from("./peerchat.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                return Self::load(path);
            }
        }

        // Return default config if no file found
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

    /// Settings for a chat node
    pub fn node_config(&self) -> ConfigResult<NodeConfig> {
        Ok(NodeConfig {
            name: self.general.name.clone(),
            bind_addr: bind_addr(self.network.bind_address.as_deref(), self.network.port)?,
            keepalive: self.network.keepalive(),
            reactor: self.network.reactor(),
            rendezvous_timeout: Duration::from_millis(self.network.connect_timeout_ms),
        })
    }

    /// Address a rendezvous server listens on
    pub fn rendezvous_bind_addr(&self) -> ConfigResult<SocketAddr> {
        bind_addr(self.rendezvous.bind_address.as_deref(), self.rendezvous.port)
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        general: GeneralConfig {
            name: "alice".to_string(),
            verbose: false,
            log_file: None,
        },
        rendezvous: RendezvousConfig {
            host: "rendezvous.example.org".to_string(),
            ..Default::default()
        },
        ..Default::default()
    };

    Ok(toml::to_string_pretty(&config)?)
}
