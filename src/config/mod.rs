//! Configuration module
//!
//! Handles loading and saving RelayNet configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::context::Timings;
use crate::network::{self, InactiveAction};
use crate::protocol::{Identity, PacketTag, DEFAULT_PORT};

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
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Network settings
    #[serde(default)]
    pub network: NetworkConfig,

    /// Security settings
    #[serde(default)]
    pub security: SecurityConfig,

    /// Protocol timings and admission
    #[serde(default)]
    pub protocol: ProtocolConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Identity namespace (defaults to the host name)
    pub namespace: String,
    /// Fixed identity id (random per run if not set)
    pub id: Option<Uuid>,
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            namespace: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            id: None,
            verbose: false,
        }
    }
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Hub bind address, or the hub host a peer connects to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on or connect to
    #[serde(default = "default_port")]
    pub port: u16,
    /// Connection timeout in ms
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_connect_timeout() -> u64 {
    5000
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            connect_timeout_ms: default_connect_timeout(),
        }
    }
}

/// Security configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Wrap connections in TLS (self-signed hub certificate, trust-all peers)
    #[serde(default)]
    pub tls: bool,
}

/// Protocol configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Ceiling for blocking requests in ms
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    /// Deadline for future-based requests in ms
    #[serde(default = "default_response_deadline")]
    pub response_deadline_ms: u64,
    /// Pause before the hub acts on a routing request, in ms
    #[serde(default = "default_relay_delay")]
    pub relay_delay_ms: u64,
    /// Gap between queued sends in ms
    #[serde(default = "default_queue_pacing")]
    pub queue_pacing_ms: u64,
    /// Keep-alive interval in ms
    #[serde(default = "default_keep_alive")]
    pub keep_alive_interval_ms: u64,
    /// What a peer does when the hub goes away
    #[serde(default)]
    pub inactive_action: InactiveAction,
    /// Application packet tags to admit at startup
    #[serde(default)]
    pub allowed_tags: Vec<u32>,
    /// Admit every tag; trusted networks only
    #[serde(default)]
    pub bypass_admission: bool,
}

fn default_request_timeout() -> u64 {
    2500
}

fn default_response_deadline() -> u64 {
    5000
}

fn default_relay_delay() -> u64 {
    100
}

fn default_queue_pacing() -> u64 {
    10
}

fn default_keep_alive() -> u64 {
    60_000
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout(),
            response_deadline_ms: default_response_deadline(),
            relay_delay_ms: default_relay_delay(),
            queue_pacing_ms: default_queue_pacing(),
            keep_alive_interval_ms: default_keep_alive(),
            inactive_action: InactiveAction::default(),
            allowed_tags: Vec::new(),
            bypass_admission: false,
        }
    }
}

impl ProtocolConfig {
    pub fn timings(&self) -> Timings {
        Timings {
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            response_deadline: Duration::from_millis(self.response_deadline_ms),
            relay_delay: Duration::from_millis(self.relay_delay_ms),
            queue_pacing: Duration::from_millis(self.queue_pacing_ms),
            keep_alive_interval: Duration::from_millis(self.keep_alive_interval_ms),
        }
    }

    /// Tags to admit on top of the built-in system tags
    pub fn admitted_tags(&self) -> Vec<PacketTag> {
        let mut tags: Vec<_> = self.allowed_tags.iter().copied().map(PacketTag).collect();
        if self.bypass_admission {
            tags.push(PacketTag::BYPASS_ALL);
        }
        tags
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
            dirs::config_dir().map(|p| p.join("relaynet/config.toml")),
            Some(PathBuf::from("./relaynet.toml")),
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

    /// This endpoint's identity; the id is random unless configured
    pub fn identity(&self) -> Identity {
        Identity::new(
            self.general.namespace.clone(),
            self.general.id.unwrap_or_else(Uuid::new_v4),
        )
    }

    /// Runtime network settings
    pub fn network_config(&self) -> network::NetworkConfig {
        network::NetworkConfig {
            host: self.network.host.clone(),
            port: self.network.port,
            use_tls: self.security.tls,
            connect_timeout_ms: self.network.connect_timeout_ms,
            inactive_action: self.protocol.inactive_action,
            timings: self.protocol.timings(),
        }
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        general: GeneralConfig {
            namespace: "workstation".to_string(),
            id: None,
            verbose: false,
        },
        protocol: ProtocolConfig {
            allowed_tags: vec![1],
            ..Default::default()
        },
        ..Default::default()
    };

    Ok(toml::to_string_pretty(&config)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.port, DEFAULT_PORT);
        assert_eq!(config.protocol.timings(), Timings::default());
        assert!(!config.security.tls);
    }

    #[test]
    fn test_save_and_load() {
        let mut config = Config::default();
        config.general.id = Some(Uuid::new_v4());
        config.protocol.inactive_action = InactiveAction::Shutdown;
        let file = NamedTempFile::new().unwrap();

        config.save(file.path()).unwrap();

        let loaded = Config::load(file.path()).unwrap();
        assert_eq!(loaded.network.port, config.network.port);
        assert_eq!(loaded.general.id, config.general.id);
        assert_eq!(loaded.protocol.inactive_action, InactiveAction::Shutdown);
        assert_eq!(loaded.identity().id, config.general.id.unwrap());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[security]\ntls = true\n\n[protocol]\nrelay_delay_ms = 5\ninactive_action = \"shutdown\"\nbypass_admission = true"
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        let network = config.network_config();
        assert!(network.use_tls);
        assert_eq!(network.port, DEFAULT_PORT);
        assert_eq!(network.timings.relay_delay, Duration::from_millis(5));
        assert_eq!(network.timings.queue_pacing, Duration::from_millis(10));
        assert_eq!(network.inactive_action, InactiveAction::Shutdown);
        assert_eq!(config.protocol.admitted_tags(), vec![PacketTag::BYPASS_ALL]);
    }

    #[test]
    fn test_missing_file() {
        let path = Path::new("/definitely/not/here/relaynet.toml");
        assert!(matches!(Config::load(path), Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_sample_config() {
        let sample = generate_sample_config().unwrap();
        let parsed: Config = toml::from_str(&sample).unwrap();
        assert_eq!(parsed.general.namespace, "workstation");
        assert_eq!(parsed.protocol.admitted_tags(), vec![PacketTag(1)]);
    }
}
