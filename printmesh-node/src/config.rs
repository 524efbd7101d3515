//! Node configuration
//!
//! Handles:
//! - TOML file at `PRINTMESH_CONFIG` or the OS config directory
//! - Environment overrides for broker address, credentials and display name
//! - Read-only `ConfigStore` accessor shared by the managers

use crate::connection::ConnectionSettings;
use crate::error::{NodeError, NodeResult};
use crate::logging::LogSettings;
use crate::manager::{rank, Manager, DEFAULT_LOCK_TIMEOUT};
use crate::transport::Credentials;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

pub const CONFIG_PATH_ENV: &str = "PRINTMESH_CONFIG";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node: NodeSection,
    pub mqtt: MqttSection,
    pub discovery: DiscoverySection,
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    pub display_name: Option<String>,
    pub timezone: String,
    /// Overrides the crate version in status records
    pub firmware_version: Option<String>,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            display_name: None,
            timezone: "UTC".to_string(),
            firmware_version: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttSection {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    #[serde(skip_serializing)] // Never write passwords back
    pub password: Option<String>,
    pub tls: bool,
    pub ca_cert_path: Option<PathBuf>,
    pub keep_alive_secs: u64,
    pub max_packet_size: usize,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            enabled: true,
            host: String::new(),
            port: 8883,
            username: None,
            password: None,
            tls: true,
            ca_cert_path: None,
            keep_alive_secs: 30,
            max_packet_size: 4096,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySection {
    /// Prefix for every topic; none means bare `status/...`
    pub namespace: Option<String>,
    pub heartbeat_secs: u64,
    /// Remove offline peers after this long. Unset keeps them forever.
    pub evict_offline_after_secs: Option<u64>,
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            namespace: None,
            heartbeat_secs: 60,
            evict_offline_after_secs: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub queue_capacity: usize,
    pub max_line_length: usize,
}

impl Default for LoggingSection {
    fn default() -> Self {
        let defaults = LogSettings::default();
        Self {
            queue_capacity: defaults.capacity,
            max_line_length: defaults.max_line_length,
        }
    }
}

impl NodeConfig {
    /// Load from the configured path, apply environment overrides.
    /// A missing file yields defaults.
    pub fn load() -> Result<Self> {
        let path = Self::config_file_path()?;
        let mut config = Self::load_from(&path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: NodeConfig =
            toml::from_str(&content).with_context(|| format!("Invalid config {}", path.display()))?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// `PRINTMESH_CONFIG`, else `<config dir>/printmesh/config.toml`.
    pub fn config_file_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            return Ok(PathBuf::from(path));
        }
        let mut path = dirs::config_dir().ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        path.push("printmesh");
        path.push("config.toml");
        Ok(path)
    }

    /// Apply `PRINTMESH_*` overrides read through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> NodeResult<()> {
        if let Some(host) = lookup("PRINTMESH_MQTT_HOST") {
            self.mqtt.host = host;
        }
        if let Some(port) = lookup("PRINTMESH_MQTT_PORT") {
            self.mqtt.port = port
                .trim()
                .parse()
                .map_err(|_| NodeError::Config(format!("PRINTMESH_MQTT_PORT is not a port: {port}")))?;
        }
        if let Some(username) = lookup("PRINTMESH_MQTT_USERNAME") {
            self.mqtt.username = Some(username);
        }
        if let Some(password) = lookup("PRINTMESH_MQTT_PASSWORD") {
            self.mqtt.password = Some(password);
        }
        if let Some(name) = lookup("PRINTMESH_DISPLAY_NAME") {
            self.node.display_name = Some(name);
        }
        Ok(())
    }

    pub fn connection_settings(&self, client_id: String) -> ConnectionSettings {
        let credentials = self.mqtt.username.as_ref().map(|username| Credentials {
            username: username.clone(),
            password: self.mqtt.password.clone().unwrap_or_default(),
        });
        ConnectionSettings {
            enabled: self.mqtt.enabled,
            client_id,
            host: self.mqtt.host.clone(),
            port: self.mqtt.port,
            credentials,
            tls: self.mqtt.tls,
            ca_cert_path: self.mqtt.ca_cert_path.clone(),
            keep_alive_secs: self.mqtt.keep_alive_secs,
            max_packet_size: self.mqtt.max_packet_size,
        }
    }

    pub fn log_settings(&self) -> LogSettings {
        LogSettings {
            capacity: self.logging.queue_capacity,
            max_line_length: self.logging.max_line_length,
        }
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.discovery.heartbeat_secs.max(1))
    }

    pub fn eviction_threshold(&self) -> Option<Duration> {
        self.discovery.evict_offline_after_secs.map(Duration::from_secs)
    }
}

/// Read accessor over the loaded configuration.
pub struct ConfigStore {
    config: Manager<NodeConfig>,
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigStore {
    pub fn new() -> Self {
        Self {
            config: Manager::new("CONFIG", rank::CONFIG),
        }
    }

    pub fn begin(&self, config: NodeConfig) -> bool {
        self.config.begin(|| config)
    }

    pub fn snapshot(&self) -> NodeResult<NodeConfig> {
        self.config.with(Some(DEFAULT_LOCK_TIMEOUT), |c| c.clone())
    }

    /// Swap in a reloaded configuration. Managers pick it up on reconfigure.
    pub fn replace(&self, config: NodeConfig) -> NodeResult<()> {
        self.config.with(Some(DEFAULT_LOCK_TIMEOUT), |c| *c = config)
    }
}
