//! Agent configuration file.
//!
//! Lives at `~/.config/pcmon-mqtt/config.toml` unless `PCMON_MQTT_CONFIG`
//! points elsewhere. A file with defaults is written on first start; missing
//! sections and fields fall back to their defaults.

use crate::mqtt::config::{BrokerConfig, QueueConfig, RetryPolicy, SessionConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::fs::{create_dir_all, read_to_string, try_exists, write};
use tracing::{debug, info, warn, Level};

const CONFIG_DIR: &str = ".config/pcmon-mqtt";
const CONFIG_FILE: &str = "config.toml";
pub const CONFIG_PATH_ENV: &str = "PCMON_MQTT_CONFIG";
const FALLBACK_DEVICE_ID: &str = "pcmon";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid log level: {0}")]
    LogLevel(String),
}

impl ConfigError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub broker: BrokerConfig,
    pub device: DeviceConfig,
    pub retry: RetryPolicy,
    pub queue: QueueConfig,
    pub metrics: MetricsConfig,
    pub logging: LoggingConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct DeviceConfig {
    /// Used in topics, entity ids and the default client id
    pub id: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            id: default_device_id(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct MetricsConfig {
    /// Seconds between two sensor state publishes
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        MetricsConfig { interval_secs: 1 }
    }
}

impl MetricsConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn level(&self) -> Result<Level, ConfigError> {
        Level::from_str(self.level.trim()).map_err(|_| ConfigError::LogLevel(self.level.clone()))
    }
}

impl AppConfig {
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            broker: self.broker.clone(),
            device_id: self.device.id.trim().to_string(),
            retry: self.retry.clone(),
            queue: self.queue.clone(),
        }
    }

    /// Config file location, honouring the `PCMON_MQTT_CONFIG` override.
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            if !path.trim().is_empty() {
                return PathBuf::from(path);
            }
        }
        let mut path = get_home_dir();
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    }

    /// Writes a default config to `path` unless a file is already there.
    pub async fn ensure_default_config(path: &Path) -> Result<(), ConfigError> {
        if try_exists(path).await.map_err(|e| ConfigError::io(path, e))? {
            debug!("Config file {} already exists", path.display());
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            create_dir_all(parent)
                .await
                .map_err(|e| ConfigError::io(parent, e))?;
        }

        let content = AppConfig::default().to_toml()?;
        write(path, content)
            .await
            .map_err(|e| ConfigError::io(path, e))?;
        info!("Created default config at {}", path.display());
        Ok(())
    }

    pub async fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = read_to_string(path)
            .await
            .map_err(|e| ConfigError::io(path, e))?;
        Self::from_toml(&content)
    }

    /// Loads the config file, falling back to defaults if it is unreadable.
    pub async fn load_or_default(path: &Path) -> Self {
        match Self::load_from(path).await {
            Ok(config) => {
                info!("Loaded config from {}", path.display());
                config
            }
            Err(e) => {
                warn!("{}, using defaults", e);
                AppConfig::default()
            }
        }
    }
}

fn get_home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| {
        warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    })
}

fn default_device_id() -> String {
    ["COMPUTERNAME", "HOSTNAME"]
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .map(|name| name.trim().to_string())
        .find(|name| !name.is_empty())
        .unwrap_or_else(|| FALLBACK_DEVICE_ID.to_string())
}
