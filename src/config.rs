//! Configuration file
//!
//! ```toml
//! [network]
//! host = "127.0.0.1"
//! mqttport = 8913
//! probe_interval_secs = 15
//!
//! [params]
//! home = "Home"
//!
//! [devices]
//! lights = ["s20/porch"]
//! ```
//!
//! Every key is optional. A missing file is reported as [`ConfigError::NotFound`];
//! the caller then runs with [`BridgeConfig::unconfigured`] and the engine idles.

use crate::device::DeviceOptions;
use crate::mqtt::config::{MqttConfig, DEFAULT_CLIENT_ID, DEFAULT_HOST, DEFAULT_PORT};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

pub const APP_DIR: &str = "devicelink";
pub const CONFIG_FILE: &str = "config.toml";
pub const DEFAULT_HOME: &str = "Home";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("No configuration file at {0}")]
    NotFound(PathBuf),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct NetworkConfig {
    pub host: String,
    pub mqttport: u16,
    pub client_id: String,
    pub keep_alive_secs: u64,
    pub connect_timeout_secs: u64,
    pub publish_timeout_secs: u64,
    pub probe_interval_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            mqttport: DEFAULT_PORT,
            client_id: DEFAULT_CLIENT_ID.to_string(),
            keep_alive_secs: 30,
            connect_timeout_secs: 10,
            publish_timeout_secs: 5,
            probe_interval_secs: 15,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct ParamsConfig {
    pub home: String,
}

impl Default for ParamsConfig {
    fn default() -> Self {
        Self {
            home: DEFAULT_HOME.to_string(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct DevicesConfig {
    pub lights: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct BridgeConfig {
    pub network: NetworkConfig,
    pub params: ParamsConfig,
    pub devices: DevicesConfig,
}

impl BridgeConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                ConfigError::NotFound(path.to_path_buf())
            } else {
                ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;

        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Loaded configuration from {}", path.display());
        debug!("{:?}", config);
        Ok(config)
    }

    /// Defaults with no broker, used when there is no usable file
    pub fn unconfigured() -> Self {
        let mut config = Self::default();
        config.network.host.clear();
        config.network.mqttport = 0;
        config
    }

    /// `<config dir>/devicelink/config.toml`, or relative to the working
    /// directory when the platform has no config dir
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .map(|dir| dir.join(APP_DIR))
            .unwrap_or_default()
            .join(CONFIG_FILE)
    }

    pub fn mqtt_config(&self) -> MqttConfig {
        let network = &self.network;
        MqttConfig {
            host: network.host.trim().to_string(),
            port: network.mqttport,
            client_id: network.client_id.clone(),
            keep_alive: Duration::from_secs(network.keep_alive_secs),
            connect_timeout: Duration::from_secs(network.connect_timeout_secs),
            publish_timeout: Duration::from_secs(network.publish_timeout_secs),
        }
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.network.probe_interval_secs)
    }

    /// Whether a running connectivity probe built from `other` is out of date
    pub fn probe_differs(&self, other: &Self) -> bool {
        !self.mqtt_config().same_broker(&other.mqtt_config())
            || self.probe_interval() != other.probe_interval()
    }

    pub fn device_options(&self) -> DeviceOptions {
        DeviceOptions {
            lights: self.devices.lights.iter().cloned().collect(),
        }
    }

    pub fn home(&self) -> &str {
        &self.params.home
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn empty_file_gives_defaults() {
        let file = write_config("");
        let config = BridgeConfig::load(file.path()).unwrap();
        assert_eq!(config, BridgeConfig::default());

        let mqtt = config.mqtt_config();
        assert_eq!(mqtt.broker(), "127.0.0.1:8913");
        assert_eq!(config.home(), "Home");
        assert_eq!(config.probe_interval(), Duration::from_secs(15));
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let file = write_config(
            r#"
[network]
host = "broker.lan"

[devices]
lights = ["s20/porch"]
"#,
        );
        let config = BridgeConfig::load(file.path()).unwrap();
        assert_eq!(config.network.host, "broker.lan");
        assert_eq!(config.network.mqttport, 8913);
        assert_eq!(config.params.home, "Home");
        assert!(config.device_options().lights.contains("s20/porch"));
    }

    #[test]
    fn timeouts_become_durations() {
        let file = write_config(
            r#"
[network]
mqttport = 1883
publish_timeout_secs = 2
probe_interval_secs = 0
"#,
        );
        let config = BridgeConfig::load(file.path()).unwrap();
        let mqtt = config.mqtt_config();
        assert_eq!(mqtt.port, 1883);
        assert_eq!(mqtt.publish_timeout, Duration::from_secs(2));
        assert!(config.probe_interval().is_zero());
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(matches!(
            BridgeConfig::load(&path),
            Err(ConfigError::NotFound(p)) if p == path
        ));
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let file = write_config("[network\nhost = ");
        assert!(matches!(
            BridgeConfig::load(file.path()),
            Err(ConfigError::Parse { .. })
        ));

        let wrong_type = write_config("[network]\nmqttport = \"high\"");
        assert!(matches!(
            BridgeConfig::load(wrong_type.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn probe_follows_broker_and_interval() {
        let base = BridgeConfig::default();

        let mut slower = base.clone();
        slower.network.probe_interval_secs = 60;
        assert!(slower.probe_differs(&base));

        let mut moved = base.clone();
        moved.network.mqttport = 1883;
        assert!(moved.probe_differs(&base));

        let mut renamed = base.clone();
        renamed.params.home = "Cabin".to_string();
        renamed.network.publish_timeout_secs = 1;
        assert!(!renamed.probe_differs(&base));
    }

    #[test]
    fn unconfigured_leaves_engine_idle() {
        let config = BridgeConfig::unconfigured();
        assert!(!config.mqtt_config().is_configured());
        assert_eq!(config.home(), "Home");
    }

    #[test]
    fn default_path_ends_in_app_dir() {
        let path = BridgeConfig::default_path();
        assert!(path.ends_with("config.toml"));
    }
}
