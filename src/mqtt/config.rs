use std::time::Duration;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8913;
pub const DEFAULT_CLIENT_ID: &str = "devicelink";

/// Broker settings the engine runs with
///
/// An empty host or a zero port means "not configured": the engine idles
/// instead of failing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub publish_timeout: Duration,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            client_id: DEFAULT_CLIENT_ID.to_string(),
            keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            publish_timeout: Duration::from_secs(5),
        }
    }
}

impl MqttConfig {
    pub fn unconfigured() -> Self {
        Self {
            host: String::new(),
            port: 0,
            ..Self::default()
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.host.trim().is_empty() && self.port != 0
    }

    /// `host:port`, also used as the probe target
    pub fn broker(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Host and port are the only settings that force a new session
    pub fn same_broker(&self, other: &MqttConfig) -> bool {
        self.host == other.host && self.port == other.port
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_point_at_local_broker() {
        let config = MqttConfig::default();
        assert!(config.is_configured());
        assert_eq!(config.broker(), "127.0.0.1:8913");
    }

    #[test]
    fn empty_host_or_zero_port_is_unconfigured() {
        assert!(!MqttConfig::unconfigured().is_configured());
        let blank = MqttConfig {
            host: "  ".to_string(),
            ..MqttConfig::default()
        };
        assert!(!blank.is_configured());
        let no_port = MqttConfig {
            port: 0,
            ..MqttConfig::default()
        };
        assert!(!no_port.is_configured());
    }

    #[test]
    fn only_host_and_port_identify_the_broker() {
        let base = MqttConfig::default();
        let tuned = MqttConfig {
            publish_timeout: Duration::from_secs(1),
            client_id: "other".to_string(),
            ..base.clone()
        };
        assert!(base.same_broker(&tuned));
        let moved = MqttConfig {
            port: 1883,
            ..base.clone()
        };
        assert!(!base.same_broker(&moved));
    }
}
