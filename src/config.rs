use crate::matcher::WakeTriggerSet;
use crate::wait::WaitPolicy;
use crate::wake::{WakeMessages, WakeTarget};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Environment variables that override file values when set
pub const ENV_API_KEY: &str = "WAKEGATE_API_KEY";
pub const ENV_MAC_ADDRESS: &str = "WAKEGATE_MAC_ADDRESS";
pub const ENV_BROADCAST_ADDRESS: &str = "WAKEGATE_BROADCAST_ADDRESS";

/// Gateway configuration
#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Base URL of the media server API (session notifications)
    pub backend_base_url: String,

    /// API key sent as X-MediaBrowser-Token
    #[serde(default)]
    pub api_key: String,

    /// Hardware address of the machine to wake
    pub mac_address: String,

    /// Where magic packets are sent (e.g. "192.168.1.255:9")
    pub broadcast_address: String,

    /// Port probed to decide whether the backend is awake
    pub wake_probe_port: u16,

    /// Host probed to decide whether the backend is awake
    pub wake_probe_ip: String,

    /// Host requests are forwarded to
    pub forward_ip: String,

    /// Port requests are forwarded to
    pub forward_port: u16,

    /// Paths that require the backend to be awake (exact or single `*`)
    #[serde(default)]
    pub wake_trigger_endpoints: Vec<String>,

    /// Port the gateway listens on (default: 3881)
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Interval between availability probes while waiting, in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// How long a request waits for the backend to wake, in seconds
    #[serde(default = "default_wake_timeout_secs")]
    pub wake_timeout_secs: u64,

    /// Bound on a single availability probe, in milliseconds
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Timeout for session API calls, in seconds
    #[serde(default = "default_notify_timeout_secs")]
    pub notify_timeout_secs: u64,

    /// Max time to wait for the backend's response headers, in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Maximum idle forwarding connections (default: 10)
    #[serde(default = "default_pool_max_idle")]
    pub pool_max_idle: usize,

    /// Idle forwarding connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout_secs")]
    pub pool_idle_timeout_secs: u64,

    /// Header of on-screen messages
    #[serde(default = "default_message_header")]
    pub message_header: String,

    /// Message shown to playing sessions when a wake starts
    #[serde(default = "default_starting_message")]
    pub starting_message: String,

    /// Message shown to all sessions once the backend answers
    #[serde(default = "default_online_message")]
    pub online_message: String,

    /// How long clients display messages, in milliseconds
    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u64,
}

// Default value functions
fn default_listen_port() -> u16 {
    3881
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_poll_interval_ms() -> u64 {
    5000 // 5 seconds
}

fn default_wake_timeout_secs() -> u64 {
    120 // 2 minutes
}

fn default_probe_timeout_ms() -> u64 {
    3000
}

fn default_notify_timeout_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    300 // large media responses can be slow to start
}

fn default_pool_max_idle() -> usize {
    10
}

fn default_pool_idle_timeout_secs() -> u64 {
    90
}

fn default_message_header() -> String {
    WakeMessages::default().header
}

fn default_starting_message() -> String {
    WakeMessages::default().starting
}

fn default_online_message() -> String {
    WakeMessages::default().online
}

fn default_message_timeout_ms() -> u64 {
    5000
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e))?;
        let mut config = Self::parse(&content, path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse JSON for `.json` files, TOML otherwise
    pub fn parse(content: &str, path: &Path) -> anyhow::Result<Self> {
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let config = if is_json {
            serde_json::from_str(content)?
        } else {
            toml::from_str(content)?
        };
        Ok(config)
    }

    /// Replace secrets and wake identity with environment values when present
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_API_KEY) {
            self.api_key = value;
        }
        if let Some(value) = lookup(ENV_MAC_ADDRESS) {
            self.mac_address = value;
        }
        if let Some(value) = lookup(ENV_BROADCAST_ADDRESS) {
            self.broadcast_address = value;
        }
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.mac_address.trim().is_empty() {
            errors.push("'macAddress' must not be empty".to_string());
        } else if let Err(e) = crate::wol::parse_mac(&self.mac_address) {
            errors.push(format!("'macAddress': {}", e));
        }
        if self.broadcast_address.trim().is_empty() {
            errors.push("'broadcastAddress' must not be empty".to_string());
        }
        if self.wake_probe_ip.trim().is_empty() {
            errors.push("'wakeProbeIp' must not be empty".to_string());
        }
        if self.wake_probe_port == 0 {
            errors.push("'wakeProbePort' must be greater than 0".to_string());
        }
        if self.forward_ip.trim().is_empty() {
            errors.push("'forwardIp' must not be empty".to_string());
        }
        if self.forward_port == 0 {
            errors.push("'forwardPort' must be greater than 0".to_string());
        }
        if !(self.backend_base_url.starts_with("http://") || self.backend_base_url.starts_with("https://")) {
            errors.push(format!(
                "'backendBaseUrl' must start with http:// or https:// (got '{}')",
                self.backend_base_url
            ));
        }
        if self.poll_interval_ms == 0 {
            errors.push("'pollIntervalMs' must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        for pattern in self.trigger_set().invalid_patterns() {
            warn!(pattern = pattern.as_str(), "Wake trigger pattern has more than one '*' and will never match");
        }

        Ok(())
    }

    pub fn probe_address(&self) -> String {
        format!("{}:{}", self.wake_probe_ip, self.wake_probe_port)
    }

    pub fn forward_address(&self) -> String {
        format!("{}:{}", self.forward_ip, self.forward_port)
    }

    pub fn trigger_set(&self) -> WakeTriggerSet {
        WakeTriggerSet::new(self.wake_trigger_endpoints.iter().cloned())
    }

    pub fn wake_target(&self) -> WakeTarget {
        WakeTarget {
            mac_address: self.mac_address.clone(),
            broadcast_address: self.broadcast_address.clone(),
        }
    }

    pub fn wake_messages(&self) -> WakeMessages {
        WakeMessages {
            header: self.message_header.clone(),
            starting: self.starting_message.clone(),
            online: self.online_message.clone(),
        }
    }

    pub fn wait_policy(&self) -> WaitPolicy {
        WaitPolicy {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            deadline: Duration::from_secs(self.wake_timeout_secs),
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn notify_timeout(&self) -> Duration {
        Duration::from_secs(self.notify_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use std::path::PathBuf;

    const JSON_CONFIG: &str = r#"{
        "backendBaseUrl": "http://192.168.1.20:8096",
        "apiKey": "0123456789abcdef",
        "macAddress": "b0:6e:bf:c5:5f:69",
        "broadcastAddress": "192.168.1.255:9",
        "wakeProbePort": 8096,
        "wakeProbeIp": "192.168.1.20",
        "forwardIp": "192.168.1.20",
        "forwardPort": 8096,
        "wakeTriggerEndpoints": ["/Users/*/Items", "/Videos/*/stream", "/System/Info"]
    }"#;

    fn json_config() -> Config {
        Config::parse(JSON_CONFIG, &PathBuf::from("config.json")).unwrap()
    }

    #[test]
    fn test_parse_json_config() {
        let config = json_config();

        assert_eq!(config.backend_base_url, "http://192.168.1.20:8096");
        assert_eq!(config.api_key, "0123456789abcdef");
        assert_eq!(config.wake_probe_port, 8096);
        assert_eq!(config.wake_trigger_endpoints.len(), 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_defaults() {
        let config = json_config();

        assert_eq!(config.listen_port, 3881);
        assert_eq!(config.bind, "0.0.0.0");
        assert_eq!(config.wait_policy(), WaitPolicy::default());
        assert_eq!(config.probe_timeout(), Duration::from_secs(3));
        assert_eq!(config.notify_timeout(), Duration::from_secs(10));
        assert_eq!(config.request_timeout(), Duration::from_secs(300));
        assert_eq!(config.pool_max_idle, 10);
        assert_eq!(config.message_header, "Information");
        assert_eq!(config.message_timeout_ms, 5000);
    }

    #[test]
    fn test_parse_toml_config() {
        let toml = r#"
backendBaseUrl = "http://media.lan:8096"
macAddress = "aa:bb:cc:dd:ee:ff"
broadcastAddress = "255.255.255.255"
wakeProbePort = 8096
wakeProbeIp = "media.lan"
forwardIp = "media.lan"
forwardPort = 8096
wakeTriggerEndpoints = ["/web/*"]
listenPort = 8080
pollIntervalMs = 1000
wakeTimeoutSecs = 30
"#;
        let config = Config::parse(toml, &PathBuf::from("config.toml")).unwrap();

        assert_eq!(config.listen_port, 8080);
        assert_eq!(config.api_key, "");
        assert_eq!(
            config.wait_policy(),
            WaitPolicy {
                poll_interval: Duration::from_secs(1),
                deadline: Duration::from_secs(30),
            }
        );
        assert!(config.trigger_set().matches("/web/index.html"));
    }

    #[test]
    fn test_derived_addresses() {
        let config = json_config();

        assert_eq!(config.probe_address(), "192.168.1.20:8096");
        assert_eq!(config.forward_address(), "192.168.1.20:8096");
        assert_eq!(
            config.wake_target(),
            WakeTarget {
                mac_address: "b0:6e:bf:c5:5f:69".to_string(),
                broadcast_address: "192.168.1.255:9".to_string(),
            }
        );
    }

    #[test]
    fn test_missing_required_field() {
        let result = Config::parse(r#"{"backendBaseUrl": "http://x"}"#, &PathBuf::from("c.json"));
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_reports_all_errors() {
        let mut config = json_config();
        config.mac_address = "not-a-mac".to_string();
        config.forward_port = 0;
        config.backend_base_url = "192.168.1.20:8096".to_string();

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("'macAddress'"));
        assert!(err.contains("'forwardPort' must be greater than 0"));
        assert!(err.contains("'backendBaseUrl' must start with http://"));
    }

    #[test]
    fn test_invalid_trigger_pattern_is_not_fatal() {
        let mut config = json_config();
        config.wake_trigger_endpoints.push("/a*b*c".to_string());
        assert!(config.validate().is_ok());
        assert_eq!(config.trigger_set().invalid_patterns().count(), 1);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = json_config();
        let env: HashMap<&str, &str> = [(ENV_API_KEY, "from-env"), (ENV_MAC_ADDRESS, "11:22:33:44:55:66")]
            .into_iter()
            .collect();

        config.apply_env_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.api_key, "from-env");
        assert_eq!(config.mac_address, "11:22:33:44:55:66");
        assert_eq!(config.broadcast_address, "192.168.1.255:9");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        file.write_all(JSON_CONFIG.as_bytes()).unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.forward_port, 8096);
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load("/nonexistent/wakegate.json").unwrap_err().to_string();
        assert!(err.contains("Failed to read config file"));
    }

    #[test]
    fn test_custom_messages() {
        let mut config = json_config();
        config.starting_message = "Le serveur démarre...".to_string();

        let messages = config.wake_messages();
        assert_eq!(messages.starting, "Le serveur démarre...");
        assert_eq!(messages.online, WakeMessages::default().online);
    }
}
