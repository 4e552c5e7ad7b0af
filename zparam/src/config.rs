//! Broker settings and the zenoh session overrides derived from them

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use zenoh::Result;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 1883;
pub const DEFAULT_ROOT_TOPIC: &str = "zparam";
pub const DEFAULT_CONTROL_ROOT: &str = "zparam/control/";
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_MONITOR_INTERVAL_MS: u64 = 250;

/// Environment variable naming a json5 file with a [`BrokerConfig`]
pub const CONFIG_FILE_ENV: &str = "ZPARAM_CONFIG_FILE";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    /// Prefix of every parameter subscription topic
    pub root_topic: String,
    /// Prefix of control publishes; include a trailing separator if wanted
    pub control_root: String,
    pub connect_timeout_secs: u64,
    /// How often the transport monitor checks for broker presence
    pub monitor_interval_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            root_topic: DEFAULT_ROOT_TOPIC.to_string(),
            control_root: DEFAULT_CONTROL_ROOT.to_string(),
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            monitor_interval_ms: DEFAULT_MONITOR_INTERVAL_MS,
        }
    }
}

impl BrokerConfig {
    /// Parse a json5 document. Missing fields take their defaults.
    pub fn from_json5(text: &str) -> Result<Self> {
        json5::from_str(text).map_err(|e| format!("Invalid broker config: {}", e).into())
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
        Self::from_json5(&text)
    }

    /// Load from `ZPARAM_CONFIG_FILE` if set, otherwise use defaults
    pub fn from_env_or_default() -> Result<Self> {
        match std::env::var(CONFIG_FILE_ENV) {
            Ok(path) => {
                tracing::debug!("Loading broker config from {}={}", CONFIG_FILE_ENV, path);
                Self::from_file(path)
            }
            Err(_) => Ok(Self::default()),
        }
    }

    /// Zenoh endpoint of the broker
    pub fn endpoint(&self) -> String {
        format!("tcp/{}:{}", self.host, self.port)
    }
}

#[derive(Serialize, Clone, Debug)]
pub struct ConfigOverride {
    pub key: &'static str,
    pub value: Value,
    pub reason: &'static str,
}

// SESSION CONFIG - client of a single broker, reconnects handled by the transport
pub fn session_overrides(broker: &BrokerConfig) -> Vec<ConfigOverride> {
    vec![
    ConfigOverride {
        key: "mode",
        value: serde_json::json!("client"),
        reason: "All traffic goes through the one broker",
    },
    ConfigOverride {
        key: "connect/endpoints",
        value: serde_json::json!([broker.endpoint()]),
        reason: "Broker host and port from the broker config",
    },
    ConfigOverride {
        key: "connect/exit_on_failure",
        value: serde_json::json!(false),
        reason: "Opening must not fail while the broker is down; the connect timeout is enforced by wait_connected",
    },
    ConfigOverride {
        key: "scouting/multicast/enabled",
        value: serde_json::json!(false),
        reason: "The broker address is configured, no discovery needed",
    },
    ]
}
