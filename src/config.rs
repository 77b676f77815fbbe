//! # Bridge Configuration
//!
//! One TOML file, every field optional. Load order:
//!
//! ```text
//! defaults ──► config file (if present) ──► environment overrides ──► validate
//! ```
//!
//! The file is `$IOT_BRIDGE_CONFIG` when set, otherwise
//! `<config dir>/iot-bridge/config.toml`. A missing file is not an error: the bridge
//! starts with defaults, the same way a fresh install would.
//!
//! Environment overrides keep the variable names existing deployments already use:
//! `PORT`, `WS_PORT`, `MQTT_BROKER`, `MQTT_PORT`, `MQTT_USERNAME`, `MQTT_PASSWORD`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::hub::DEFAULT_SESSION_BUFFER;
use crate::mqtt::config::MqttConfig;
use crate::routing::RouteTable;
use crate::state::snapshot::RESERVED_FIELDS;
use crate::state::{default_categories, CategoryRule, OnlinePolicy};

pub const CONFIG_ENV: &str = "IOT_BRIDGE_CONFIG";
const CONFIG_DIR: &str = "iot-bridge";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid value for {var}: {value:?}")]
    Env { var: &'static str, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address both listeners bind to
    pub bind: String,
    /// HTTP API port
    pub port: u16,
    /// WebSocket observer port
    pub ws_port: u16,
    /// Frames an observer may fall behind before it is dropped
    pub session_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 3000,
            ws_port: 3001,
            session_buffer: DEFAULT_SESSION_BUFFER,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    pub online_policy: OnlinePolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub server: ServerConfig,
    pub mqtt: MqttConfig,
    pub bridge: BridgeSettings,
    pub routes: RouteTable,
    /// Update category name -> payload key mapping
    pub categories: BTreeMap<String, CategoryRule>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            mqtt: MqttConfig::default(),
            bridge: BridgeSettings::default(),
            routes: RouteTable::default(),
            categories: default_categories(),
        }
    }
}

impl BridgeConfig {
    /// Loads from the default location with process environment overrides.
    pub async fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        let mut config = match &path {
            Some(path) => Self::from_file(path).await?,
            None => {
                warn!("No config directory available, using defaults");
                Self::default()
            }
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn default_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Some(PathBuf::from(path));
        }
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    /// Reads a config file; a file that does not exist yields defaults.
    pub async fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let exists = tokio::fs::try_exists(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        if !exists {
            info!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        let config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = %path.display(), "Loaded config file");
        Ok(config)
    }

    /// Applies deployment variables on top of the file values.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(value) = lookup("PORT") {
            self.server.port = parse_port("PORT", value)?;
        }
        if let Some(value) = lookup("WS_PORT") {
            self.server.ws_port = parse_port("WS_PORT", value)?;
        }
        if let Some(value) = lookup("MQTT_BROKER") {
            debug!(broker = %value, "Broker url from environment");
            self.mqtt.server.url = value;
        }
        if let Some(value) = lookup("MQTT_PORT") {
            self.mqtt.port = parse_port("MQTT_PORT", value)?;
        }
        if let Some(value) = lookup("MQTT_USERNAME") {
            self.mqtt.server.user = value;
        }
        if let Some(value) = lookup("MQTT_PASSWORD") {
            self.mqtt.server.pw = value;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.mqtt
            .endpoint()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        if self.server.port == self.server.ws_port {
            return Err(ConfigError::Invalid(format!(
                "HTTP and WebSocket ports must differ (both {})",
                self.server.port
            )));
        }

        self.routes.validate().map_err(ConfigError::Invalid)?;
        for route in &self.routes.inbound {
            if !self.categories.contains_key(&route.category) {
                return Err(ConfigError::Invalid(format!(
                    "route {:?} names unknown category {:?}",
                    route.pattern, route.category
                )));
            }
        }

        for (name, rule) in &self.categories {
            if let Some(field) = rule
                .fields
                .values()
                .find(|field| RESERVED_FIELDS.contains(&field.as_str()))
            {
                return Err(ConfigError::Invalid(format!(
                    "category {name:?} writes reserved field {field:?}"
                )));
            }
        }
        Ok(())
    }
}

fn parse_port(var: &'static str, value: String) -> Result<u16, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Env { var, value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_match_deployment() {
        let config = BridgeConfig::default();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.server.ws_port, 3001);
        assert_eq!(config.mqtt.server.url, "mqtt://localhost");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.bridge.online_policy, OnlinePolicy::OnFirstMessage);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config: BridgeConfig = toml::from_str(
            r#"
            [server]
            port = 8080

            [bridge]
            online_policy = "on_connect"

            [mqtt.server]
            url = "mqtt://10.0.0.5"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.ws_port, 3001);
        assert_eq!(config.bridge.online_policy, OnlinePolicy::OnConnect);
        assert_eq!(config.mqtt.server.url, "mqtt://10.0.0.5");
        assert_eq!(config.routes, RouteTable::default());
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config = BridgeConfig::default();
        config
            .apply_env(env(&[
                ("PORT", "4000"),
                ("WS_PORT", "4001"),
                ("MQTT_BROKER", "mqtt://broker.lan"),
                ("MQTT_PORT", "1884"),
                ("MQTT_USERNAME", "bridge"),
                ("MQTT_PASSWORD", "secret"),
            ]))
            .unwrap();

        assert_eq!(config.server.port, 4000);
        assert_eq!(config.server.ws_port, 4001);
        assert_eq!(
            config.mqtt.endpoint().unwrap(),
            ("broker.lan".to_string(), 1884)
        );
        assert!(config.mqtt.server.has_credentials());
    }

    #[test]
    fn bad_env_port_is_reported() {
        let mut config = BridgeConfig::default();
        let err = config.apply_env(env(&[("WS_PORT", "socket")])).unwrap_err();
        assert!(matches!(err, ConfigError::Env { var: "WS_PORT", .. }));
    }

    #[test]
    fn route_to_unknown_category_is_invalid() {
        let mut config = BridgeConfig::default();
        config.categories.remove("motion");
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn wildcard_command_topic_is_invalid() {
        let mut config = BridgeConfig::default();
        config
            .routes
            .devices
            .insert("pump".to_string(), "iot/control/+".to_string());
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn malformed_inbound_pattern_is_invalid() {
        let mut config = BridgeConfig::default();
        config.routes.inbound[0].pattern = "iot/#/data".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn reserved_target_field_is_invalid() {
        let mut config = BridgeConfig::default();
        config.categories.insert(
            "clock".to_string(),
            CategoryRule::identity(["revision"]),
        );
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn tls_broker_is_rejected() {
        let mut config = BridgeConfig::default();
        config.mqtt.server.url = "mqtts://broker.lan".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[tokio::test]
    async fn missing_file_yields_defaults() {
        let path = std::env::temp_dir().join(format!("iot-bridge-missing-{}.toml", uuid::Uuid::new_v4()));
        let config = BridgeConfig::from_file(&path).await.unwrap();
        assert_eq!(config, BridgeConfig::default());
    }

    #[tokio::test]
    async fn reads_file_from_disk() {
        let path = std::env::temp_dir().join(format!("iot-bridge-{}.toml", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, "[routes.devices]\npump = \"iot/control/pump\"\n")
            .await
            .unwrap();

        let config = BridgeConfig::from_file(&path).await.unwrap();
        assert_eq!(config.routes.topic_for("pump"), Some("iot/control/pump"));
        // A table given in the file replaces the default one.
        assert_eq!(config.routes.topic_for("fan"), None);

        tokio::fs::remove_file(&path).await.unwrap();
    }

    #[tokio::test]
    async fn unparsable_file_is_an_error() {
        let path = std::env::temp_dir().join(format!("iot-bridge-bad-{}.toml", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, "[server\nport = ").await.unwrap();
        assert!(matches!(
            BridgeConfig::from_file(&path).await,
            Err(ConfigError::Parse { .. })
        ));
        tokio::fs::remove_file(&path).await.unwrap();
    }
}
