use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use super::{DeliveryHint, TransportError};

/// Broker address and opaque credentials.
///
/// `url` accepts `host`, `host:port` or `mqtt://host[:port]`. An explicit port in
/// the url wins over [`MqttConfig::port`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttServer {
    /// Broker url (e.g. "mqtt://10.0.0.5:1883")
    pub url: String,
    /// Username for MQTT authentication, empty for anonymous
    pub user: String,
    /// Password for MQTT authentication
    pub pw: String,
}

impl Default for MqttServer {
    fn default() -> Self {
        Self {
            url: "mqtt://localhost".to_string(),
            user: String::new(),
            pw: String::new(),
        }
    }
}

impl fmt::Display for MqttServer {
    /// Formats as "user@url", the password never leaves this struct.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.user.is_empty() {
            write!(f, "{}", self.url)
        } else {
            write!(f, "{}@{}", self.user, self.url)
        }
    }
}

impl MqttServer {
    /// Whether both username and password are set.
    pub fn has_credentials(&self) -> bool {
        !self.user.is_empty() && !self.pw.is_empty()
    }
}

/// Capped exponential reconnect delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    pub base_ms: u64,
    pub max_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            max_ms: 30_000,
        }
    }
}

impl BackoffPolicy {
    /// Delay before reconnect attempt number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let ms = self.base_ms.saturating_mul(factor).min(self.max_ms.max(self.base_ms));
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub server: MqttServer,
    /// Port used when the url carries none
    pub port: u16,
    pub client_id_prefix: String,
    pub keep_alive_secs: u64,
    pub reconnect: BackoffPolicy,
    /// Delivery hint used for command publishes
    pub command_qos: DeliveryHint,
    /// Capacity of the rumqttc request queue
    pub request_capacity: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            server: MqttServer::default(),
            port: 1883,
            client_id_prefix: "iot-bridge-".to_string(),
            keep_alive_secs: 30,
            reconnect: BackoffPolicy::default(),
            command_qos: DeliveryHint::AtMostOnce,
            request_capacity: 100,
        }
    }
}

impl MqttConfig {
    /// Resolves `(host, port)` from the configured url.
    pub fn endpoint(&self) -> Result<(String, u16), TransportError> {
        let url = self.server.url.trim();
        if url.starts_with("mqtts://") {
            return Err(TransportError::InvalidEndpoint(format!(
                "TLS brokers are not supported: {url}"
            )));
        }
        let host_port = url.strip_prefix("mqtt://").unwrap_or(url);
        let host_port = host_port.trim_end_matches('/');

        let (host, port) = match host_port.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|e| {
                    TransportError::InvalidEndpoint(format!("bad port in {url}: {e}"))
                })?;
                (host, port)
            }
            None => (host_port, self.port),
        };

        if host.is_empty() {
            return Err(TransportError::InvalidEndpoint(format!(
                "missing host in {url:?}"
            )));
        }
        Ok((host.to_string(), port))
    }

    /// `<prefix><6 hex chars>`, unique per process start.
    pub fn client_id(&self) -> String {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("{}{}", self.client_id_prefix, &suffix[..6])
    }
}
