use chrono::{DateTime, Utc};
use std::fmt;

/// One publish received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MQTTMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

impl fmt::Display for MQTTMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let content = String::from_utf8_lossy(&self.payload);
        let preview: String = content.chars().take(40).collect();
        write!(f, "{} {} - {}", self.timestamp.format("%H:%M:%S%.3f"), self.topic, preview)
    }
}

impl MQTTMessage {
    pub fn from_topic(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        MQTTMessage {
            topic: topic.into(),
            payload: payload.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Everything the transport reports to the bridge, in arrival order.
///
/// One channel carries all four kinds so the consumer sees connection changes and
/// messages in the order they happened.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    Message(MQTTMessage),
    Error(String),
}
