//! # MQTT Transport Adapter
//!
//! Connects the bridge to the device population through an MQTT broker. The adapter
//! owns the `rumqttc` client and event loop and turns everything the broker does into
//! a single ordered stream of [`TransportEvent`]s.
//!
//! ## Why This Module Exists
//!
//! Devices speak MQTT, observers do not. Everything that knows about broker sessions,
//! subscriptions and reconnects lives here so the rest of the bridge only sees:
//! - a stream of `Connected` / `Disconnected` / `Message` / `Error` events
//! - a [`Transport`] handle that can publish and report connectivity
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Broker endpoint, credentials and reconnect policy
//! ├── message_manager.rs  - Inbound message and event representation
//! └── mqtt_handler.rs     - Event loop, reconnect with backoff, publish handle
//! ```
//!
//! ## Connection Lifecycle
//!
//! ```text
//! Connecting ──ConnAck──► Connected ──error──► Reconnecting ──ConnAck──► Connected
//!                             │                     ▲
//!                             └──── backoff sleep ──┘
//! ```
//!
//! Sessions are opened with `clean_session = true`, so subscriptions are never assumed
//! to survive a reconnect: every `ConnAck` re-issues the full pattern list.

pub mod config;
pub mod message_manager;
pub mod mqtt_handler;

pub use message_manager::{MQTTMessage, TransportEvent};
pub use mqtt_handler::{ConnectionState, MQTTStatus, MqttHandle, MqttHandler};

use serde::{Deserialize, Serialize};
use std::future::Future;

/// Delivery guarantee requested from the broker for one publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryHint {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl From<DeliveryHint> for rumqttc::QoS {
    fn from(hint: DeliveryHint) -> Self {
        match hint {
            DeliveryHint::AtMostOnce => rumqttc::QoS::AtMostOnce,
            DeliveryHint::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            DeliveryHint::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Invalid broker endpoint: {0}")]
    InvalidEndpoint(String),
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Transport is not connected")]
    NotConnected,

    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),
}

/// The outbound half of the transport, as seen by the command router.
///
/// Implemented by [`MqttHandle`]; tests substitute a recording stub.
pub trait Transport: Send + Sync + 'static {
    fn connection_state(&self) -> ConnectionState;

    fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// Counters for the health surface. Stubs only know their connection state.
    fn status(&self) -> MQTTStatus {
        MQTTStatus {
            connection_state: self.connection_state(),
            ..MQTTStatus::default()
        }
    }

    /// Hands one message to the transport. Returns once the transport accepted it;
    /// this says nothing about delivery to the device.
    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        hint: DeliveryHint,
    ) -> impl Future<Output = Result<(), PublishError>> + Send;
}
