//! Command Router
//!
//! Turns an observer request `(device, action)` into one publish on the device's
//! command topic:
//!
//! ```text
//! device not routed      ──► UnknownDevice         (no publish)
//! action empty           ──► InvalidAction         (no publish)
//! transport not connected──► TransportUnavailable  (no publish)
//! otherwise              ──► publish {"action": .., "timestamp": ..} ──► Ack
//! ```
//!
//! An [`Ack`] means the transport took the message. Whether the device acted on it
//! only shows up later, in its next state report.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::mqtt::{DeliveryHint, PublishError, Transport};
use crate::routing::RouteTable;

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("Invalid device: {0}")]
    UnknownDevice(String),

    #[error("Action must not be empty")]
    InvalidAction,

    #[error("MQTT transport is not connected")]
    TransportUnavailable,

    #[error("Failed to send command: {0}")]
    Publish(#[from] PublishError),
}

/// Wire form of a command as published to the device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Command {
    pub action: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ack {
    pub device: String,
    pub topic: String,
    pub command: Command,
}

#[derive(Debug)]
pub struct CommandRouter<T> {
    transport: T,
    routes: Arc<RouteTable>,
    hint: DeliveryHint,
}

impl<T: Clone> Clone for CommandRouter<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            routes: self.routes.clone(),
            hint: self.hint,
        }
    }
}

impl<T: Transport> CommandRouter<T> {
    pub fn new(transport: T, routes: Arc<RouteTable>, hint: DeliveryHint) -> Self {
        Self {
            transport,
            routes,
            hint,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub async fn submit(&self, device: &str, action: &str) -> Result<Ack, CommandError> {
        let Some(topic) = self.routes.topic_for(device) else {
            warn!(device, "Rejecting command for unknown device");
            return Err(CommandError::UnknownDevice(device.to_string()));
        };
        if action.trim().is_empty() {
            warn!(device, "Rejecting command with empty action");
            return Err(CommandError::InvalidAction);
        }
        if !self.transport.is_connected() {
            warn!(
                device,
                state = self.transport.connection_state().as_str(),
                "Rejecting command, transport unavailable"
            );
            return Err(CommandError::TransportUnavailable);
        }

        let command = Command {
            action: action.to_string(),
            timestamp: Utc::now(),
        };
        let payload = serde_json::to_vec(&command).map_err(|e| {
            warn!(device, error = %e, "Could not encode command");
            CommandError::InvalidAction
        })?;

        self.transport.publish(topic, payload, self.hint).await?;
        info!(device, topic, action, "Command sent");

        Ok(Ack {
            device: device.to_string(),
            topic: topic.to_string(),
            command,
        })
    }
}
