//! MQTT state-sync and fan-out bridge.
//!
//! Devices report over MQTT, observers watch over WebSocket and poll or command over
//! HTTP. The bridge keeps one merged snapshot of everything the devices reported and
//! pushes it to every observer on each change.
//!
//! ```text
//! devices ──MQTT──► mqtt ──► bridge ──► state ──► hub ──WebSocket──► observers
//! devices ◄──MQTT── mqtt ◄── command ◄──────────────────HTTP──────── observers
//! ```

pub mod bridge;
pub mod command;
pub mod config;
pub mod hub;
pub mod mqtt;
pub mod routing;
pub mod server;
pub mod state;
