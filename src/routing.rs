//! Topic Route Table
//!
//! Static mapping between MQTT topics and bridge concepts, built once from config
//! and shared read-only afterwards:
//!
//! ```text
//! inbound:  topic pattern  ──► update category   (first matching pattern wins)
//! outbound: device id      ──► command topic
//! ```
//!
//! Filter matching and validation follow `rumqttc`'s own rules.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundRoute {
    /// MQTT subscription pattern, `+` and `#` wildcards allowed
    pub pattern: String,
    /// Name of the update category messages on this pattern belong to
    pub category: String,
}

impl InboundRoute {
    pub fn new(pattern: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            category: category.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteTable {
    pub inbound: Vec<InboundRoute>,
    pub devices: BTreeMap<String, String>,
}

impl Default for RouteTable {
    fn default() -> Self {
        let inbound = vec![
            InboundRoute::new("iot/sensors/data", "sensors"),
            InboundRoute::new("iot/sensors/temperature", "temperature"),
            InboundRoute::new("iot/sensors/motion", "motion"),
            InboundRoute::new("iot/sensors/door", "door"),
            InboundRoute::new("iot/sensors/distance", "distance"),
            InboundRoute::new("iot/devices/+/status", "status"),
        ];
        let devices = [
            ("led2", "iot/control/led2"),
            ("fan", "iot/control/fan"),
            ("door", "iot/control/door"),
            ("security", "iot/control/security"),
        ]
        .into_iter()
        .map(|(device, topic)| (device.to_string(), topic.to_string()))
        .collect();

        Self { inbound, devices }
    }
}

impl RouteTable {
    /// Category for an inbound topic, if any pattern matches.
    pub fn category_for(&self, topic: &str) -> Option<&str> {
        self.inbound
            .iter()
            .find(|route| rumqttc::matches(topic, &route.pattern))
            .map(|route| route.category.as_str())
    }

    /// Outbound command topic for a device.
    pub fn topic_for(&self, device: &str) -> Option<&str> {
        self.devices.get(device).map(String::as_str)
    }

    /// Checks every inbound pattern is a valid MQTT filter and every command topic a
    /// valid, wildcard-free topic.
    pub fn validate(&self) -> Result<(), String> {
        for route in &self.inbound {
            if !rumqttc::valid_filter(&route.pattern) {
                return Err(format!(
                    "invalid topic pattern {:?} for category {:?}",
                    route.pattern, route.category
                ));
            }
        }
        for (device, topic) in &self.devices {
            if topic.trim().is_empty() || !rumqttc::valid_topic(topic) {
                return Err(format!("device {device:?} has invalid command topic {topic:?}"));
            }
        }
        Ok(())
    }

    /// Patterns the transport subscribes to, duplicates removed.
    pub fn subscriptions(&self) -> Vec<String> {
        let mut patterns: Vec<String> = Vec::with_capacity(self.inbound.len());
        for route in &self.inbound {
            if !patterns.contains(&route.pattern) {
                patterns.push(route.pattern.clone());
            }
        }
        patterns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single(pattern: &str) -> RouteTable {
        RouteTable {
            inbound: vec![InboundRoute::new(pattern, "x")],
            devices: BTreeMap::new(),
        }
    }

    #[test]
    fn exact_topics_match() {
        let routes = single("iot/sensors/data");
        assert_eq!(routes.category_for("iot/sensors/data"), Some("x"));
        assert_eq!(routes.category_for("iot/sensors/data/x"), None);
        assert_eq!(routes.category_for("iot/sensors"), None);
    }

    #[test]
    fn single_level_wildcard() {
        let routes = single("iot/devices/+/status");
        assert_eq!(routes.category_for("iot/devices/esp01/status"), Some("x"));
        assert_eq!(routes.category_for("iot/devices/status"), None);
        assert_eq!(routes.category_for("iot/devices/a/b/status"), None);
    }

    #[test]
    fn multi_level_wildcard() {
        assert_eq!(single("iot/#").category_for("iot/sensors/data"), Some("x"));
        assert_eq!(single("iot/#").category_for("iot"), Some("x"));
        assert_eq!(single("#").category_for("anything/at/all"), Some("x"));
    }

    #[test]
    fn default_table_is_valid() {
        assert!(RouteTable::default().validate().is_ok());
    }

    #[test]
    fn malformed_patterns_are_rejected() {
        assert!(single("iot/#/x").validate().is_err());
        assert!(single("iot/sens+/x").validate().is_err());
        assert!(single("").validate().is_err());
    }

    #[test]
    fn wildcard_command_topic_is_rejected() {
        let mut routes = RouteTable::default();
        routes
            .devices
            .insert("pump".to_string(), "iot/control/+".to_string());
        assert!(routes.validate().is_err());

        routes.devices.insert("pump".to_string(), " ".to_string());
        assert!(routes.validate().is_err());
    }

    #[test]
    fn default_table_routes_deployed_topics() {
        let routes = RouteTable::default();
        assert_eq!(routes.category_for("iot/sensors/data"), Some("sensors"));
        assert_eq!(routes.category_for("iot/devices/uno2/status"), Some("status"));
        assert_eq!(routes.category_for("iot/unknown"), None);
        assert_eq!(routes.topic_for("fan"), Some("iot/control/fan"));
        assert_eq!(routes.topic_for("doorLock"), None);
    }

    #[test]
    fn first_matching_route_wins() {
        let routes = RouteTable {
            inbound: vec![
                InboundRoute::new("iot/sensors/motion", "motion"),
                InboundRoute::new("iot/sensors/+", "sensors"),
            ],
            devices: BTreeMap::new(),
        };
        assert_eq!(routes.category_for("iot/sensors/motion"), Some("motion"));
        assert_eq!(routes.category_for("iot/sensors/door"), Some("sensors"));
    }

    #[test]
    fn subscriptions_are_deduplicated() {
        let routes = RouteTable {
            inbound: vec![
                InboundRoute::new("a/b", "x"),
                InboundRoute::new("a/b", "y"),
                InboundRoute::new("c/#", "z"),
            ],
            devices: BTreeMap::new(),
        };
        assert_eq!(routes.subscriptions(), vec!["a/b".to_string(), "c/#".to_string()]);
    }
}
