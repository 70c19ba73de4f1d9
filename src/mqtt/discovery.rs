//! # Home Assistant Discovery
//!
//! Announces the device's sensors and switches to Home Assistant by publishing
//! retained JSON configuration documents under the `homeassistant` discovery
//! prefix. Home Assistant creates (or updates) the entities as soon as it sees
//! those documents, so the session re-publishes them after every connect.
//!
//! ## Topic Layout
//!
//! ```text
//! homeassistant/<component>/<device_id>/<entity_id>/config   retained JSON
//! homeassistant/<component>/<device_id>/<entity_id>/state    sensor values, switch ON/OFF
//! homeassistant/switch/<device_id>/<entity_id>/set           inbound commands
//! ```
//!
//! ## Determinism
//!
//! Documents are built from typed structs and serialized with `serde_json`, so
//! field order is fixed and two builds for the same device are byte-identical.
//! Re-publishing is therefore harmless for Home Assistant and easy to assert in
//! tests.

use super::error::SessionError;
use super::message_manager::QoS;
use super::router::CommandAction;
use super::transport::Link;
use crate::metrics::SensorKind;
use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, info};

pub const DISCOVERY_PREFIX: &str = "homeassistant";

const MANUFACTURER: &str = "Custom";
const MODEL: &str = "PC Monitor";
pub const PAYLOAD_ON: &str = "ON";
pub const PAYLOAD_OFF: &str = "OFF";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Sensor,
    Switch,
}

impl EntityKind {
    /// Home Assistant component name used in topics and entity ids
    pub fn component(self) -> &'static str {
        match self {
            EntityKind::Sensor => "sensor",
            EntityKind::Switch => "switch",
        }
    }
}

pub fn config_topic(kind: EntityKind, device_id: &str, entity_id: &str) -> String {
    format!("{}/{}/{}/{}/config", DISCOVERY_PREFIX, kind.component(), device_id, entity_id)
}

pub fn state_topic(kind: EntityKind, device_id: &str, entity_id: &str) -> String {
    format!("{}/{}/{}/{}/state", DISCOVERY_PREFIX, kind.component(), device_id, entity_id)
}

pub fn command_topic(device_id: &str, entity_id: &str) -> String {
    format!(
        "{}/{}/{}/{}/set",
        DISCOVERY_PREFIX,
        EntityKind::Switch.component(),
        device_id,
        entity_id
    )
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub identifiers: Vec<String>,
    pub manufacturer: String,
    pub model: String,
    pub name: String,
    pub sw_version: String,
}

impl DeviceInfo {
    pub fn for_device(device_id: &str) -> Self {
        DeviceInfo {
            identifiers: vec![device_id.to_string()],
            manufacturer: MANUFACTURER.to_string(),
            model: MODEL.to_string(),
            name: device_id.to_string(),
            sw_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDescriptor {
    pub id: String,
    pub name: String,
    pub kind: EntityKind,
    pub unit: Option<String>,
    pub icon: Option<String>,
    pub state_topic: String,
    pub command_topic: Option<String>,
    pub device: DeviceInfo,
}

impl EntityDescriptor {
    /// `<device_id>_<entity_id>`, also used as object id
    pub fn unique_id(&self) -> String {
        format!("{}_{}", self.device.name, self.id)
    }

    pub fn config_topic(&self) -> String {
        config_topic(self.kind, &self.device.name, &self.id)
    }

    /// Entity id Home Assistant assigns, e.g. `sensor.DESK01_cpu_usage`
    pub fn entity_name(&self) -> String {
        format!("{}.{}", self.kind.component(), self.unique_id())
    }
}

/// Fixed entity catalog for one device: six sensors, four switches.
pub fn catalog(device_id: &str) -> Vec<EntityDescriptor> {
    let device = DeviceInfo::for_device(device_id);

    let sensors = SensorKind::ALL.iter().map(|sensor| EntityDescriptor {
        id: sensor.entity_id().to_string(),
        name: sensor.display_name().to_string(),
        kind: EntityKind::Sensor,
        unit: sensor.unit().map(str::to_string),
        icon: Some(sensor.icon().to_string()),
        state_topic: state_topic(EntityKind::Sensor, device_id, sensor.entity_id()),
        command_topic: None,
        device: device.clone(),
    });

    let switches = CommandAction::SWITCHES.iter().map(|action| EntityDescriptor {
        id: action.entity_id().to_string(),
        name: action.display_name().to_string(),
        kind: EntityKind::Switch,
        unit: None,
        icon: Some(action.icon().to_string()),
        state_topic: state_topic(EntityKind::Switch, device_id, action.entity_id()),
        command_topic: Some(command_topic(device_id, action.entity_id())),
        device: device.clone(),
    });

    sensors.chain(switches).collect()
}

/// Home Assistant entity ids of the catalog, for display by the host.
pub fn entity_names(device_id: &str) -> Vec<String> {
    catalog(device_id).iter().map(EntityDescriptor::entity_name).collect()
}

#[derive(Serialize)]
struct EntityConfig<'a> {
    name: &'a str,
    unique_id: String,
    object_id: String,
    device: &'a DeviceInfo,
    state_topic: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    command_topic: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    icon: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    unit_of_measurement: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload_on: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload_off: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    state_on: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    state_off: Option<&'static str>,
}

impl<'a> EntityConfig<'a> {
    fn from_descriptor(entity: &'a EntityDescriptor) -> Self {
        let is_switch = entity.kind == EntityKind::Switch;
        let switch_value = |value: &'static str| is_switch.then_some(value);
        EntityConfig {
            name: &entity.name,
            unique_id: entity.unique_id(),
            object_id: entity.unique_id(),
            device: &entity.device,
            state_topic: &entity.state_topic,
            command_topic: entity.command_topic.as_deref(),
            icon: entity.icon.as_deref(),
            unit_of_measurement: entity.unit.as_deref(),
            payload_on: switch_value(PAYLOAD_ON),
            payload_off: switch_value(PAYLOAD_OFF),
            state_on: switch_value(PAYLOAD_ON),
            state_off: switch_value(PAYLOAD_OFF),
        }
    }
}

/// One retained discovery publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryMessage {
    pub topic: String,
    pub payload: Bytes,
}

/// Builds the retained messages announcing `entities`.
///
/// For each entity the config document comes first; switches are followed by
/// their initial `OFF` state so Home Assistant does not show them as unknown.
pub fn build_messages(
    entities: &[EntityDescriptor],
) -> Result<Vec<DiscoveryMessage>, SessionError> {
    let mut messages = Vec::with_capacity(entities.len() * 2);
    for entity in entities {
        let document = serde_json::to_vec(&EntityConfig::from_descriptor(entity))?;
        messages.push(DiscoveryMessage {
            topic: entity.config_topic(),
            payload: Bytes::from(document),
        });

        if entity.kind == EntityKind::Switch {
            messages.push(DiscoveryMessage {
                topic: entity.state_topic.clone(),
                payload: Bytes::from_static(PAYLOAD_OFF.as_bytes()),
            });
        }
    }
    Ok(messages)
}

/// Publishes every discovery message over `link`, QoS 1 and retained.
///
/// Stops at the first transport error; the caller re-runs the whole set on the
/// next connect.
pub async fn publish_all(
    link: &dyn Link,
    entities: &[EntityDescriptor],
) -> Result<usize, SessionError> {
    let messages = build_messages(entities)?;
    for message in &messages {
        debug!("Publishing discovery message to {}", message.topic);
        link.publish(
            &message.topic,
            message.payload.clone(),
            QoS::AtLeastOnce,
            true,
        )
        .await?;
    }
    info!(
        "Published {} discovery messages for {} entities",
        messages.len(),
        entities.len()
    );
    Ok(messages.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn document(messages: &[DiscoveryMessage], topic: &str) -> Value {
        let message = messages
            .iter()
            .find(|m| m.topic == topic)
            .unwrap_or_else(|| panic!("no message on {topic}"));
        serde_json::from_slice(&message.payload).unwrap()
    }

    #[test]
    fn catalog_has_six_sensors_and_four_switches() {
        let entities = catalog("DESK01");
        let sensors = entities.iter().filter(|e| e.kind == EntityKind::Sensor).count();
        let switches = entities.iter().filter(|e| e.kind == EntityKind::Switch).count();
        assert_eq!(sensors, 6);
        assert_eq!(switches, 4);
        assert!(entities
            .iter()
            .all(|e| (e.kind == EntityKind::Switch) == e.command_topic.is_some()));
    }

    #[test]
    fn builds_are_byte_identical() {
        let first = build_messages(&catalog("DESK01")).unwrap();
        let second = build_messages(&catalog("DESK01")).unwrap();
        assert_eq!(first, second);
        // 10 config documents + 4 initial switch states
        assert_eq!(first.len(), 14);
    }

    #[test]
    fn sensor_document_fields() {
        let messages = build_messages(&catalog("DESK01")).unwrap();
        let doc = document(&messages, "homeassistant/sensor/DESK01/cpu_usage/config");

        assert_eq!(doc["unique_id"], "DESK01_cpu_usage");
        assert_eq!(doc["state_topic"], "homeassistant/sensor/DESK01/cpu_usage/state");
        assert_eq!(doc["unit_of_measurement"], "%");
        assert_eq!(doc["icon"], "mdi:cpu-64-bit");
        assert_eq!(doc["device"]["identifiers"][0], "DESK01");
        assert_eq!(doc["device"]["manufacturer"], "Custom");
        assert_eq!(doc["device"]["model"], "PC Monitor");
        assert!(doc.get("command_topic").is_none());
        assert!(doc.get("payload_on").is_none());
    }

    #[test]
    fn power_state_sensor_has_no_unit() {
        let messages = build_messages(&catalog("DESK01")).unwrap();
        let doc = document(&messages, "homeassistant/sensor/DESK01/power_state/config");
        assert!(doc.get("unit_of_measurement").is_none());
    }

    #[test]
    fn switch_document_and_initial_state() {
        let messages = build_messages(&catalog("DESK01")).unwrap();
        let doc = document(&messages, "homeassistant/switch/DESK01/standby/config");

        assert_eq!(doc["command_topic"], "homeassistant/switch/DESK01/standby/set");
        assert_eq!(doc["payload_on"], "ON");
        assert_eq!(doc["payload_off"], "OFF");
        assert_eq!(doc["state_on"], "ON");
        assert_eq!(doc["state_off"], "OFF");
        assert_eq!(doc["icon"], "mdi:power-sleep");

        let config_pos = messages
            .iter()
            .position(|m| m.topic == "homeassistant/switch/DESK01/standby/config")
            .unwrap();
        let state = &messages[config_pos + 1];
        assert_eq!(state.topic, "homeassistant/switch/DESK01/standby/state");
        assert_eq!(state.payload, Bytes::from_static(b"OFF"));
    }

    #[test]
    fn entity_names_for_host_display() {
        let names = entity_names("DESK01");
        assert!(names.contains(&"sensor.DESK01_cpu_usage".to_string()));
        assert!(names.contains(&"switch.DESK01_hibernate".to_string()));
        assert_eq!(names.len(), 10);
    }
}
