use bytes::Bytes;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

/// Delivery guarantee requested for a publish or subscription.
///
/// Mirrors the MQTT levels so configuration and callers never depend on the
/// transport crate directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QoS {
    AtMostOnce,
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

impl From<QoS> for rumqttc::QoS {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

/// A publish that is waiting for (or being handed to) the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub enqueued_at: DateTime<Local>,
}

impl QueuedMessage {
    pub fn new(
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Self {
        QueuedMessage {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
            enqueued_at: Local::now(),
        }
    }
}

impl fmt::Display for QueuedMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} - {} ({} bytes, {:?}{})",
            self.enqueued_at.format("%H:%M:%S%.3f"),
            self.topic,
            self.payload.len(),
            self.qos,
            if self.retain { ", retained" } else { "" }
        )
    }
}

/// Message delivered by the broker on one of the active subscriptions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub received_at: DateTime<Local>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        InboundMessage {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Local::now(),
        }
    }

    pub fn payload_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

impl fmt::Display for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}: {}\n{}",
            self.received_at.format("%H:%M:%S%.3f"),
            self.topic,
            self.payload_str()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qos_maps_onto_transport_levels() {
        assert_eq!(rumqttc::QoS::from(QoS::AtMostOnce), rumqttc::QoS::AtMostOnce);
        assert_eq!(rumqttc::QoS::from(QoS::AtLeastOnce), rumqttc::QoS::AtLeastOnce);
        assert_eq!(rumqttc::QoS::from(QoS::ExactlyOnce), rumqttc::QoS::ExactlyOnce);
    }

    #[test]
    fn inbound_payload_is_lossy_utf8() {
        let msg = InboundMessage::new("a/b", Bytes::from_static(b"ON\xff"));
        assert_eq!(msg.payload_str(), "ON\u{fffd}");
    }

    #[test]
    fn queued_display_mentions_topic_and_size() {
        let msg = QueuedMessage::new("pc/cpu", "12.50", QoS::AtLeastOnce, true);
        let rendered = msg.to_string();
        assert!(rendered.contains("pc/cpu"));
        assert!(rendered.contains("5 bytes"));
        assert!(rendered.contains("retained"));
    }
}
