//! Boundary between the session and the wire.
//!
//! A [`Connector`] performs a single connection attempt and hands back a
//! [`Connection`]: the [`Link`] used to send, plus a receiver for what the
//! broker sends back. The session owns retry policy and bookkeeping; the
//! transport only moves bytes. [`MqttConnector`](super::broker_link::MqttConnector)
//! is the production implementation.

use super::error::SessionError;
use super::message_manager::{InboundMessage, QoS};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

#[derive(Debug)]
pub enum LinkEvent {
    Message(InboundMessage),
    /// Terminal; nothing follows on the receiver
    Closed { reason: String },
}

#[async_trait]
pub trait Link: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), SessionError>;

    async fn subscribe(&self, topic_filter: &str, qos: QoS) -> Result<(), SessionError>;

    async fn unsubscribe(&self, topic_filter: &str) -> Result<(), SessionError>;

    /// Graceful close; the event receiver ends afterwards
    async fn disconnect(&self) -> Result<(), SessionError>;
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Dials the broker once and returns after it acknowledged the session.
    async fn connect(&self) -> Result<Connection, SessionError>;
}

pub struct Connection {
    pub link: Box<dyn Link>,
    pub events: mpsc::Receiver<LinkEvent>,
}

impl Connection {
    pub fn new(link: Box<dyn Link>, events: mpsc::Receiver<LinkEvent>) -> Self {
        Connection { link, events }
    }
}
