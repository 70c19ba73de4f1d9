#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use pcmon_mqtt::mqtt::config::{BrokerConfig, SessionConfig};
use pcmon_mqtt::mqtt::error::SessionError;
use pcmon_mqtt::mqtt::message_manager::{InboundMessage, QoS};
use pcmon_mqtt::mqtt::mqtt_handler::{
    ConnectionState, SessionEvent, SessionHandle, SessionStatus,
};
use pcmon_mqtt::mqtt::router::CommandRouter;
use pcmon_mqtt::mqtt::transport::{Connection, Connector, Link, LinkEvent};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Notify};

pub const DEVICE: &str = "DESK01";
const WAIT: Duration = Duration::from_secs(120);

/// Everything the session did on the wire, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireOp {
    Connect,
    Publish {
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    },
    Subscribe {
        topic_filter: String,
        qos: QoS,
    },
    Unsubscribe {
        topic_filter: String,
    },
    Disconnect,
}

impl WireOp {
    pub fn is_discovery_config(&self) -> bool {
        matches!(self, WireOp::Publish { topic, retain: true, .. } if topic.ends_with("/config"))
    }

    pub fn publish_topic(&self) -> Option<&str> {
        match self {
            WireOp::Publish { topic, .. } => Some(topic),
            _ => None,
        }
    }
}

#[derive(Default)]
struct Shared {
    script: VecDeque<Result<(), String>>,
    attempts: usize,
    ops: Vec<WireOp>,
    link_events: Option<mpsc::Sender<LinkEvent>>,
    publish_failures: HashMap<String, usize>,
    fail_subscribes: bool,
    publish_gate: Option<Arc<Notify>>,
}

/// In-memory broker stand-in. Connect attempts succeed unless scripted to
/// fail; the latest link can be fed messages or closed from the test.
#[derive(Clone, Default)]
pub struct ScriptedConnector {
    shared: Arc<Mutex<Shared>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(self.clone())
    }

    /// The next `count` connect attempts fail.
    pub fn fail_next(&self, count: usize) {
        let mut shared = self.shared.lock().unwrap();
        for _ in 0..count {
            shared.script.push_back(Err("connection refused".to_string()));
        }
    }

    /// The next `count` publishes to `topic` fail on the wire.
    pub fn fail_publish(&self, topic: &str, count: usize) {
        let mut shared = self.shared.lock().unwrap();
        *shared.publish_failures.entry(topic.to_string()).or_default() += count;
    }

    /// Every subscribe and unsubscribe fails until turned off again.
    pub fn fail_subscribes(&self, fail: bool) {
        self.shared.lock().unwrap().fail_subscribes = fail;
    }

    /// The next publish waits until the returned gate is notified.
    pub fn hold_next_publish(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.shared.lock().unwrap().publish_gate = Some(gate.clone());
        gate
    }

    pub fn attempts(&self) -> usize {
        self.shared.lock().unwrap().attempts
    }

    pub fn ops(&self) -> Vec<WireOp> {
        self.shared.lock().unwrap().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.shared.lock().unwrap().ops.clear();
    }

    pub fn published_topics(&self) -> Vec<String> {
        self.ops()
            .iter()
            .filter_map(|op| op.publish_topic().map(str::to_string))
            .collect()
    }

    pub fn subscribed_filters(&self) -> Vec<String> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                WireOp::Subscribe { topic_filter, .. } => Some(topic_filter),
                _ => None,
            })
            .collect()
    }

    /// Simulates the broker dropping the connection.
    pub async fn drop_link(&self, reason: &str) {
        let sender = self.shared.lock().unwrap().link_events.take();
        if let Some(sender) = sender {
            let _ = sender
                .send(LinkEvent::Closed {
                    reason: reason.to_string(),
                })
                .await;
        }
    }

    /// Simulates the broker delivering a message on the current link.
    pub async fn deliver(&self, topic: &str, payload: &'static [u8]) {
        let sender = self.shared.lock().unwrap().link_events.clone();
        if let Some(sender) = sender {
            let _ = sender
                .send(LinkEvent::Message(InboundMessage::new(
                    topic,
                    Bytes::from_static(payload),
                )))
                .await;
        }
    }

    fn dial(&self) -> Result<Connection, SessionError> {
        let mut shared = self.shared.lock().unwrap();
        shared.attempts += 1;
        if let Some(Err(reason)) = shared.script.pop_front() {
            return Err(SessionError::ConnectionFailed(reason));
        }
        shared.ops.push(WireOp::Connect);
        let (sender, receiver) = mpsc::channel(64);
        shared.link_events = Some(sender);
        Ok(Connection::new(
            Box::new(ScriptedLink {
                shared: self.shared.clone(),
            }),
            receiver,
        ))
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self) -> Result<Connection, SessionError> {
        self.dial()
    }
}

struct ScriptedLink {
    shared: Arc<Mutex<Shared>>,
}

impl ScriptedLink {
    fn record(&self, op: WireOp) {
        self.shared.lock().unwrap().ops.push(op);
    }

    fn publish_fails(&self, topic: &str) -> bool {
        let mut shared = self.shared.lock().unwrap();
        match shared.publish_failures.get_mut(topic) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    fn subscribes_fail(&self) -> bool {
        self.shared.lock().unwrap().fail_subscribes
    }
}

#[async_trait]
impl Link for ScriptedLink {
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), SessionError> {
        let gate = self.shared.lock().unwrap().publish_gate.take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.publish_fails(topic) {
            return Err(SessionError::Transport(format!("publish to {topic} rejected")));
        }
        self.record(WireOp::Publish {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        });
        Ok(())
    }

    async fn subscribe(&self, topic_filter: &str, qos: QoS) -> Result<(), SessionError> {
        if self.subscribes_fail() {
            return Err(SessionError::Transport("subscribe rejected".to_string()));
        }
        self.record(WireOp::Subscribe {
            topic_filter: topic_filter.to_string(),
            qos,
        });
        Ok(())
    }

    async fn unsubscribe(&self, topic_filter: &str) -> Result<(), SessionError> {
        if self.subscribes_fail() {
            return Err(SessionError::Transport("unsubscribe rejected".to_string()));
        }
        self.record(WireOp::Unsubscribe {
            topic_filter: topic_filter.to_string(),
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), SessionError> {
        self.record(WireOp::Disconnect);
        Ok(())
    }
}

pub fn session_config() -> SessionConfig {
    SessionConfig::new(BrokerConfig::default(), DEVICE)
}

pub fn spawn_session(
    connector: &ScriptedConnector,
    router: Option<CommandRouter>,
) -> SessionHandle {
    SessionHandle::spawn(session_config(), connector.connector(), router).unwrap()
}

/// Waits until the session reports `state` and has finished handling the
/// transition (a command round-trip orders us after it).
pub async fn wait_for_state(session: &SessionHandle, state: ConnectionState) {
    let mut status = session.status();
    tokio::time::timeout(WAIT, status.wait_for(|s| s.state == state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {state}"))
        .expect("session stopped");
    session.stats().await.expect("session stopped");
}

pub async fn next_status(events: &mut broadcast::Receiver<SessionEvent>) -> SessionStatus {
    loop {
        let event = tokio::time::timeout(WAIT, events.recv())
            .await
            .expect("timed out waiting for a status event")
            .expect("event stream closed");
        if let SessionEvent::Status(status) = event {
            return status;
        }
    }
}

/// Collects status events up to and including the first one in `state`.
pub async fn statuses_until(
    events: &mut broadcast::Receiver<SessionEvent>,
    state: ConnectionState,
) -> Vec<SessionStatus> {
    let mut seen = Vec::new();
    loop {
        let status = next_status(events).await;
        let done = status.state == state;
        seen.push(status);
        if done {
            return seen;
        }
    }
}

pub async fn next_message(events: &mut broadcast::Receiver<SessionEvent>) -> InboundMessage {
    loop {
        let event = tokio::time::timeout(WAIT, events.recv())
            .await
            .expect("timed out waiting for a message event")
            .expect("event stream closed");
        if let SessionEvent::Message(message) = event {
            return message;
        }
    }
}
