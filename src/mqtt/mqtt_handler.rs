//! # Session Manager
//!
//! Owns the single broker connection of the agent and everything that has to
//! survive it going away: the subscription registry, the offline queue and
//! the discovery catalog.
//!
//! ## Why This Module Exists
//!
//! A desktop agent loses its broker all the time: Wi-Fi roams, the laptop
//! sleeps, the Home Assistant box reboots. Callers publishing metrics or
//! registering command subscriptions should not care. They talk to a
//! [`SessionHandle`] that never fails for connectivity reasons; the session
//! buffers, retries and replays behind it.
//!
//! ## Architecture
//!
//! ```text
//! SessionHandle ──commands──▶ ┌──────────────────┐ ◀──reports── dialer task
//!   (clone per caller)        │  SessionManager  │
//!        ▲   ▲                │  (one tokio task)│ ◀──events─── broker link
//!        │   └──watch status──┤                  │
//!        └──broadcast events──┴──────────────────┘ ──▶ CommandRouter callbacks
//! ```
//!
//! The manager is an actor. Every public operation, every dialer report and
//! every link event is handled serially on its task, so state, registry and
//! queue need no locks. Network I/O for connecting happens in the dialer task
//! ([`super::dialer`]), which reports back tagged with an epoch; bumping the
//! epoch is how `disconnect()` and `resume()` invalidate a sequence that is
//! still running.
//!
//! ## Lifecycle
//!
//! ```text
//! Disconnected ─connect()─▶ Connecting ─▶ Connected ─link lost─▶ Reconnecting ─▶ Connected
//!                              │                                     ▲      │
//!                              └─attempts exhausted─▶ Failed         └──────┘
//! any state ─disconnect()─▶ Disconnected
//! ```
//!
//! On every successful connect the session publishes discovery, re-asserts
//! each registered subscription once and then flushes the queue in order.
//!
//! `reconfigure()` swaps broker settings and transport in place. Registry and
//! queue carry over; the session reconnects only if the host wanted a
//! connection.

use super::broker_link::MqttConnector;
use super::config::SessionConfig;
use super::dialer::{self, DialMode, DialReport, Dialer};
use super::discovery::{self, EntityDescriptor};
use super::error::SessionError;
use super::message_manager::{InboundMessage, QoS, QueuedMessage};
use super::outbound_queue::OutboundQueue;
use super::router::CommandRouter;
use super::subscriptions::{SubscribeOutcome, SubscriptionRegistry, UnsubscribeOutcome};
use super::transport::{Connection, Connector, Link, LinkEvent};
use bytes::Bytes;
use chrono::{DateTime, Local};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const COMMAND_CAPACITY: usize = 64;
const DIAL_REPORT_CAPACITY: usize = 16;
const EVENT_CAPACITY: usize = 256;

macro_rules! respond {
    ($response_tx:expr, $value:expr) => {
        if $response_tx.send($value).is_err() {
            debug!("Caller went away before the response was sent");
        }
    };
}

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed => "failed",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// Connection state plus progress of the current connect sequence.
///
/// `Display` renders the short text a tray icon or status line shows.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: ConnectionState,
    /// 1-based attempt within the current sequence, 0 when none has started
    pub attempt: u32,
    /// Attempt limit of a host-initiated connect; `None` when retrying forever
    pub max_attempts: Option<u32>,
    /// Why the last attempt failed
    pub detail: Option<String>,
}

impl SessionStatus {
    pub fn new(state: ConnectionState) -> Self {
        SessionStatus {
            state,
            ..SessionStatus::default()
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use ConnectionState::*;
        match self.state {
            Disconnected => write!(f, "Disconnected"),
            Connected => write!(f, "Connected"),
            Failed => write!(f, "Failed to connect"),
            Connecting | Reconnecting if self.detail.is_some() => {
                write!(f, "Disconnected (retry {})", self.attempt)
            }
            Connecting => match (self.attempt, self.max_attempts) {
                (0, _) => write!(f, "Connecting…"),
                (attempt, Some(max)) => write!(f, "Connecting (attempt {}/{})", attempt, max),
                (attempt, None) => write!(f, "Connecting (attempt {})", attempt),
            },
            Reconnecting if self.attempt == 0 => write!(f, "Reconnecting…"),
            Reconnecting => write!(f, "Reconnecting (retry {})", self.attempt),
        }
    }
}

/// Counters for diagnostics, fetched with [`SessionHandle::stats`].
#[derive(Clone, Debug, Default)]
pub struct SessionStats {
    pub messages_received: usize,
    pub messages_sent: usize,
    pub messages_queued: usize,
    pub messages_dropped: u64,
    pub subscriptions: usize,
    pub last_activity: Option<DateTime<Local>>,
}

#[derive(Clone, Debug)]
pub enum SessionEvent {
    Status(SessionStatus),
    Message(InboundMessage),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Handed to the transport
    Sent,
    /// Buffered until the next successful connect
    Queued,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Started,
    AlreadyActive,
    /// The host disconnected explicitly; only `connect()` starts a new sequence
    Ignored,
}

enum SessionCommand {
    Connect {
        response_tx: oneshot::Sender<ConnectOutcome>,
    },
    Disconnect {
        response_tx: oneshot::Sender<()>,
    },
    Publish {
        message: QueuedMessage,
        response_tx: oneshot::Sender<PublishOutcome>,
    },
    Subscribe {
        topic_filter: String,
        qos: QoS,
        response_tx: oneshot::Sender<SubscribeOutcome>,
    },
    Unsubscribe {
        topic_filter: String,
        response_tx: oneshot::Sender<UnsubscribeOutcome>,
    },
    Resume {
        response_tx: oneshot::Sender<ConnectOutcome>,
    },
    Reconfigure {
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        response_tx: oneshot::Sender<ConnectOutcome>,
    },
    Stats {
        response_tx: oneshot::Sender<SessionStats>,
    },
    Shutdown {
        response_tx: oneshot::Sender<()>,
    },
}

/// Cloneable entry point to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    status: watch::Receiver<SessionStatus>,
    events: broadcast::Sender<SessionEvent>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SessionHandle {
    /// Validates `config` and starts the session task. Must be called from
    /// within a tokio runtime. The session starts `Disconnected`.
    pub fn spawn(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        router: Option<CommandRouter>,
    ) -> Result<Self, SessionError> {
        config.validate()?;

        let entities = discovery::catalog(&config.device_id);
        discovery::build_messages(&entities)?;

        if let Some(router) = &router {
            if router.device_id() != config.device_id {
                warn!(
                    "Command router is bound to device '{}' but the session runs as '{}'",
                    router.device_id(),
                    config.device_id
                );
            }
        }

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (dial_tx, dial_rx) = mpsc::channel(DIAL_REPORT_CAPACITY);
        let (status_tx, status_rx) = watch::channel(SessionStatus::default());
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);

        info!(
            "Starting MQTT session for device '{}' ({}:{})",
            config.device_id, config.broker.address, config.broker.port
        );

        let manager = SessionManager {
            queue: OutboundQueue::new(config.queue.capacity, config.queue.overflow),
            config,
            connector,
            router,
            entities,
            registry: SubscriptionRegistry::new(),
            link: None,
            link_events: None,
            deferred: VecDeque::new(),
            dial_task: None,
            dial_tx,
            epoch: 0,
            wants_connection: false,
            status: status_tx,
            events: event_tx.clone(),
            stats: SessionStats::default(),
        };
        let task = tokio::spawn(manager.run(command_rx, dial_rx));

        Ok(SessionHandle {
            commands: command_tx,
            status: status_rx,
            events: event_tx,
            task: Arc::new(Mutex::new(Some(task))),
        })
    }

    /// [`spawn`](Self::spawn) with the rumqttc transport.
    pub fn spawn_mqtt(
        config: SessionConfig,
        router: Option<CommandRouter>,
    ) -> Result<Self, SessionError> {
        let connector = Arc::new(MqttConnector::new(&config));
        Self::spawn(config, connector, router)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T, SessionError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.commands
            .send(build(response_tx))
            .await
            .map_err(|_| SessionError::Closed)?;
        response_rx.await.map_err(|_| SessionError::Closed)
    }

    pub async fn connect(&self) -> Result<ConnectOutcome, SessionError> {
        self.request(|response_tx| SessionCommand::Connect { response_tx })
            .await
    }

    pub async fn disconnect(&self) -> Result<(), SessionError> {
        self.request(|response_tx| SessionCommand::Disconnect { response_tx })
            .await
    }

    pub async fn publish(
        &self,
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Result<PublishOutcome, SessionError> {
        let message = QueuedMessage::new(topic, payload, qos, retain);
        self.request(|response_tx| SessionCommand::Publish {
            message,
            response_tx,
        })
        .await
    }

    pub async fn subscribe(
        &self,
        topic_filter: impl Into<String>,
        qos: QoS,
    ) -> Result<SubscribeOutcome, SessionError> {
        let topic_filter = topic_filter.into();
        self.request(|response_tx| SessionCommand::Subscribe {
            topic_filter,
            qos,
            response_tx,
        })
        .await
    }

    pub async fn unsubscribe(
        &self,
        topic_filter: impl Into<String>,
    ) -> Result<UnsubscribeOutcome, SessionError> {
        let topic_filter = topic_filter.into();
        self.request(|response_tx| SessionCommand::Unsubscribe {
            topic_filter,
            response_tx,
        })
        .await
    }

    /// Tells the session the OS just woke up; any existing link is presumed stale.
    pub async fn resume(&self) -> Result<ConnectOutcome, SessionError> {
        self.request(|response_tx| SessionCommand::Resume { response_tx })
            .await
    }

    /// Replaces the session settings and transport, e.g. after the user saved
    /// new broker settings.
    ///
    /// Returns `Started` when a connect sequence was started with the new
    /// settings and `Ignored` when the host had not asked for a connection.
    pub async fn reconfigure(
        &self,
        config: SessionConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<ConnectOutcome, SessionError> {
        config.validate()?;
        self.request(|response_tx| SessionCommand::Reconfigure {
            config,
            connector,
            response_tx,
        })
        .await
    }

    /// [`reconfigure`](Self::reconfigure) with the rumqttc transport.
    pub async fn reconfigure_mqtt(
        &self,
        config: SessionConfig,
    ) -> Result<ConnectOutcome, SessionError> {
        let connector = Arc::new(MqttConnector::new(&config));
        self.reconfigure(config, connector).await
    }

    pub async fn stats(&self) -> Result<SessionStats, SessionError> {
        self.request(|response_tx| SessionCommand::Stats { response_tx })
            .await
    }

    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    /// True once the session task has stopped.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Disconnects and waits for the session task to exit.
    ///
    /// Every handle is unusable afterwards. Calling it twice is harmless.
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        match self
            .request(|response_tx| SessionCommand::Shutdown { response_tx })
            .await
        {
            Ok(()) | Err(SessionError::Closed) => {}
            Err(e) => return Err(e),
        }

        let task = self.task.lock().ok().and_then(|mut guard| guard.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Session task ended abnormally: {}", e);
            }
        }
        Ok(())
    }
}

struct SessionManager {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    router: Option<CommandRouter>,
    entities: Vec<EntityDescriptor>,
    registry: SubscriptionRegistry,
    queue: OutboundQueue,
    link: Option<Box<dyn Link>>,
    link_events: Option<mpsc::Receiver<LinkEvent>>,
    /// Link events read while a link call was pending, handled after it
    deferred: VecDeque<LinkEvent>,
    dial_task: Option<JoinHandle<()>>,
    dial_tx: mpsc::Sender<DialReport>,
    epoch: u64,
    /// Host intent: true between connect() and disconnect()
    wants_connection: bool,
    status: watch::Sender<SessionStatus>,
    events: broadcast::Sender<SessionEvent>,
    stats: SessionStats,
}

async fn next_link_event(events: &mut Option<mpsc::Receiver<LinkEvent>>) -> LinkEvent {
    match events {
        Some(receiver) => receiver.recv().await.unwrap_or_else(|| LinkEvent::Closed {
            reason: "transport event stream ended".to_string(),
        }),
        None => std::future::pending().await,
    }
}

/// Awaits a link call while still reading the link's inbound events.
///
/// The transport's poll task stops polling while its event channel is full,
/// and a call waiting on that task would then never finish. Events read here
/// are parked in `deferred`; the stream is dropped after `Closed`.
async fn drive_link<T>(
    call: impl Future<Output = T>,
    events: &mut Option<mpsc::Receiver<LinkEvent>>,
    deferred: &mut VecDeque<LinkEvent>,
) -> T {
    tokio::pin!(call);
    loop {
        tokio::select! {
            biased;
            result = &mut call => return result,
            event = next_link_event(events) => {
                if matches!(event, LinkEvent::Closed { .. }) {
                    *events = None;
                }
                deferred.push_back(event);
            }
        }
    }
}

impl SessionManager {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<SessionCommand>,
        mut dial_reports: mpsc::Receiver<DialReport>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command).await {
                            break;
                        }
                    }
                    None => {
                        debug!("All session handles dropped");
                        self.teardown().await;
                        break;
                    }
                },
                Some(report) = dial_reports.recv() => self.handle_dial_report(report).await,
                event = next_link_event(&mut self.link_events) => {
                    self.handle_link_event(event).await
                }
            }
            self.handle_deferred().await;
        }
        info!("MQTT session for '{}' stopped", self.config.device_id);
    }

    /// Returns false once the session should stop.
    async fn handle_command(&mut self, command: SessionCommand) -> bool {
        match command {
            SessionCommand::Connect { response_tx } => {
                let outcome = self.connect();
                respond!(response_tx, outcome);
            }
            SessionCommand::Disconnect { response_tx } => {
                self.disconnect().await;
                respond!(response_tx, ());
            }
            SessionCommand::Publish {
                message,
                response_tx,
            } => {
                let outcome = self.publish(message).await;
                respond!(response_tx, outcome);
            }
            SessionCommand::Subscribe {
                topic_filter,
                qos,
                response_tx,
            } => {
                let outcome = self.subscribe(&topic_filter, qos).await;
                respond!(response_tx, outcome);
            }
            SessionCommand::Unsubscribe {
                topic_filter,
                response_tx,
            } => {
                let outcome = self.unsubscribe(&topic_filter).await;
                respond!(response_tx, outcome);
            }
            SessionCommand::Resume { response_tx } => {
                let outcome = self.resume().await;
                respond!(response_tx, outcome);
            }
            SessionCommand::Reconfigure {
                config,
                connector,
                response_tx,
            } => {
                let outcome = self.reconfigure(config, connector).await;
                respond!(response_tx, outcome);
            }
            SessionCommand::Stats { response_tx } => {
                respond!(response_tx, self.stats());
            }
            SessionCommand::Shutdown { response_tx } => {
                self.teardown().await;
                respond!(response_tx, ());
                return false;
            }
        }
        true
    }

    fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    fn current_status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    fn set_status(&self, status: SessionStatus) {
        let previous = self.status.send_replace(status.clone());
        if previous.state != status.state {
            info!("Session state {} -> {}", previous.state, status.state);
        } else {
            debug!("Status change: {:?}", status);
        }
        let _ = self.events.send(SessionEvent::Status(status));
    }

    fn connect(&mut self) -> ConnectOutcome {
        match self.state() {
            state @ (ConnectionState::Connecting
            | ConnectionState::Connected
            | ConnectionState::Reconnecting) => {
                debug!("connect() ignored, session is already {}", state);
                ConnectOutcome::AlreadyActive
            }
            ConnectionState::Disconnected | ConnectionState::Failed => {
                self.wants_connection = true;
                self.start_dial(DialMode::Connect);
                ConnectOutcome::Started
            }
        }
    }

    async fn disconnect(&mut self) {
        self.wants_connection = false;
        if self.state() == ConnectionState::Disconnected
            && self.dial_task.is_none()
            && self.link.is_none()
        {
            debug!("disconnect() ignored, session is not connected");
            return;
        }

        self.epoch += 1;
        self.abort_dial();
        self.close_link().await;
        self.set_status(SessionStatus::new(ConnectionState::Disconnected));
    }

    async fn resume(&mut self) -> ConnectOutcome {
        if !self.wants_connection {
            debug!("Ignoring resume, session was disconnected by the host");
            return ConnectOutcome::Ignored;
        }
        if self.dial_task.is_some() {
            debug!("Ignoring resume, a connect sequence is already running");
            return ConnectOutcome::AlreadyActive;
        }

        match self.state() {
            ConnectionState::Failed | ConnectionState::Disconnected => {
                self.start_dial(DialMode::Connect);
            }
            ConnectionState::Connected
            | ConnectionState::Connecting
            | ConnectionState::Reconnecting => {
                info!("System resumed, re-establishing broker link");
                self.close_link().await;
                self.start_dial(DialMode::Resume);
            }
        }
        ConnectOutcome::Started
    }

    async fn reconfigure(
        &mut self,
        config: SessionConfig,
        connector: Arc<dyn Connector>,
    ) -> ConnectOutcome {
        info!(
            "Applying new settings for device '{}' ({}:{})",
            config.device_id, config.broker.address, config.broker.port
        );
        self.epoch += 1;
        self.abort_dial();
        self.close_link().await;

        if config.device_id != self.config.device_id {
            self.entities = discovery::catalog(&config.device_id);
            if let Some(router) = &self.router {
                warn!(
                    "Device id changed to '{}', command router still serves '{}'",
                    config.device_id,
                    router.device_id()
                );
            }
        }
        self.queue.resize(config.queue.capacity, config.queue.overflow);
        self.config = config;
        self.connector = connector;

        if self.wants_connection {
            self.start_dial(DialMode::Connect);
            ConnectOutcome::Started
        } else {
            debug!("New settings stored, no connection requested");
            ConnectOutcome::Ignored
        }
    }

    fn start_dial(&mut self, mode: DialMode) {
        self.abort_dial();
        self.epoch += 1;

        let (state, max_attempts) = match mode {
            DialMode::Connect => (
                ConnectionState::Connecting,
                Some(self.config.retry.connect_attempts),
            ),
            DialMode::Reconnect | DialMode::Resume => (ConnectionState::Reconnecting, None),
        };
        self.set_status(SessionStatus {
            state,
            attempt: 0,
            max_attempts,
            detail: None,
        });

        let dialer = Dialer::create(
            self.connector.clone(),
            self.config.retry.clone(),
            mode,
            self.epoch,
            self.dial_tx.clone(),
        );
        self.dial_task = Some(tokio::spawn(dialer::run(dialer)));
    }

    fn abort_dial(&mut self) {
        if let Some(task) = self.dial_task.take() {
            task.abort();
        }
    }

    async fn close_link(&mut self) {
        if let Some(link) = self.link.take() {
            let closed = drive_link(link.disconnect(), &mut self.link_events, &mut self.deferred);
            if let Err(e) = closed.await {
                warn!("Error while closing broker link: {}", e);
            }
        }
        self.link_events = None;
        self.deferred.retain(|event| !matches!(event, LinkEvent::Closed { .. }));
    }

    async fn handle_dial_report(&mut self, report: DialReport) {
        if report.epoch() != self.epoch {
            debug!(
                "Discarding report from superseded connect sequence (epoch {}, current {})",
                report.epoch(),
                self.epoch
            );
            if let DialReport::Linked { connection, .. } = report {
                let Connection { link, events } = connection;
                drop(events);
                if let Err(e) = link.disconnect().await {
                    debug!("Closing stale link failed: {}", e);
                }
            }
            return;
        }

        match report {
            DialReport::Attempt { attempt, .. } => {
                let mut status = self.current_status();
                status.attempt = attempt;
                status.detail = None;
                self.set_status(status);
            }
            DialReport::Failed { attempt, error, .. } => {
                let mut status = self.current_status();
                status.attempt = attempt;
                status.detail = Some(error.to_string());
                self.set_status(status);
            }
            DialReport::Linked { connection, .. } => {
                self.dial_task = None;
                self.on_linked(connection).await;
            }
            DialReport::Exhausted { attempts, .. } => {
                self.dial_task = None;
                error!(
                    "Could not connect to {}:{} after {} attempts",
                    self.config.broker.address, self.config.broker.port, attempts
                );
                let last = self.current_status();
                self.set_status(SessionStatus {
                    state: ConnectionState::Failed,
                    attempt: attempts,
                    max_attempts: last.max_attempts,
                    detail: last.detail,
                });
            }
        }
    }

    async fn on_linked(&mut self, connection: Connection) {
        let Connection { link, events } = connection;
        self.link = Some(link);
        self.link_events = Some(events);
        self.set_status(SessionStatus::new(ConnectionState::Connected));

        self.announce().await;
        self.resubscribe().await;
        self.flush_queue().await;
    }

    async fn announce(&mut self) {
        let Some(link) = self.link.as_deref() else {
            return;
        };
        let published = drive_link(
            discovery::publish_all(link, &self.entities),
            &mut self.link_events,
            &mut self.deferred,
        );
        match published.await {
            Ok(count) => self.stats.messages_sent += count,
            Err(e) => warn!("Discovery publish failed: {}", e),
        }
    }

    async fn resubscribe(&mut self) {
        let Some(link) = self.link.as_deref() else {
            return;
        };
        let subscriptions = self.registry.all();
        if !subscriptions.is_empty() {
            info!("Re-subscribing {} topic filters", subscriptions.len());
        }
        for subscription in subscriptions {
            let subscribed = drive_link(
                link.subscribe(&subscription.topic_filter, subscription.qos),
                &mut self.link_events,
                &mut self.deferred,
            );
            if let Err(e) = subscribed.await {
                warn!("Re-subscribe to {} failed: {}", subscription.topic_filter, e);
            }
        }
    }

    async fn flush_queue(&mut self) {
        let pending = self.queue.drain();
        if pending.is_empty() {
            return;
        }
        info!("Flushing {} queued messages", pending.len());

        let mut pending = pending.into_iter();
        while let Some(message) = pending.next() {
            if let Err(e) = self.send_now(&message).await {
                warn!("Flush interrupted at {}: {}", message.topic, e);
                let mut undelivered = vec![message];
                undelivered.extend(pending);
                self.queue.restore(undelivered);
                return;
            }
        }
    }

    async fn send_now(&mut self, message: &QueuedMessage) -> Result<(), SessionError> {
        let Some(link) = self.link.as_deref() else {
            return Err(SessionError::Transport("no active link".to_string()));
        };
        let call = link.publish(
            &message.topic,
            message.payload.clone(),
            message.qos,
            message.retain,
        );
        drive_link(call, &mut self.link_events, &mut self.deferred).await?;
        self.stats.messages_sent += 1;
        self.stats.last_activity = Some(Local::now());
        Ok(())
    }

    async fn publish(&mut self, message: QueuedMessage) -> PublishOutcome {
        if self.state() == ConnectionState::Connected && !self.queue.is_empty() {
            self.flush_queue().await;
        }
        if self.state() == ConnectionState::Connected && self.queue.is_empty() {
            match self.send_now(&message).await {
                Ok(()) => return PublishOutcome::Sent,
                Err(e) => warn!("Publish to {} failed, queueing it: {}", message.topic, e),
            }
        }
        self.queue.enqueue(message);
        PublishOutcome::Queued
    }

    async fn subscribe(&mut self, topic_filter: &str, qos: QoS) -> SubscribeOutcome {
        let outcome = self.registry.subscribe(topic_filter, qos);
        if outcome.needs_wire() && self.state() == ConnectionState::Connected {
            if let Some(link) = self.link.as_deref() {
                let call = link.subscribe(topic_filter, qos);
                let subscribed = drive_link(call, &mut self.link_events, &mut self.deferred);
                if let Err(e) = subscribed.await {
                    warn!("Subscribe to {} failed: {}", topic_filter, e);
                }
            }
        }
        debug!("subscribe({}) -> {:?}", topic_filter, outcome);
        outcome
    }

    async fn unsubscribe(&mut self, topic_filter: &str) -> UnsubscribeOutcome {
        let outcome = self.registry.unsubscribe(topic_filter);
        if outcome == UnsubscribeOutcome::Removed && self.state() == ConnectionState::Connected {
            if let Some(link) = self.link.as_deref() {
                let call = link.unsubscribe(topic_filter);
                let unsubscribed = drive_link(call, &mut self.link_events, &mut self.deferred);
                if let Err(e) = unsubscribed.await {
                    warn!("Unsubscribe from {} failed: {}", topic_filter, e);
                }
            }
        }
        debug!("unsubscribe({}) -> {:?}", topic_filter, outcome);
        outcome
    }

    async fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Message(message) => {
                self.stats.messages_received += 1;
                self.stats.last_activity = Some(message.received_at);
                if let Some(router) = &self.router {
                    router.route(&message.topic, &message.payload);
                }
                let _ = self.events.send(SessionEvent::Message(message));
            }
            LinkEvent::Closed { reason } => {
                if self.link.is_none() {
                    debug!("Ignoring close of a link that is already gone: {}", reason);
                    return;
                }
                warn!("Broker link closed: {}", reason);
                self.link = None;
                self.link_events = None;
                if self.wants_connection {
                    self.start_dial(DialMode::Reconnect);
                } else {
                    self.set_status(SessionStatus::new(ConnectionState::Disconnected));
                }
            }
        }
    }

    async fn handle_deferred(&mut self) {
        while let Some(event) = self.deferred.pop_front() {
            self.handle_link_event(event).await;
        }
    }

    fn stats(&self) -> SessionStats {
        SessionStats {
            messages_queued: self.queue.len(),
            messages_dropped: self.queue.dropped(),
            subscriptions: self.registry.len(),
            ..self.stats.clone()
        }
    }

    async fn teardown(&mut self) {
        self.disconnect().await;
        self.registry.clear();
    }
}
