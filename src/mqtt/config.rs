use super::error::SessionError;
use super::outbound_queue::{OverflowPolicy, DEFAULT_QUEUE_CAPACITY};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 1883;
const CLIENT_ID_PREFIX: &str = "PCMON_";

/// How to reach the broker.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub address: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_tls: bool,
    /// Accept any server certificate. Only for self-signed brokers on a trusted LAN.
    pub ignore_certificate_errors: bool,
    pub use_websocket: bool,
    /// Path appended to the `ws://`/`wss://` URL, e.g. `/mqtt`
    pub websocket_path: String,
    /// Defaults to `PCMON_<device_id>` when unset
    pub client_id: Option<String>,
    pub keep_alive_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            address: "localhost".to_string(),
            port: DEFAULT_PORT,
            username: None,
            password: None,
            use_tls: false,
            ignore_certificate_errors: false,
            use_websocket: false,
            websocket_path: String::new(),
            client_id: None,
            keep_alive_secs: 30,
            connect_timeout_secs: 5,
        }
    }
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("address", &self.address)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("use_tls", &self.use_tls)
            .field("ignore_certificate_errors", &self.ignore_certificate_errors)
            .field("use_websocket", &self.use_websocket)
            .field("websocket_path", &self.websocket_path)
            .field("client_id", &self.client_id)
            .field("keep_alive_secs", &self.keep_alive_secs)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .finish()
    }
}

impl BrokerConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// `ws://host:port/path` or `wss://...`, used when WebSocket transport is on
    pub fn websocket_url(&self) -> String {
        let scheme = if self.use_tls { "wss" } else { "ws" };
        let path = match self.websocket_path.as_str() {
            "" => String::new(),
            p if p.starts_with('/') => p.to_string(),
            p => format!("/{}", p),
        };
        format!("{}://{}:{}{}", scheme, self.address, self.port, path)
    }
}

/// Timing of connect sequences.
///
/// A host-initiated connect tries `connect_attempts` times with `retry_delay`
/// in between and then gives up. After an unsolicited disconnect the session
/// retries forever, starting at `reconnect_delay` and doubling per failed
/// attempt up to `max_reconnect_delay`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub connect_attempts: u32,
    pub retry_delay_ms: u64,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            connect_attempts: 2,
            retry_delay_ms: 1000,
            reconnect_delay_ms: 1000,
            max_reconnect_delay_ms: 1000,
        }
    }
}

impl RetryPolicy {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Delay before reconnect attempt number `retry + 1`.
    pub fn reconnect_delay(&self, retry: u32) -> Duration {
        let base = self.reconnect_delay_ms;
        let cap = self.max_reconnect_delay_ms.max(base);
        let shift = retry.saturating_sub(1).min(20);
        Duration::from_millis(base.saturating_mul(1u64 << shift).min(cap))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub capacity: usize,
    pub overflow: OverflowPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            capacity: DEFAULT_QUEUE_CAPACITY,
            overflow: OverflowPolicy::default(),
        }
    }
}

/// Everything a session needs at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub broker: BrokerConfig,
    pub device_id: String,
    pub retry: RetryPolicy,
    pub queue: QueueConfig,
}

impl SessionConfig {
    pub fn new(broker: BrokerConfig, device_id: impl Into<String>) -> Self {
        SessionConfig {
            broker,
            device_id: device_id.into(),
            retry: RetryPolicy::default(),
            queue: QueueConfig::default(),
        }
    }

    pub fn client_id(&self) -> String {
        match &self.broker.client_id {
            Some(id) if !id.trim().is_empty() => id.clone(),
            _ => format!("{}{}", CLIENT_ID_PREFIX, self.device_id),
        }
    }

    /// Rejects settings no amount of retrying could fix.
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.broker.address.trim().is_empty() {
            return Err(SessionError::InvalidConfig(
                "broker address must not be empty".to_string(),
            ));
        }
        if self.broker.port == 0 {
            return Err(SessionError::InvalidConfig("broker port must not be 0".to_string()));
        }
        if self.device_id.trim().is_empty() {
            return Err(SessionError::InvalidConfig(
                "device id must not be empty".to_string(),
            ));
        }
        if self.device_id.contains(['/', '+', '#']) {
            return Err(SessionError::InvalidConfig(format!(
                "device id '{}' must not contain '/', '+' or '#'",
                self.device_id
            )));
        }
        if self.retry.connect_attempts == 0 {
            return Err(SessionError::InvalidConfig(
                "connect attempts must be at least 1".to_string(),
            ));
        }
        if self.queue.capacity == 0 {
            return Err(SessionError::InvalidConfig(
                "queue capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
