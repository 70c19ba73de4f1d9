//! Error types for the MQTT session core

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the session, its transport and its configuration.
///
/// Connectivity problems never reach callers that only publish or subscribe;
/// they are retried internally and reported through status events. The
/// variants below show up in those status events, in logs, and as the return
/// value of [`Connector::connect`](super::transport::Connector::connect).
#[derive(Debug, Error)]
pub enum SessionError {
    /// Rejected at construction, e.g. empty broker address or device id
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Network or protocol failure while dialing the broker
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The broker answered CONNACK with a non-success code
    #[error("Broker refused connection: {0}")]
    Refused(String),

    #[error("Connection attempt timed out after {0:?}")]
    Timeout(Duration),

    /// Request could not be handed to the transport
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The session task has stopped; the handle is no longer usable
    #[error("Session closed")]
    Closed,
}

impl From<rumqttc::ClientError> for SessionError {
    fn from(error: rumqttc::ClientError) -> Self {
        SessionError::Transport(error.to_string())
    }
}

impl From<rumqttc::ConnectionError> for SessionError {
    fn from(error: rumqttc::ConnectionError) -> Self {
        match error {
            rumqttc::ConnectionError::ConnectionRefused(code) => {
                SessionError::Refused(format!("{:?}", code))
            }
            other => SessionError::ConnectionFailed(other.to_string()),
        }
    }
}
