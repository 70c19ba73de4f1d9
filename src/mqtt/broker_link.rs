//! rumqttc-backed [`Connector`] and [`Link`].
//!
//! Each call to [`MqttConnector::connect`] builds a fresh client/event-loop
//! pair, polls it until the broker's CONNACK (bounded by the configured
//! timeout) and then moves the event loop into a background task. That task
//! forwards incoming publishes and reports the first error as
//! [`LinkEvent::Closed`]; it never reconnects by itself. Reconnecting is the
//! session's decision.

use super::config::{BrokerConfig, SessionConfig};
use super::error::SessionError;
use super::message_manager::{InboundMessage, QoS};
use super::transport::{Connection, Connector, Link, LinkEvent};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::tokio_rustls::rustls;
use rumqttc::tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rumqttc::tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rumqttc::tokio_rustls::rustls::{DigitallySignedStruct, SignatureScheme};
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet,
    TlsConfiguration, Transport,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const REQUEST_CAPACITY: usize = 100;
const EVENT_CAPACITY: usize = 256;

pub struct MqttConnector {
    broker: BrokerConfig,
    client_id: String,
}

impl MqttConnector {
    pub fn new(config: &SessionConfig) -> Self {
        MqttConnector {
            broker: config.broker.clone(),
            client_id: config.client_id(),
        }
    }

    fn options(&self) -> Result<MqttOptions, SessionError> {
        let broker = &self.broker;
        let mut options = if broker.use_websocket {
            MqttOptions::new(&self.client_id, broker.websocket_url(), broker.port)
        } else {
            MqttOptions::new(&self.client_id, &broker.address, broker.port)
        };

        options
            .set_keep_alive(broker.keep_alive())
            .set_clean_session(true);

        if let Some(username) = broker.username.as_deref().filter(|u| !u.is_empty()) {
            options.set_credentials(username, broker.password.clone().unwrap_or_default());
        }

        match (broker.use_websocket, broker.use_tls) {
            (false, false) => {}
            (false, true) => {
                options.set_transport(Transport::Tls(tls_configuration(broker)?));
            }
            (true, false) => {
                options.set_transport(Transport::Ws);
            }
            (true, true) => {
                options.set_transport(Transport::Wss(tls_configuration(broker)?));
            }
        }

        Ok(options)
    }
}

#[async_trait]
impl Connector for MqttConnector {
    async fn connect(&self) -> Result<Connection, SessionError> {
        let options = self.options()?;
        debug!(
            "Dialing {}:{} as {} (tls: {}, websocket: {})",
            self.broker.address,
            self.broker.port,
            self.client_id,
            self.broker.use_tls,
            self.broker.use_websocket
        );

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let timeout = self.broker.connect_timeout();
        match tokio::time::timeout(timeout, wait_for_connack(&mut eventloop)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(SessionError::Timeout(timeout)),
        }
        info!("Broker {}:{} accepted the connection", self.broker.address, self.broker.port);

        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        let cancel = CancellationToken::new();
        tokio::spawn(forward_events(eventloop, event_tx, cancel.clone()));

        Ok(Connection::new(Box::new(BrokerLink { client, cancel }), event_rx))
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), SessionError> {
    loop {
        match eventloop.poll().await? {
            Event::Incoming(Packet::ConnAck(ack)) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(SessionError::Refused(format!("{:?}", ack.code)))
                };
            }
            other => debug!("Event before CONNACK: {:?}", other),
        }
    }
}

async fn forward_events(
    mut eventloop: EventLoop,
    events: mpsc::Sender<LinkEvent>,
    cancel: CancellationToken,
) {
    let reason = loop {
        tokio::select! {
            biased;
            polled = eventloop.poll() => match polled {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let message = InboundMessage::new(publish.topic, publish.payload);
                    if events.send(LinkEvent::Message(message)).await.is_err() {
                        debug!("Session dropped the link, stopping event loop");
                        return;
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    break "broker sent DISCONNECT".to_string();
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    debug!("Sent DISCONNECT, stopping event loop");
                    return;
                }
                Ok(_) => {}
                Err(e) => break e.to_string(),
            },
            _ = cancel.cancelled() => {
                debug!("Link cancelled, stopping event loop");
                return;
            }
        }
    };

    warn!("MQTT connection lost: {}", reason);
    let _ = events.send(LinkEvent::Closed { reason }).await;
}

struct BrokerLink {
    client: AsyncClient,
    cancel: CancellationToken,
}

impl Drop for BrokerLink {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl Link for BrokerLink {
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), SessionError> {
        self.client
            .publish_bytes(topic, qos.into(), retain, payload)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, topic_filter: &str, qos: QoS) -> Result<(), SessionError> {
        self.client.subscribe(topic_filter, qos.into()).await?;
        Ok(())
    }

    async fn unsubscribe(&self, topic_filter: &str) -> Result<(), SessionError> {
        self.client.unsubscribe(topic_filter).await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), SessionError> {
        self.client.disconnect().await?;
        Ok(())
    }
}

fn tls_configuration(broker: &BrokerConfig) -> Result<TlsConfiguration, SessionError> {
    if !broker.ignore_certificate_errors {
        return Ok(TlsConfiguration::default());
    }

    warn!(
        "Certificate verification is disabled for {}:{}",
        broker.address, broker.port
    );
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_no_client_auth();
    Ok(TlsConfiguration::Rustls(Arc::new(config)))
}

/// Accepts every server certificate. Installed only when the user turned on
/// `ignore_certificate_errors`.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connector(broker: BrokerConfig) -> MqttConnector {
        MqttConnector::new(&SessionConfig::new(broker, "DESK01"))
    }

    #[test]
    fn plain_tcp_options() {
        let options = connector(BrokerConfig::default()).options().unwrap();
        assert_eq!(options.client_id(), "PCMON_DESK01");
        assert_eq!(options.broker_address(), ("localhost".to_string(), 1883));
        assert!(options.clean_session());
        assert!(options.credentials().is_none());
    }

    #[test]
    fn credentials_are_applied() {
        let broker = BrokerConfig {
            username: Some("ha".to_string()),
            password: Some("secret".to_string()),
            ..BrokerConfig::default()
        };
        let options = connector(broker).options().unwrap();
        assert_eq!(
            options.credentials(),
            Some(("ha".to_string(), "secret".to_string()))
        );
    }

    #[test]
    fn websocket_uses_url_as_host() {
        let broker = BrokerConfig {
            address: "broker.lan".to_string(),
            port: 8083,
            use_websocket: true,
            ..BrokerConfig::default()
        };
        let options = connector(broker).options().unwrap();
        assert_eq!(options.broker_address().0, "ws://broker.lan:8083");
        assert!(matches!(options.transport(), Transport::Ws));
    }

    #[test]
    fn insecure_tls_builds_custom_verifier() {
        let broker = BrokerConfig {
            use_tls: true,
            ignore_certificate_errors: true,
            ..BrokerConfig::default()
        };
        let options = connector(broker).options().unwrap();
        assert!(matches!(
            options.transport(),
            Transport::Tls(TlsConfiguration::Rustls(_))
        ));
    }
}
