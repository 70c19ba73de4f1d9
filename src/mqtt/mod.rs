//! # MQTT Session Core
//!
//! Keeps a PC connected to a Home Assistant MQTT broker: announces the PC's
//! sensors and power switches through MQTT discovery, publishes their states,
//! and turns switch commands coming back from Home Assistant into power
//! actions for the host to carry out.
//!
//! ## Why This Module Exists
//!
//! The agent runs unattended on a desktop that sleeps, hibernates and changes
//! networks. Everything above this module (metric sampling, the tray shell,
//! the code that actually shuts the machine down) wants a fire-and-forget
//! publish API and a callback when a command arrives. This module absorbs the
//! connectivity problems in between.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── mqtt_handler.rs     - Session actor, handle, state machine
//! ├── dialer.rs           - Connect/retry sequences (typestate)
//! ├── transport.rs        - Connector/Link seam between session and wire
//! ├── broker_link.rs      - rumqttc implementation of the seam, TLS setup
//! ├── discovery.rs        - Entity catalog and discovery documents
//! ├── router.rs           - Inbound command topics to power actions
//! ├── subscriptions.rs    - Idempotent subscription registry
//! ├── outbound_queue.rs   - Bounded offline buffer
//! ├── message_manager.rs  - Message and QoS types
//! ├── config.rs           - Broker, retry and queue settings
//! └── error.rs            - SessionError
//! ```
//!
//! ## Design Philosophy
//!
//! - **Never fail the caller for the network**: publishes while offline are
//!   queued, subscriptions are remembered, connect failures become status
//!   events.
//! - **One owner**: a single actor task owns the link and all bookkeeping.
//! - **Replaceable transport**: the session only sees [`transport::Connector`]
//!   and [`transport::Link`], which keeps the state machine testable without
//!   a broker.
//!
//! ## Usage
//!
//! ```no_run
//! use pcmon_mqtt::mqtt::config::{BrokerConfig, SessionConfig};
//! use pcmon_mqtt::mqtt::message_manager::QoS;
//! use pcmon_mqtt::mqtt::mqtt_handler::SessionHandle;
//! use pcmon_mqtt::mqtt::router::{CommandAction, CommandRouter};
//!
//! # async fn example() -> Result<(), pcmon_mqtt::mqtt::error::SessionError> {
//! let config = SessionConfig::new(BrokerConfig::default(), "DESK01");
//! let router = CommandRouter::new("DESK01")
//!     .on(CommandAction::Shutdown, |cmd| println!("shutdown requested: {}", cmd.payload));
//! let filter = router.command_filter();
//!
//! let session = SessionHandle::spawn_mqtt(config, Some(router))?;
//! session.subscribe(filter, QoS::AtLeastOnce).await?;
//! session.connect().await?;
//! let topic = "homeassistant/sensor/DESK01/cpu_usage/state";
//! session.publish(topic, "12.50", QoS::AtLeastOnce, false).await?;
//! # Ok(())
//! # }
//! ```

pub mod broker_link;
pub mod config;
pub mod dialer;
pub mod discovery;
pub mod error;
pub mod message_manager;
pub mod mqtt_handler;
pub mod outbound_queue;
pub mod router;
pub mod subscriptions;
pub mod transport;
