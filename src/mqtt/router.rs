//! # Command Router
//!
//! Turns inbound switch commands from Home Assistant into power actions.
//!
//! Only topics of the exact shape `homeassistant/switch/<device_id>/<action>/set`
//! are accepted. Everything else (other devices, extra segments, unknown
//! actions) is logged and dropped; inbound traffic is never trusted and never
//! able to crash the session.
//!
//! The router does not execute anything itself. The host registers one
//! callback per [`CommandAction`] and decides what "shutdown" means on its
//! platform. Callbacks run on the session task, so they should hand work off
//! (e.g. through a channel) instead of blocking.

use super::discovery::{command_topic, EntityKind, DISCOVERY_PREFIX, PAYLOAD_ON};
use crate::metrics::PowerState;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

const COMMAND_SUFFIX: &str = "set";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandAction {
    Shutdown,
    Reboot,
    Standby,
    Hibernate,
    Unknown,
}

impl CommandAction {
    /// Actions exposed as switches, in catalog order.
    pub const SWITCHES: [CommandAction; 4] = [
        CommandAction::Shutdown,
        CommandAction::Reboot,
        CommandAction::Standby,
        CommandAction::Hibernate,
    ];

    pub fn parse(segment: &str) -> Self {
        match segment.to_ascii_lowercase().as_str() {
            "shutdown" => CommandAction::Shutdown,
            "reboot" => CommandAction::Reboot,
            "standby" => CommandAction::Standby,
            "hibernate" => CommandAction::Hibernate,
            _ => CommandAction::Unknown,
        }
    }

    pub fn entity_id(self) -> &'static str {
        match self {
            CommandAction::Shutdown => "shutdown",
            CommandAction::Reboot => "reboot",
            CommandAction::Standby => "standby",
            CommandAction::Hibernate => "hibernate",
            CommandAction::Unknown => "unknown",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            CommandAction::Shutdown => "Shutdown",
            CommandAction::Reboot => "Reboot",
            CommandAction::Standby => "Standby",
            CommandAction::Hibernate => "Hibernate",
            CommandAction::Unknown => "Unknown",
        }
    }

    pub fn icon(self) -> &'static str {
        match self {
            CommandAction::Shutdown => "mdi:power",
            CommandAction::Reboot => "mdi:restart",
            CommandAction::Standby => "mdi:power-sleep",
            CommandAction::Hibernate => "mdi:power-settings",
            CommandAction::Unknown => "mdi:help",
        }
    }

    /// Power state to report before carrying out the action.
    ///
    /// A reboot comes back on its own, so it reports nothing.
    pub fn power_state(self) -> Option<PowerState> {
        match self {
            CommandAction::Shutdown => Some(PowerState::Off),
            CommandAction::Standby => Some(PowerState::Sleep),
            CommandAction::Hibernate => Some(PowerState::Hibernate),
            CommandAction::Reboot | CommandAction::Unknown => None,
        }
    }
}

impl fmt::Display for CommandAction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.entity_id())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundCommand {
    pub raw_topic: String,
    pub payload: String,
    pub action: CommandAction,
}

impl InboundCommand {
    /// True when Home Assistant switched the entity on. Turning a power
    /// switch off is not a request to do anything.
    pub fn is_on(&self) -> bool {
        self.payload.trim().eq_ignore_ascii_case(PAYLOAD_ON)
    }
}

pub type ActionCallback = Arc<dyn Fn(&InboundCommand) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// The registered callback was invoked once
    Dispatched(CommandAction),
    /// Well-formed command without a registered callback
    NoHandler(CommandAction),
    /// Well-formed topic naming an action this device does not offer
    UnknownAction(String),
    /// Not a command topic for this device
    Ignored,
}

#[derive(Default, Clone)]
struct Handlers {
    shutdown: Option<ActionCallback>,
    reboot: Option<ActionCallback>,
    standby: Option<ActionCallback>,
    hibernate: Option<ActionCallback>,
}

#[derive(Clone)]
pub struct CommandRouter {
    device_id: String,
    handlers: Handlers,
}

impl fmt::Debug for CommandRouter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CommandRouter")
            .field("device_id", &self.device_id)
            .field("shutdown", &self.handlers.shutdown.is_some())
            .field("reboot", &self.handlers.reboot.is_some())
            .field("standby", &self.handlers.standby.is_some())
            .field("hibernate", &self.handlers.hibernate.is_some())
            .finish()
    }
}

impl CommandRouter {
    pub fn new(device_id: impl Into<String>) -> Self {
        CommandRouter {
            device_id: device_id.into(),
            handlers: Handlers::default(),
        }
    }

    /// Registers the callback for `action`, replacing any previous one.
    ///
    /// Registering for [`CommandAction::Unknown`] has no effect.
    pub fn on<F>(mut self, action: CommandAction, callback: F) -> Self
    where
        F: Fn(&InboundCommand) + Send + Sync + 'static,
    {
        let callback: ActionCallback = Arc::new(callback);
        match action {
            CommandAction::Shutdown => self.handlers.shutdown = Some(callback),
            CommandAction::Reboot => self.handlers.reboot = Some(callback),
            CommandAction::Standby => self.handlers.standby = Some(callback),
            CommandAction::Hibernate => self.handlers.hibernate = Some(callback),
            CommandAction::Unknown => {
                warn!("Ignoring callback registration for unknown action");
            }
        }
        self
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Wildcard filter covering every command topic of this device.
    pub fn command_filter(&self) -> String {
        format!(
            "{}/{}/{}/+/{}",
            DISCOVERY_PREFIX,
            EntityKind::Switch.component(),
            self.device_id,
            COMMAND_SUFFIX
        )
    }

    pub fn command_topics(&self) -> Vec<String> {
        CommandAction::SWITCHES
            .iter()
            .map(|action| command_topic(&self.device_id, action.entity_id()))
            .collect()
    }

    /// Parses `topic` as a command for this device.
    ///
    /// Returns `None` when the topic does not have the command shape or
    /// addresses another device.
    pub fn parse(&self, topic: &str, payload: &[u8]) -> Option<InboundCommand> {
        let segments: Vec<&str> = topic.split('/').collect();
        let [prefix, component, device, action, suffix] = segments.as_slice() else {
            return None;
        };

        if *prefix != DISCOVERY_PREFIX
            || *component != EntityKind::Switch.component()
            || *device != self.device_id
            || *suffix != COMMAND_SUFFIX
            || action.is_empty()
        {
            return None;
        }

        Some(InboundCommand {
            raw_topic: topic.to_string(),
            payload: String::from_utf8_lossy(payload).into_owned(),
            action: CommandAction::parse(action),
        })
    }

    pub fn route(&self, topic: &str, payload: &[u8]) -> RouteOutcome {
        let Some(command) = self.parse(topic, payload) else {
            debug!("Ignoring message on non-command topic {}", topic);
            return RouteOutcome::Ignored;
        };

        let handler = match command.action {
            CommandAction::Shutdown => &self.handlers.shutdown,
            CommandAction::Reboot => &self.handlers.reboot,
            CommandAction::Standby => &self.handlers.standby,
            CommandAction::Hibernate => &self.handlers.hibernate,
            CommandAction::Unknown => {
                let name = topic.split('/').nth(3).unwrap_or_default().to_string();
                warn!("Dropping command for unknown action '{}' on {}", name, topic);
                return RouteOutcome::UnknownAction(name);
            }
        };

        match handler {
            Some(callback) => {
                info!(
                    "Dispatching {} command (payload: {})",
                    command.action, command.payload
                );
                callback(&command);
                RouteOutcome::Dispatched(command.action)
            }
            None => {
                warn!("No handler registered for {} command", command.action);
                RouteOutcome::NoHandler(command.action)
            }
        }
    }
}
