//! Device model
//!
//! Devices are the normalized view of whatever a physical appliance publishes
//! under `stat/{type}/{name}`. The `{type}` segment picks a family from a
//! static table; each family knows how to decode its own payloads into a
//! [`StatusWord`] and which [`Command`]s it accepts.
//!
//! ```text
//! stat/{type}/{name}[/{sub}] ──► FAMILIES[type] ──► Device ──► parse_state()
//!                                   (lookup miss = dropped)      │
//!                                                                ▼
//!                                                     StatusWord + commands
//! ```
//!
//! Decoding is pure: nothing in here does I/O, and a payload that cannot be
//! decoded turns into an error status rather than an `Err` for the caller.

pub mod light;
pub mod remote;
pub mod status;
pub mod switch;

use crate::command::Command;
use crate::registry::topic::DeviceTopic;
use chrono::{DateTime, Local};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;
use tracing::debug;

pub use status::{status_text, DeviceType, LevelDisplay, StateType, StatusWord};

pub const COMMAND_ON: &str = "ON";
pub const COMMAND_OFF: &str = "OFF";
pub const COMMAND_LEVEL: &str = "LEVEL";
/// Remote label of commands that do not belong to a remote group
pub const REMOTE_NONE: &str = "";

/// Reasons a payload could not be decoded
///
/// Never leaves this module; families fold it into an error status.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Payload is not UTF-8")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("Not an integer: {0:?}")]
    Integer(String),

    #[error("Value out of range: {0}")]
    OutOfRange(i64),
}

/// Construction options that come from configuration rather than payloads
#[derive(Debug, Clone, Default)]
pub struct DeviceOptions {
    /// Ids of on/off devices that drive a light instead of a generic switch
    pub lights: HashSet<String>,
}

/// Device family, one per kind of physical appliance
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Family {
    /// Plain relay reporting an integer
    OnOffSwitch { device_type: DeviceType },
    /// Dimmer whose subtype decides between level and on/off semantics
    LevelLight { subtype: Option<i64> },
    /// IR/RF blaster driven by emit, remotes and shortcuts sub-topics
    StatelessRemote,
    /// Remote that also reports a polled status and can be asked for it
    StatelessRemoteWithPoll,
}

type Constructor = fn(&str, &str, &DeviceOptions) -> Device;

// Type segment of the topic -> family constructor
const FAMILIES: &[(&str, Constructor)] = &[
    ("s20", switch::build),
    ("primelan", light::build),
    ("rm", remote::build),
    ("upnpirta2", remote::build_with_poll),
];

/// True when `type_name` names a known family
pub fn is_known_type(type_name: &str) -> bool {
    let type_name = type_name.to_ascii_lowercase();
    FAMILIES.iter().any(|(name, _)| *name == type_name)
}

#[derive(Debug, Clone)]
pub struct Device {
    name: String,
    type_name: String,
    family: Family,
    state: StatusWord,
    commands: Vec<Command>,
    remotes: Vec<String>,
    state_request: Option<Command>,
    updated_at: Option<DateTime<Local>>,
}

impl Device {
    /// Builds the device for a `{type}` segment, `None` for unknown types
    pub fn build(type_name: &str, name: &str, options: &DeviceOptions) -> Option<Self> {
        let type_name = type_name.to_ascii_lowercase();
        let constructor = FAMILIES
            .iter()
            .find(|(family, _)| *family == type_name)
            .map(|(_, constructor)| *constructor)?;
        debug!("Building {} device {}", type_name, name);
        Some(constructor(&type_name, name, options))
    }

    fn new(type_name: &str, name: &str, family: Family, state: StatusWord) -> Self {
        Self {
            name: name.to_string(),
            type_name: type_name.to_string(),
            family,
            state,
            commands: Vec::new(),
            remotes: Vec::new(),
            state_request: None,
            updated_at: None,
        }
    }

    /// Folds one bus message into the device
    ///
    /// The topic may carry a sub-topic below the device (`.../emit`); which
    /// sub-topics matter is up to the family.
    pub fn parse_state(&mut self, topic: &str, payload: &[u8]) {
        let sub_topic = DeviceTopic::parse(topic).and_then(|t| t.sub_topic);
        let sub_topic = sub_topic.as_deref();

        match self.family {
            Family::OnOffSwitch { device_type } => switch::parse(self, device_type, payload),
            Family::LevelLight { .. } => light::parse(self, payload),
            Family::StatelessRemote => remote::parse(self, sub_topic, payload),
            Family::StatelessRemoteWithPoll => remote::parse_with_poll(self, sub_topic, payload),
        }
        self.updated_at = Some(Local::now());
        debug!("Device {} now at {}", self.id(), self.state);
    }

    pub fn id(&self) -> String {
        format!("{}/{}", self.type_name, self.name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn family(&self) -> &Family {
        &self.family
    }

    pub fn state(&self) -> StatusWord {
        self.state
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Distinct remote labels, in command order
    pub fn remotes(&self) -> &[String] {
        &self.remotes
    }

    pub fn state_request(&self) -> Option<&Command> {
        self.state_request.as_ref()
    }

    pub fn updated_at(&self) -> Option<DateTime<Local>> {
        self.updated_at
    }

    pub fn command(&self, command_id: &str) -> Option<&Command> {
        self.commands.iter().find(|c| c.id() == command_id)
    }

    pub fn command_named(&self, name: &str) -> Option<&Command> {
        self.commands.iter().find(|c| c.name() == name)
    }

    pub fn status_text(&self, display: LevelDisplay) -> String {
        status_text(self.state, display)
    }

    fn refresh_remotes(&mut self) {
        let mut remotes: Vec<String> = Vec::new();
        for command in &self.commands {
            if !remotes.iter().any(|r| r == command.remote()) {
                remotes.push(command.remote().to_string());
            }
        }
        self.remotes = remotes;
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}, {} commands)",
            self.id(),
            self.status_text(LevelDisplay::Raw),
            self.commands.len()
        )
    }
}
