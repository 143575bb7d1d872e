//! Outbound device commands
//!
//! A [`Command`] is a named action a device accepts. Its outbound payload is
//! computed once when the command is built and again only when the carried
//! state changes, so sending never has to know about device families.

use serde::Serialize;
use std::fmt;
use std::hash::{Hash, Hasher};
use thiserror::Error;

/// Remote label shared by all shortcut commands of a remote
pub const SHORTCUT_REMOTE: &str = "@";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("Nothing to send for command {0}")]
    NothingToSend(String),

    #[error("Command {0} does not carry a state")]
    NotAStateCommand(String),
}

/// Topic and body ready to be published
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub topic: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandKind {
    /// Fire-and-forget action published to `cmnd/<device>/emit`
    Emit,
    /// Carries the state string published to `cmnd/<device>/state`
    State { state: String },
}

// Body of an emit request, field order matters on the wire
#[derive(Serialize)]
struct EmitRequest<'a> {
    key: &'a str,
    remote: &'a str,
}

#[derive(Debug, Clone)]
pub struct Command {
    remote: String,
    name: String,
    device_id: String,
    kind: CommandKind,
    payload: Option<Payload>,
}

impl Command {
    pub fn emit(
        remote: impl Into<String>,
        name: impl Into<String>,
        device_id: impl Into<String>,
    ) -> Self {
        Self::build(remote.into(), name.into(), device_id.into(), CommandKind::Emit)
    }

    pub fn state(
        remote: impl Into<String>,
        name: impl Into<String>,
        device_id: impl Into<String>,
        state: impl Into<String>,
    ) -> Self {
        Self::build(
            remote.into(),
            name.into(),
            device_id.into(),
            CommandKind::State {
                state: state.into(),
            },
        )
    }

    fn build(remote: String, name: String, device_id: String, kind: CommandKind) -> Self {
        let mut command = Self {
            remote,
            name,
            device_id,
            kind,
            payload: None,
        };
        command.payload = command.generate_payload();
        command
    }

    fn generate_payload(&self) -> Option<Payload> {
        match &self.kind {
            CommandKind::Emit => {
                // Shortcuts and plain keys alike go out as the bare name
                let request = [EmitRequest {
                    key: &self.name,
                    remote: &self.remote,
                }];
                let body = serde_json::to_vec(&request).ok()?;
                Some(Payload {
                    topic: format!("cmnd/{}/emit", self.device_id),
                    body,
                })
            }
            CommandKind::State { state } if state.is_empty() => None,
            CommandKind::State { state } => Some(Payload {
                topic: format!("cmnd/{}/state", self.device_id),
                body: state.as_bytes().to_vec(),
            }),
        }
    }

    /// `<device id>/<name>` or `<device id>/<remote>:<name>`
    pub fn id(&self) -> String {
        if self.remote.is_empty() {
            format!("{}/{}", self.device_id, self.name)
        } else {
            format!("{}/{}:{}", self.device_id, self.remote, self.name)
        }
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn kind(&self) -> &CommandKind {
        &self.kind
    }

    pub fn is_shortcut(&self) -> bool {
        self.remote == SHORTCUT_REMOTE
    }

    pub fn payload(&self) -> Option<&Payload> {
        self.payload.as_ref()
    }

    /// Payload to publish, or the reason there is none
    pub fn sendable_payload(&self) -> Result<&Payload, CommandError> {
        self.payload
            .as_ref()
            .ok_or_else(|| CommandError::NothingToSend(self.id()))
    }

    pub fn current_state(&self) -> Option<&str> {
        match &self.kind {
            CommandKind::State { state } => Some(state),
            CommandKind::Emit => None,
        }
    }

    /// Replaces the carried state and regenerates the payload
    pub fn set_state(&mut self, new_state: impl Into<String>) -> Result<(), CommandError> {
        match &mut self.kind {
            CommandKind::State { state } => {
                *state = new_state.into();
            }
            CommandKind::Emit => return Err(CommandError::NotAStateCommand(self.id())),
        }
        self.payload = self.generate_payload();
        Ok(())
    }
}

impl PartialEq for Command {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Command {}

impl Hash for Command {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id())
    }
}

/// Owning device id of a command id: everything before the last `/`
pub fn device_id_of_command(command_id: &str) -> Option<&str> {
    match command_id.rfind('/') {
        Some(idx) if idx > 0 => Some(&command_id[..idx]),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(command: &Command) -> String {
        String::from_utf8(command.payload().unwrap().body.clone()).unwrap()
    }

    #[test]
    fn ids_follow_remote_presence() {
        assert_eq!(Command::state("", "ON", "s20/lamp", "1").id(), "s20/lamp/ON");
        assert_eq!(Command::emit("tv", "power", "rm/den").id(), "rm/den/tv:power");
        assert_eq!(Command::emit("@", "quickon", "rm/den").id(), "rm/den/@:quickon");
    }

    #[test]
    fn same_triple_gives_equal_commands() {
        let a = Command::emit("tv", "mute", "rm/den");
        let b = Command::emit("tv", "mute", "rm/den");
        assert_eq!(a.id(), b.id());
        assert_eq!(a, b);
        assert_ne!(a, Command::emit("tv", "power", "rm/den"));
    }

    #[test]
    fn equality_ignores_kind_and_state() {
        let a = Command::state("", "LEVEL", "primelan/hall", "");
        let b = Command::state("", "LEVEL", "primelan/hall", "40");
        assert_eq!(a, b);
    }

    #[test]
    fn shortcut_key_is_not_prefixed() {
        let shortcut = Command::emit("@", "PWR", "rm/den");
        assert_eq!(body(&shortcut), r#"[{"key":"PWR","remote":"@"}]"#);

        let plain = Command::emit("livingroom", "PWR", "rm/den");
        assert_eq!(body(&plain), r#"[{"key":"PWR","remote":"livingroom"}]"#);
        assert_eq!(plain.payload().unwrap().topic, "cmnd/rm/den/emit");
    }

    #[test]
    fn emit_body_escapes_json() {
        let command = Command::emit("tv", "say \"hi\"", "rm/den");
        assert_eq!(body(&command), r#"[{"key":"say \"hi\"","remote":"tv"}]"#);
    }

    #[test]
    fn state_payload_is_raw_state() {
        let command = Command::state("", "ON", "s20/lamp", "1");
        let payload = command.sendable_payload().unwrap();
        assert_eq!(payload.topic, "cmnd/s20/lamp/state");
        assert_eq!(payload.body, b"1");
    }

    #[test]
    fn empty_state_has_nothing_to_send() {
        let command = Command::state("", "LEVEL", "primelan/hall", "");
        assert!(command.payload().is_none());
        assert_eq!(
            command.sendable_payload(),
            Err(CommandError::NothingToSend("primelan/hall/LEVEL".to_string()))
        );
    }

    #[test]
    fn set_state_regenerates_payload_and_keeps_id() {
        let mut command = Command::state("", "LEVEL", "primelan/hall", "");
        let id = command.id();
        command.set_state("55").unwrap();
        assert_eq!(command.id(), id);
        assert_eq!(command.current_state(), Some("55"));
        assert_eq!(command.sendable_payload().unwrap().body, b"55");

        command.set_state("").unwrap();
        assert!(command.payload().is_none());
    }

    #[test]
    fn emit_commands_reject_state() {
        let mut command = Command::emit("tv", "power", "rm/den");
        assert!(matches!(
            command.set_state("1"),
            Err(CommandError::NotAStateCommand(_))
        ));
    }

    #[test]
    fn device_id_is_recovered_from_command_id() {
        assert_eq!(device_id_of_command("switch/lamp/ON"), Some("switch/lamp"));
        assert_eq!(device_id_of_command("rm/den/tv:power"), Some("rm/den"));
        assert_eq!(device_id_of_command("noslash"), None);
        assert_eq!(device_id_of_command("/leading"), None);
    }
}
