//! Stateless remotes (IR/RF blasters)
//!
//! One device, several sub-topics:
//!
//! | sub-topic   | payload                         | effect                              |
//! |-------------|---------------------------------|-------------------------------------|
//! | `emit`      | `[{"status": int}, ...]`        | status OK or error offset + code    |
//! | `remotes`   | `{"<remote>": ["<key>", ...]}`  | replaces every non-shortcut command |
//! | `shortcuts` | `["<key>", ...]`                | replaces every shortcut command     |
//! | `upnp`      | `<int>` (polled variant only)   | overrides status                    |
//!
//! A payload that does not decode marks the device invalid and leaves the
//! command list as it was.

use super::status::{
    StatusWord, STATUS_ERROR_OFFSET, STATUS_INVALID, STATUS_OK, STATUS_UNDETECTED,
};
use super::{DecodeError, Device, DeviceOptions, DeviceType, Family, StateType, REMOTE_NONE};
use crate::command::{Command, SHORTCUT_REMOTE};
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::{debug, warn};

pub const SUB_TOPIC_EMIT: &str = "emit";
pub const SUB_TOPIC_REMOTES: &str = "remotes";
pub const SUB_TOPIC_SHORTCUTS: &str = "shortcuts";
pub const SUB_TOPIC_UPNP: &str = "upnp";

/// Name of the command that asks a polled remote for its status
pub const COMMAND_GET_STATE: &str = "GETSTATE";
/// State string carried by that command
pub const GET_STATE_ACTION: &str = "get";

#[derive(Deserialize)]
struct EmitReport {
    status: i64,
}

pub(super) fn build(type_name: &str, name: &str, _options: &DeviceOptions) -> Device {
    Device::new(type_name, name, Family::StatelessRemote, undetected())
}

pub(super) fn build_with_poll(type_name: &str, name: &str, _options: &DeviceOptions) -> Device {
    let mut device = Device::new(type_name, name, Family::StatelessRemoteWithPoll, undetected());
    device.state_request = Some(Command::state(
        REMOTE_NONE,
        COMMAND_GET_STATE,
        device.id(),
        GET_STATE_ACTION,
    ));
    device
}

fn undetected() -> StatusWord {
    StatusWord::new(StateType::Stateless, DeviceType::Remote, STATUS_UNDETECTED)
}

fn stateless(status: u16) -> StatusWord {
    StatusWord::new(StateType::Stateless, DeviceType::Remote, status)
}

pub(super) fn parse(device: &mut Device, sub_topic: Option<&str>, payload: &[u8]) {
    let result = match sub_topic {
        Some(SUB_TOPIC_EMIT) => parse_emit(device, payload),
        Some(SUB_TOPIC_REMOTES) => parse_remotes(device, payload),
        Some(SUB_TOPIC_SHORTCUTS) => parse_shortcuts(device, payload),
        other => {
            debug!("Ignoring sub-topic {:?} for {}", other, device.id());
            Ok(())
        }
    };

    if let Err(e) = result {
        warn!("Undecodable {:?} payload for {}: {}", sub_topic, device.id(), e);
        device.state = stateless(STATUS_INVALID);
    }
}

pub(super) fn parse_with_poll(device: &mut Device, sub_topic: Option<&str>, payload: &[u8]) {
    if sub_topic != Some(SUB_TOPIC_UPNP) {
        parse(device, sub_topic, payload);
        return;
    }

    let reading = std::str::from_utf8(payload)
        .ok()
        .and_then(|text| text.trim().parse::<i64>().ok());
    device.state = match reading {
        Some(1) => stateless(STATUS_OK),
        Some(code) if code >= 0 => match error_status(code) {
            Ok(status) => stateless(status),
            Err(_) => stateless(STATUS_INVALID),
        },
        _ => undetected(),
    };
}

fn error_status(code: i64) -> Result<u16, DecodeError> {
    u16::try_from(code)
        .ok()
        .and_then(|code| STATUS_ERROR_OFFSET.checked_add(code))
        .ok_or(DecodeError::OutOfRange(code))
}

fn parse_emit(device: &mut Device, payload: &[u8]) -> Result<(), DecodeError> {
    let reports: Vec<EmitReport> = serde_json::from_slice(payload)?;
    let status = match reports.iter().find(|r| r.status != 1) {
        Some(failed) => error_status(failed.status)?,
        None => STATUS_OK,
    };
    device.state = stateless(status);
    Ok(())
}

fn parse_remotes(device: &mut Device, payload: &[u8]) -> Result<(), DecodeError> {
    let groups: BTreeMap<String, Vec<String>> = serde_json::from_slice(payload)?;
    let device_id = device.id();
    let fresh = groups.into_iter().flat_map(|(remote, keys)| {
        let device_id = device_id.clone();
        keys.into_iter()
            .map(move |key| Command::emit(remote.clone(), key, device_id.clone()))
    });

    device.commands.retain(Command::is_shortcut);
    device.commands.extend(fresh);
    device.refresh_remotes();
    Ok(())
}

fn parse_shortcuts(device: &mut Device, payload: &[u8]) -> Result<(), DecodeError> {
    let keys: Vec<String> = serde_json::from_slice(payload)?;
    let device_id = device.id();

    device.commands.retain(|c| !c.is_shortcut());
    device.commands.extend(
        keys.into_iter()
            .map(|key| Command::emit(SHORTCUT_REMOTE, key, device_id.clone())),
    );
    device.refresh_remotes();
    Ok(())
}
