//! Dimmers reporting `{"subtype": int, "state": "<int>"}`
//!
//! The subtype is only known at runtime and can change; the command set is
//! rebuilt whenever it does.

use super::status::{StatusWord, STATUS_DECODE_ERROR, STATUS_OFF, STATUS_ON, STATUS_UNDETECTED};
use super::{DecodeError, Device, DeviceOptions, DeviceType, Family, StateType};
use super::{COMMAND_LEVEL, COMMAND_OFF, COMMAND_ON, REMOTE_NONE};
use crate::command::Command;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

pub const SUBTYPE_ON_OFF_BUTTONS: i64 = 0;
pub const SUBTYPE_LEVEL_SLIDER: i64 = 1;
pub const SUBTYPE_ON_OFF_SLIDER: i64 = 2;

#[derive(Deserialize)]
struct LightReport {
    subtype: i64,
    state: Value,
}

pub(super) fn build(type_name: &str, name: &str, _options: &DeviceOptions) -> Device {
    Device::new(
        type_name,
        name,
        Family::LevelLight { subtype: None },
        StatusWord::new(StateType::OnOff, DeviceType::Light, STATUS_UNDETECTED),
    )
}

pub(super) fn parse(device: &mut Device, payload: &[u8]) {
    if let Err(e) = apply(device, payload) {
        warn!("Undecodable state for {}: {}", device.id(), e);
        device.state = device.state.with_status(STATUS_DECODE_ERROR);
    }
    device.state = device.state.with_device_type(DeviceType::Light);
}

fn apply(device: &mut Device, payload: &[u8]) -> Result<(), DecodeError> {
    let report: LightReport = serde_json::from_slice(payload)?;

    let current = match device.family {
        Family::LevelLight { subtype } => subtype,
        _ => None,
    };
    if current != Some(report.subtype) {
        device.family = Family::LevelLight {
            subtype: Some(report.subtype),
        };
        device.commands = commands_for(&device.id(), report.subtype);
        device.refresh_remotes();
    }

    let value = reading(&report.state)?;
    device.state = if report.subtype == SUBTYPE_LEVEL_SLIDER {
        let level = u16::try_from(value).map_err(|_| DecodeError::OutOfRange(value))?;
        StatusWord::new(StateType::Level, DeviceType::Light, level)
    } else {
        let status = if value != 0 { STATUS_ON } else { STATUS_OFF };
        StatusWord::new(StateType::OnOff, DeviceType::Light, status)
    };
    Ok(())
}

fn commands_for(device_id: &str, subtype: i64) -> Vec<Command> {
    if subtype == SUBTYPE_LEVEL_SLIDER {
        vec![
            Command::state(REMOTE_NONE, COMMAND_ON, device_id, "1"),
            Command::state(REMOTE_NONE, COMMAND_OFF, device_id, "0"),
        ]
    } else {
        // State is filled in by whoever sends it
        vec![Command::state(REMOTE_NONE, COMMAND_LEVEL, device_id, "")]
    }
}

// "42" is what the dimmer sends; a bare number is accepted too
fn reading(state: &Value) -> Result<i64, DecodeError> {
    match state {
        Value::String(text) => text
            .trim()
            .parse()
            .map_err(|_| DecodeError::Integer(text.clone())),
        Value::Number(number) => number
            .as_i64()
            .ok_or_else(|| DecodeError::Integer(number.to_string())),
        other => Err(DecodeError::Integer(other.to_string())),
    }
}
