//! On/off relays reporting a bare integer

use super::status::{STATUS_OFF, STATUS_ON, STATUS_UNDETECTED};
use super::{Device, DeviceOptions, DeviceType, Family, StateType, StatusWord};
use super::{COMMAND_OFF, COMMAND_ON, REMOTE_NONE};
use crate::command::Command;

pub(super) fn build(type_name: &str, name: &str, options: &DeviceOptions) -> Device {
    let id = format!("{}/{}", type_name, name);
    // The payload never says what the relay drives, configuration does
    let device_type = if options.lights.contains(&id) {
        DeviceType::Light
    } else {
        DeviceType::Switch
    };

    let mut device = Device::new(
        type_name,
        name,
        Family::OnOffSwitch { device_type },
        StatusWord::undetected(device_type),
    );
    device.commands = vec![
        Command::state(REMOTE_NONE, COMMAND_ON, id.clone(), "1"),
        Command::state(REMOTE_NONE, COMMAND_OFF, id, "0"),
    ];
    device.refresh_remotes();
    device
}

pub(super) fn parse(device: &mut Device, device_type: DeviceType, payload: &[u8]) {
    let reading = std::str::from_utf8(payload)
        .ok()
        .and_then(|text| text.trim().parse::<i64>().ok());

    let status = match reading {
        Some(value) if value < 0 => STATUS_UNDETECTED,
        Some(0) => STATUS_OFF,
        Some(_) => STATUS_ON,
        None => STATUS_UNDETECTED,
    };
    device.state = StatusWord::new(StateType::OnOff, device_type, status);
}
