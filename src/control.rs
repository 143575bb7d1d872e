//! Host-facing control views
//!
//! Maps device snapshots to the controls a home dashboard would render and
//! turns control interactions back into concrete [`Command`]s.
//!
//! ```text
//! Device (OnOff)     ──► Toggle control,  id = device id
//! Device (Level)     ──► Range control,   id = device id
//! Device (Stateless) ──► one Stateless control per command, id = command id
//!
//! (control id, ControlAction) ──► resolve_action ──► Command ──► engine.send
//! ```

use crate::command::{Command, CommandError};
use crate::device::status::{STATUS_ON, STATUS_UNDETECTED};
use crate::device::{Device, DeviceType, LevelDisplay, StateType};
use crate::device::{COMMAND_LEVEL, COMMAND_OFF, COMMAND_ON};
use crate::mqtt::engine::ConnectionEngine;
use crate::registry::{Registry, RegistryError};
use thiserror::Error;
use tracing::{info, warn};

const LEVEL_MAX: u16 = 100;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControlError {
    #[error(transparent)]
    Lookup(#[from] RegistryError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("Control {control_id} does not support {action:?}")]
    Unsupported {
        control_id: String,
        action: ControlAction,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlTemplate {
    Toggle { checked: bool },
    Range { value: u8 },
    Stateless,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlView {
    pub id: String,
    pub title: String,
    pub structure: String,
    pub device_type: Option<DeviceType>,
    pub template: ControlTemplate,
    pub status_text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Toggle(bool),
    SetLevel(u8),
    Fire,
}

/// Parses a command line request
///
/// `<device id>=on`, `=off` or `=<level>` act on a device control; anything
/// else fires the command with that id.
pub fn parse_request(request: &str) -> Option<(String, ControlAction)> {
    let Some((target, value)) = request.rsplit_once('=') else {
        return (!request.is_empty()).then(|| (request.to_string(), ControlAction::Fire));
    };
    if target.is_empty() {
        return None;
    }
    let action = match value.trim().to_ascii_lowercase().as_str() {
        "on" => ControlAction::Toggle(true),
        "off" => ControlAction::Toggle(false),
        level => ControlAction::SetLevel(level.parse().ok()?),
    };
    Some((target.to_string(), action))
}

/// Controls exposed by one device snapshot
///
/// Devices whose status word carries no recognizable state type expose
/// nothing.
pub fn controls_for(device: &Device, home: &str) -> Vec<ControlView> {
    let state = device.state();
    let view = |id: String, title: String, template: ControlTemplate, display: LevelDisplay| {
        ControlView {
            id,
            title,
            structure: home.to_string(),
            device_type: state.device_type(),
            template,
            status_text: device.status_text(display),
        }
    };

    match state.state_type() {
        Some(StateType::OnOff) => vec![view(
            device.id(),
            device.name().to_string(),
            ControlTemplate::Toggle {
                checked: state.status() == STATUS_ON,
            },
            LevelDisplay::Toggle,
        )],
        Some(StateType::Level) => {
            let value = match state.status() {
                STATUS_UNDETECTED => 0,
                level if level > LEVEL_MAX => 0,
                level => level as u8,
            };
            vec![view(
                device.id(),
                device.name().to_string(),
                ControlTemplate::Range { value },
                LevelDisplay::Raw,
            )]
        }
        Some(StateType::Stateless) => device
            .commands()
            .iter()
            .map(|command| {
                let title = if command.remote().is_empty() {
                    command.name().to_string()
                } else {
                    format!("{}:{}", command.remote(), command.name())
                };
                view(
                    command.id(),
                    title,
                    ControlTemplate::Stateless,
                    LevelDisplay::Raw,
                )
            })
            .collect(),
        None => Vec::new(),
    }
}

/// Resolves an interaction with a control into the command to publish
///
/// Toggle and level actions address a device; `Fire` addresses a command.
/// The returned command is a detached copy, so filling in a level never
/// touches the registry.
pub async fn resolve_action(
    registry: &Registry,
    control_id: &str,
    action: ControlAction,
) -> Result<Command, ControlError> {
    let unsupported = || ControlError::Unsupported {
        control_id: control_id.to_string(),
        action,
    };

    match action {
        ControlAction::Fire => Ok(registry.command(control_id).await?),
        ControlAction::Toggle(on) => {
            let device = registry
                .device(control_id)
                .await
                .ok_or_else(|| RegistryError::UnknownDevice(control_id.to_string()))?;
            let named = if on { COMMAND_ON } else { COMMAND_OFF };
            if let Some(command) = device.command_named(named) {
                return Ok(command.clone());
            }
            let mut level = device.command_named(COMMAND_LEVEL).cloned().ok_or_else(unsupported)?;
            level.set_state(if on { "1" } else { "0" })?;
            Ok(level)
        }
        ControlAction::SetLevel(value) => {
            let device = registry
                .device(control_id)
                .await
                .ok_or_else(|| RegistryError::UnknownDevice(control_id.to_string()))?;
            if let Some(level) = device.command_named(COMMAND_LEVEL) {
                let mut level = level.clone();
                level.set_state(value.min(LEVEL_MAX as u8).to_string())?;
                return Ok(level);
            }
            let named = if value > 0 { COMMAND_ON } else { COMMAND_OFF };
            device.command_named(named).cloned().ok_or_else(unsupported)
        }
    }
}

/// Sends the command behind a control interaction, `true` when accepted
pub async fn perform(engine: &ConnectionEngine, control_id: &str, action: ControlAction) -> bool {
    let command = match resolve_action(engine.registry(), control_id, action).await {
        Ok(command) => command,
        Err(e) => {
            warn!("Rejected {:?} on {}: {}", action, control_id, e);
            return false;
        }
    };

    match engine.send(&command).await {
        Ok(()) => {
            info!("{:?} on {} sent as {}", action, control_id, command);
            true
        }
        Err(e) => {
            warn!("Sending {} for {} failed: {}", command, control_id, e);
            false
        }
    }
}
