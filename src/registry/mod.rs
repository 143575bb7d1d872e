//! Device registry and topic router
//!
//! Single owner of every [`Device`] the bridge has seen. Inbound messages are
//! routed here by topic; everything else gets cloned snapshots, never live
//! references.
//!
//! ```text
//! stat/... ──► identify ──► known id? ──yes──► Device::parse_state
//!                               │
//!                               no ──► Device::build ──► insert
//!                                          │
//!                                   (unknown type: drop)
//!
//! resulting snapshot ──► broadcast ──► DeviceSubscription(s)
//! ```
//!
//! One coarse `RwLock` guards the map. Writes are short (a single parse), and
//! readers never see a device between its status and command updates.

pub mod topic;

use crate::command::{device_id_of_command, Command};
use crate::device::{Device, DeviceOptions};
use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

pub use topic::{identify, DeviceTopic, STATUS_FILTER};

const UPDATE_CAPACITY: usize = 256;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Malformed command id: {0}")]
    InvalidCommandId(String),

    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),
}

pub struct Registry {
    devices: RwLock<HashMap<String, Device>>,
    options: DeviceOptions,
    updates: broadcast::Sender<Device>,
}

impl Registry {
    pub fn new(options: DeviceOptions) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);
        Self {
            devices: RwLock::new(HashMap::new()),
            options,
            updates,
        }
    }

    /// Routes one bus message to its device, creating the device on first sight
    ///
    /// Returns the updated snapshot, which is also pushed to every
    /// subscriber. Messages for topics that don't address a device, or for
    /// device types without a family, yield `None`.
    pub async fn route(&self, topic: &str, payload: &[u8]) -> Option<Device> {
        let Some(device_topic) = DeviceTopic::parse(topic) else {
            debug!("Ignoring message on non-device topic {}", topic);
            return None;
        };
        let device_id = device_topic.device_id();

        let snapshot = {
            let mut devices = self.devices.write().await;
            match devices.get_mut(&device_id) {
                Some(device) => {
                    device.parse_state(topic, payload);
                    debug!("New state for device {}: {}", device_id, device);
                    device.clone()
                }
                None => {
                    let Some(mut device) =
                        Device::build(&device_topic.type_name, &device_topic.name, &self.options)
                    else {
                        debug!(
                            "Dropping message for unmodelled device type {}",
                            device_topic.type_name
                        );
                        return None;
                    };
                    device.parse_state(topic, payload);
                    info!("New device: {}", device);
                    devices.insert(device_id, device.clone());
                    device
                }
            }
        };

        // Nobody listening is fine
        let _ = self.updates.send(snapshot.clone());
        Some(snapshot)
    }

    pub async fn device(&self, device_id: &str) -> Option<Device> {
        self.devices.read().await.get(device_id).cloned()
    }

    pub async fn devices(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.devices.read().await.values().cloned().collect();
        devices.sort_by_key(Device::id);
        devices
    }

    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }

    /// Owning device of a command id, e.g. `s20/lamp/ON` -> `s20/lamp`
    pub async fn device_for_command(&self, command_id: &str) -> Result<Device, RegistryError> {
        let device_id = device_id_of_command(command_id)
            .ok_or_else(|| RegistryError::InvalidCommandId(command_id.to_string()))?;
        self.device(device_id)
            .await
            .ok_or_else(|| RegistryError::UnknownDevice(device_id.to_string()))
    }

    /// Looks a command up by id, including a device's state request command
    pub async fn command(&self, command_id: &str) -> Result<Command, RegistryError> {
        let device = self.device_for_command(command_id).await?;
        device
            .command(command_id)
            .or_else(|| device.state_request().filter(|c| c.id() == command_id))
            .cloned()
            .ok_or_else(|| RegistryError::UnknownCommand(command_id.to_string()))
    }

    /// Live stream of every routed snapshot
    pub fn updates(&self) -> broadcast::Receiver<Device> {
        self.updates.subscribe()
    }

    /// Replayable subscription for a set of device ids
    ///
    /// The subscriber first gets the last known snapshot of every requested
    /// device that exists, then live updates. An empty id set means every
    /// device. Updates racing the replay can show up twice; consumers that
    /// care compare snapshots.
    pub async fn subscribe<I>(&self, ids: I) -> DeviceSubscription
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let ids: HashSet<String> = ids.into_iter().map(Into::into).collect();
        // Subscribe before reading so nothing falls between replay and live
        let live = self.updates.subscribe();
        let replay = self
            .devices()
            .await
            .into_iter()
            .filter(|d| ids.is_empty() || ids.contains(&d.id()))
            .collect();

        DeviceSubscription { ids, replay, live }
    }
}

pub struct DeviceSubscription {
    ids: HashSet<String>,
    replay: VecDeque<Device>,
    live: broadcast::Receiver<Device>,
}

impl DeviceSubscription {
    /// Next snapshot, `None` once the registry is gone
    pub async fn next(&mut self) -> Option<Device> {
        if let Some(device) = self.replay.pop_front() {
            return Some(device);
        }

        loop {
            match self.live.recv().await {
                Ok(device) if self.ids.is_empty() || self.ids.contains(&device.id()) => {
                    return Some(device)
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Device subscription lagged, skipped {} updates", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
