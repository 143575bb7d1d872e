use crate::command::CommandError;
use crate::registry::RegistryError;
use rumqttc::{ClientError, ConnectReturnCode, ConnectionError};
use std::time::Duration;
use thiserror::Error;

/// Why a connection attempt did not end in a live session
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("No broker host/port configured")]
    NotConfigured,

    #[error("MQTT request failed: {0}")]
    Client(#[from] ClientError),

    #[error("MQTT connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Broker refused connection: {0:?}")]
    ConnectRefused(ConnectReturnCode),

    #[error("Broker rejected subscription to {0}")]
    SubscribeRejected(String),

    #[error("No answer from broker within {0:?}")]
    Timeout(Duration),

    #[error("Connection engine shut down")]
    ShutDown,
}

/// Why a command was not delivered
#[derive(Debug, Error)]
pub enum SendError {
    #[error("Nothing to send for command {0}")]
    NothingToSend(String),

    #[error("Command {0} does not carry a state")]
    NotAStateCommand(String),

    #[error("Not connected to a broker")]
    NotConnected,

    #[error("Publish request failed: {0}")]
    Transport(#[from] ClientError),

    #[error("Session closed before {0} was acknowledged")]
    TransportDown(String),

    #[error("No acknowledgement within {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Lookup(#[from] RegistryError),
}

impl From<CommandError> for SendError {
    fn from(e: CommandError) -> Self {
        match e {
            CommandError::NothingToSend(id) => SendError::NothingToSend(id),
            CommandError::NotAStateCommand(id) => SendError::NotAStateCommand(id),
        }
    }
}
