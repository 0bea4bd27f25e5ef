use thiserror::Error;
use uuid::Uuid;

use crate::types::{DeviceId, OperationKind};

pub type FleetResult<T> = Result<T, FleetError>;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("publish failed: {0}")]
    Publish(String),

    #[error("failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("transport disconnected")]
    Disconnected,
}

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("{0} is already running")]
    AlreadyRunning(OperationKind),

    #[error("operation cancelled")]
    Cancelled,

    #[error("unknown device: {0}")]
    UnknownDevice(String),

    #[error("device {device} is not eligible: {reason}")]
    NotEligible { device: DeviceId, reason: String },

    #[error("device {device} already has an outstanding {kind} request")]
    AlreadyRequested { device: DeviceId, kind: OperationKind },

    #[error("capture request not found: {0}")]
    RequestNotFound(Uuid),

    #[error("capture set not found: {0}")]
    SetNotFound(Uuid),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("invalid clock-sync beacon: {0}")]
    InvalidBeacon(String),

    #[error("response router closed the delivery channel")]
    RouterClosed,

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
