use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::FleetError;

pub const GRID_COLUMNS: &str = "ABCDEFGHIJKLMNOP";
pub const GRID_ROWS: u8 = 6;
pub const INDICATOR_ID: &str = "IND";

/// Identifier of one camera grid cell ("A1".."P6") or the indicator unit ("IND").
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId(String);

impl DeviceId {
    pub fn parse(raw: &str) -> Result<Self, FleetError> {
        let raw = raw.trim();
        if raw == INDICATOR_ID {
            return Ok(Self(raw.to_string()));
        }

        // rows are single digits, so "A01" or "A+1" never name a cell
        let mut chars = raw.chars();
        let row = match (chars.next(), chars.next(), chars.next()) {
            (Some(column), Some(row), None) if GRID_COLUMNS.contains(column) => row.to_digit(10),
            _ => None,
        };
        match row {
            Some(r) if (1..=u32::from(GRID_ROWS)).contains(&r) => Ok(Self(raw.to_string())),
            _ => Err(FleetError::UnknownDevice(raw.to_string())),
        }
    }

    pub fn indicator() -> Self {
        Self(INDICATOR_ID.to_string())
    }

    pub fn is_indicator(&self) -> bool {
        self.0 == INDICATOR_ID
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// All 96 camera cells in column-major order, A1..A6, B1..B6, ..., P6.
    pub fn grid() -> impl Iterator<Item = DeviceId> {
        GRID_COLUMNS
            .chars()
            .flat_map(|c| (1..=GRID_ROWS).map(move |r| DeviceId(format!("{}{}", c, r))))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DeviceId {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for DeviceId {
    type Error = FleetError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.0
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DeviceStatus {
    pub firmware_version: String,
    pub mode: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    Ping,
    TimeSync,
    Update,
    Capture,
    PictureSend,
    SetSend,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Ping => "ping",
            OperationKind::TimeSync => "time-sync",
            OperationKind::Update => "update",
            OperationKind::Capture => "capture",
            OperationKind::PictureSend => "picture-send",
            OperationKind::SetSend => "set-send",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-device state of one operation kind.
///
/// Moves `NotStarted -> Requested -> terminal` and only goes back to
/// `NotStarted` when a new run of the same kind resets it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "state", content = "detail", rename_all = "kebab-case")]
pub enum RequestState<T, E = String> {
    NotStarted,
    Requested,
    FailedToRequest(String),
    Succeeded(T),
    Failed(E),
    Cancelled,
    Unknown(String),
}

impl<T, E> Default for RequestState<T, E> {
    fn default() -> Self {
        RequestState::NotStarted
    }
}

impl<T, E> RequestState<T, E> {
    pub fn is_terminal(&self) -> bool {
        match self {
            RequestState::NotStarted | RequestState::Requested => false,
            RequestState::FailedToRequest(_)
            | RequestState::Succeeded(_)
            | RequestState::Failed(_)
            | RequestState::Cancelled
            | RequestState::Unknown(_) => true,
        }
    }

    pub fn is_requested(&self) -> bool {
        matches!(self, RequestState::Requested)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TimeSyncResult {
    pub timestamp_ms: f64,
    pub offset_ms: f64,
    pub error_ms: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", content = "reason", rename_all = "kebab-case")]
pub enum TimeSyncFailure {
    Reported(String),
    /// The device answered but its text did not match the expected layout.
    FailedToParse(String),
    Aborted(String),
}

impl TimeSyncFailure {
    pub fn reason(&self) -> &str {
        match self {
            TimeSyncFailure::Reported(reason)
            | TimeSyncFailure::FailedToParse(reason)
            | TimeSyncFailure::Aborted(reason) => reason,
        }
    }
}

impl From<String> for TimeSyncFailure {
    fn from(reason: String) -> Self {
        TimeSyncFailure::Aborted(reason)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PictureStatus {
    Requested,
    Taken,
    FailedToTake,
    SavedOnDevice,
    FailedToSave,
    CaptureCancelled,
    RequestedSend,
    FailedToRequestSend,
    FailedToSend,
    SendCancelled,
    Success,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PictureEvent {
    Taken,
    TakeFailed,
    Saved,
    SaveFailed,
    TakeCancelled,
    SaveCancelled,
    SendRequested,
    SendPublishFailed,
    Sent,
    SendFailed,
    SendCancelled,
}

impl PictureStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PictureStatus::Requested => "requested",
            PictureStatus::Taken => "taken",
            PictureStatus::FailedToTake => "failed_to_take",
            PictureStatus::SavedOnDevice => "saved_on_device",
            PictureStatus::FailedToSave => "failed_to_save",
            PictureStatus::CaptureCancelled => "capture_cancelled",
            PictureStatus::RequestedSend => "requested_send",
            PictureStatus::FailedToRequestSend => "failed_to_request_send",
            PictureStatus::FailedToSend => "failed_to_send",
            PictureStatus::SendCancelled => "send_cancelled",
            PictureStatus::Success => "success",
        }
    }

    pub fn is_sendable(&self) -> bool {
        matches!(
            self,
            PictureStatus::SavedOnDevice
                | PictureStatus::RequestedSend
                | PictureStatus::FailedToRequestSend
                | PictureStatus::FailedToSend
                | PictureStatus::SendCancelled
        )
    }

    /// Returns the next status, or `None` when the event does not apply.
    pub fn apply(self, event: PictureEvent) -> Option<PictureStatus> {
        use PictureStatus as S;
        match (self, event) {
            (S::Requested, PictureEvent::Taken) => Some(S::Taken),
            (S::Requested, PictureEvent::TakeFailed) => Some(S::FailedToTake),
            (S::Requested | S::Taken, PictureEvent::Saved) => Some(S::SavedOnDevice),
            (S::Requested | S::Taken, PictureEvent::SaveFailed) => Some(S::FailedToSave),
            (S::Requested, PictureEvent::TakeCancelled) => Some(S::CaptureCancelled),
            (S::Requested | S::Taken, PictureEvent::SaveCancelled) => Some(S::CaptureCancelled),
            (s, PictureEvent::SendRequested) if s.is_sendable() => Some(S::RequestedSend),
            (S::RequestedSend, PictureEvent::SendPublishFailed) => Some(S::FailedToRequestSend),
            (S::RequestedSend | S::SendCancelled, PictureEvent::Sent) => Some(S::Success),
            (S::RequestedSend, PictureEvent::SendFailed) => Some(S::FailedToSend),
            (S::RequestedSend, PictureEvent::SendCancelled) => Some(S::SendCancelled),
            _ => None,
        }
    }
}

impl fmt::Display for PictureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PictureStatus {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let status = match s {
            "requested" => PictureStatus::Requested,
            "taken" => PictureStatus::Taken,
            "failed_to_take" => PictureStatus::FailedToTake,
            "saved_on_device" => PictureStatus::SavedOnDevice,
            "failed_to_save" => PictureStatus::FailedToSave,
            "capture_cancelled" => PictureStatus::CaptureCancelled,
            "requested_send" => PictureStatus::RequestedSend,
            "failed_to_request_send" => PictureStatus::FailedToRequestSend,
            "failed_to_send" => PictureStatus::FailedToSend,
            "send_cancelled" => PictureStatus::SendCancelled,
            "success" => PictureStatus::Success,
            other => {
                return Err(FleetError::InvalidMessage(format!(
                    "unknown picture status '{}'",
                    other
                )))
            }
        };
        Ok(status)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct CaptureMetadata {
    pub exposure_us: Option<i64>,
    pub gain: Option<f64>,
    pub sensor_timestamp_us: Option<i64>,
    pub taken_at: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CapturePicture {
    pub request_id: Uuid,
    pub device_id: DeviceId,
    pub status: PictureStatus,
    pub detail: Option<String>,
    pub metadata: CaptureMetadata,
}

impl CapturePicture {
    pub fn requested(request_id: Uuid, device_id: DeviceId) -> Self {
        Self {
            request_id,
            device_id,
            status: PictureStatus::Requested,
            detail: None,
            metadata: CaptureMetadata::default(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CaptureRequest {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub capture_at: DateTime<Utc>,
    pub capture_type: String,
    pub active: bool,
    pub set_id: Option<Uuid>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CaptureSet {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub completed: bool,
}
