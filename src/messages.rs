//! JSON envelopes and the topic scheme.
//!
//! Requests go to `cmd/<op>` (broadcast) or `cmd/<op>/<device>` (targeted).
//! Replies come back on `reply/<op>/<device>`. `cmd/cancel` with an empty
//! payload tells every device to drop in-progress work.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{FleetError, FleetResult};
use crate::types::{CaptureMetadata, DeviceId, DeviceStatus};

pub const COMMAND_PREFIX: &str = "cmd";
pub const REPLY_PREFIX: &str = "reply";
pub const CANCEL_TOPIC: &str = "cmd/cancel";
pub const REPLY_FILTER: &str = "reply/#";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Command {
    GetStatus,
    GetSyncStatus,
    Update {
        version: String,
        url: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        checksum: Option<String>,
    },
    TakePicture {
        request_id: Uuid,
        capture_at_us: u64,
    },
    SendPicture {
        request_id: Uuid,
        destination: String,
    },
}

impl Command {
    pub fn op(&self) -> &'static str {
        match self {
            Command::GetStatus => "status",
            Command::GetSyncStatus => "sync-status",
            Command::Update { .. } => "update",
            Command::TakePicture { .. } => "take-picture",
            Command::SendPicture { .. } => "send-picture",
        }
    }

    pub fn topic_for(&self, device: &DeviceId) -> String {
        format!("{}/{}/{}", COMMAND_PREFIX, self.op(), device)
    }

    pub fn broadcast_topic(&self) -> String {
        format!("{}/{}", COMMAND_PREFIX, self.op())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ReplyEnvelope {
    pub success: bool,
    pub value: ReplyValue,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ReplyValue {
    Status(DeviceStatus),
    SyncStatus {
        output: String,
    },
    Update {
        version: String,
    },
    Taken {
        request_id: Uuid,
        #[serde(default)]
        metadata: CaptureMetadata,
    },
    Saved {
        request_id: Uuid,
        #[serde(default)]
        file_name: Option<String>,
    },
    PictureSent {
        request_id: Uuid,
    },
    Error {
        #[serde(default)]
        request_id: Option<Uuid>,
        reason: String,
    },
}

impl ReplyValue {
    pub fn request_id(&self) -> Option<Uuid> {
        match self {
            ReplyValue::Taken { request_id, .. }
            | ReplyValue::Saved { request_id, .. }
            | ReplyValue::PictureSent { request_id } => Some(*request_id),
            ReplyValue::Error { request_id, .. } => *request_id,
            ReplyValue::Status(_) | ReplyValue::SyncStatus { .. } | ReplyValue::Update { .. } => {
                None
            }
        }
    }
}

/// Which operation a reply topic belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplyKind {
    Status,
    SyncStatus,
    Update,
    Taken,
    Saved,
    PictureSent,
}

impl ReplyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplyKind::Status => "status",
            ReplyKind::SyncStatus => "sync-status",
            ReplyKind::Update => "update",
            ReplyKind::Taken => "taken",
            ReplyKind::Saved => "saved",
            ReplyKind::PictureSent => "picture-sent",
        }
    }

    fn from_op(op: &str) -> Option<Self> {
        match op {
            "status" => Some(ReplyKind::Status),
            "sync-status" => Some(ReplyKind::SyncStatus),
            "update" => Some(ReplyKind::Update),
            "taken" => Some(ReplyKind::Taken),
            "saved" => Some(ReplyKind::Saved),
            "picture-sent" => Some(ReplyKind::PictureSent),
            _ => None,
        }
    }

    pub fn topic_for(&self, device: &DeviceId) -> String {
        format!("{}/{}/{}", REPLY_PREFIX, self.as_str(), device)
    }
}

impl fmt::Display for ReplyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse `reply/<op>/<device>`.
pub fn parse_reply_topic(topic: &str) -> FleetResult<(ReplyKind, DeviceId)> {
    let parts: Vec<&str> = topic.split('/').collect();
    match parts.as_slice() {
        [REPLY_PREFIX, op, device] => {
            let kind = ReplyKind::from_op(op).ok_or_else(|| {
                FleetError::InvalidMessage(format!("unknown reply operation '{}'", op))
            })?;
            let device = DeviceId::parse(device)?;
            Ok((kind, device))
        }
        _ => Err(FleetError::InvalidMessage(format!(
            "invalid reply topic '{}': expected 'reply/{{op}}/{{device}}'",
            topic
        ))),
    }
}

pub fn encode_reply(envelope: &ReplyEnvelope) -> FleetResult<Vec<u8>> {
    Ok(serde_json::to_vec(envelope)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reply_topic() {
        let (kind, device) = parse_reply_topic("reply/sync-status/C4").unwrap();
        assert_eq!(kind, ReplyKind::SyncStatus);
        assert_eq!(device.as_str(), "C4");
    }

    #[test]
    fn test_parse_reply_topic_rejects_garbage() {
        assert!(parse_reply_topic("reply/sync-status").is_err());
        assert!(parse_reply_topic("cmd/status/A1").is_err());
        assert!(parse_reply_topic("reply/reboot/A1").is_err());
        assert!(parse_reply_topic("reply/status/Z9").is_err());
        assert!(parse_reply_topic("").is_err());
    }

    #[test]
    fn test_command_topics_and_discriminator() {
        let a1 = DeviceId::parse("A1").unwrap();
        assert_eq!(Command::GetSyncStatus.topic_for(&a1), "cmd/sync-status/A1");

        let take = Command::TakePicture {
            request_id: Uuid::nil(),
            capture_at_us: 42,
        };
        assert_eq!(take.broadcast_topic(), "cmd/take-picture");

        let json = serde_json::to_value(&take).unwrap();
        assert_eq!(json["type"], "take-picture");
        assert_eq!(json["capture_at_us"], 42);
    }

    #[test]
    fn test_decode_reply_envelope() {
        let raw = r#"{"success": false, "value": {"type": "error", "reason": "disk full",
            "request_id": "00000000-0000-0000-0000-000000000000"}}"#;
        let envelope: ReplyEnvelope = serde_json::from_str(raw).unwrap();
        assert!(!envelope.success);
        assert_eq!(envelope.value.request_id(), Some(Uuid::nil()));

        let raw = r#"{"success": true, "value": {"type": "status",
            "firmware_version": "2.0.1", "mode": "ready"}}"#;
        let envelope: ReplyEnvelope = serde_json::from_str(raw).unwrap();
        assert!(matches!(envelope.value, ReplyValue::Status(ref s) if s.firmware_version == "2.0.1"));
    }
}
