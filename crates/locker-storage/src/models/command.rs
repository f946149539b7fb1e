use chrono::{DateTime, Utc};
use locker_core::constants::DEFAULT_MAX_RETRIES;
use locker_core::{CommandStatus, CommandType, KioskId, LockerId, OpenPurpose, Owner};
use serde::{Deserialize, Serialize};

use crate::error::StorageResult;

/// One row of the hardware command queue.
///
/// Rows are only ever transitioned; the table doubles as the audit trail of
/// every hardware operation a kiosk performed.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Command {
    pub command_id: String,

    #[sqlx(try_from = "String")]
    pub kiosk_id: KioskId,

    #[sqlx(try_from = "String")]
    pub command_type: CommandType,

    /// JSON body; see [`Command::payload`].
    pub payload: String,

    #[sqlx(try_from = "String")]
    pub status: CommandStatus,

    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,

    /// Earliest time the dispatcher may pick the command up again.
    pub next_attempt_at: Option<DateTime<Utc>>,

    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,

    /// `"<error_kind>: <detail>"` for failed commands.
    pub error_message: Option<String>,

    /// JSON outcome, per item for bulk commands.
    pub result: Option<String>,
}

impl Command {
    /// Decode the payload according to the command type.
    pub fn payload(&self) -> StorageResult<CommandPayload> {
        CommandPayload::from_json(self.command_type, &self.payload)
    }

    pub fn retries_left(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenLockerPayload {
    pub locker_id: LockerId,

    #[serde(default)]
    pub purpose: OpenPurpose,

    /// Owner the locker is held for, when the open follows an assignment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<Owner>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkOpenPayload {
    pub locker_ids: Vec<LockerId>,
    pub interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseRelayPayload {
    pub locker_id: LockerId,
}

/// Typed command body. The variant always agrees with the stored
/// `command_type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandPayload {
    OpenLocker(OpenLockerPayload),
    BulkOpen(BulkOpenPayload),
    CloseRelay(CloseRelayPayload),
}

impl CommandPayload {
    pub fn open(locker_id: LockerId, purpose: OpenPurpose, owner: Option<Owner>) -> Self {
        Self::OpenLocker(OpenLockerPayload {
            locker_id,
            purpose,
            owner,
        })
    }

    pub fn bulk_open(locker_ids: Vec<LockerId>, interval_ms: u64) -> Self {
        Self::BulkOpen(BulkOpenPayload {
            locker_ids,
            interval_ms,
        })
    }

    pub fn close_relay(locker_id: LockerId) -> Self {
        Self::CloseRelay(CloseRelayPayload { locker_id })
    }

    pub fn command_type(&self) -> CommandType {
        match self {
            Self::OpenLocker(_) => CommandType::OpenLocker,
            Self::BulkOpen(_) => CommandType::BulkOpen,
            Self::CloseRelay(_) => CommandType::CloseRelay,
        }
    }

    pub fn to_json(&self) -> StorageResult<String> {
        let json = match self {
            Self::OpenLocker(body) => serde_json::to_string(body)?,
            Self::BulkOpen(body) => serde_json::to_string(body)?,
            Self::CloseRelay(body) => serde_json::to_string(body)?,
        };
        Ok(json)
    }

    pub fn from_json(command_type: CommandType, json: &str) -> StorageResult<Self> {
        let payload = match command_type {
            CommandType::OpenLocker => Self::OpenLocker(serde_json::from_str(json)?),
            CommandType::BulkOpen => Self::BulkOpen(serde_json::from_str(json)?),
            CommandType::CloseRelay => Self::CloseRelay(serde_json::from_str(json)?),
        };
        Ok(payload)
    }
}

/// A command to be enqueued.
///
/// # Examples
///
/// ```
/// use locker_core::{KioskId, LockerId, OpenPurpose};
/// use locker_storage::models::{CommandPayload, NewCommand};
///
/// let command = NewCommand::new(
///     KioskId::new("lobby").unwrap(),
///     CommandPayload::open(LockerId::new(4).unwrap(), OpenPurpose::Release, None),
/// )
/// .with_id("req-42");
///
/// assert_eq!(command.command_id.as_deref(), Some("req-42"));
/// assert_eq!(command.max_retries, 3);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCommand {
    /// Caller-supplied id for idempotent delivery; generated when absent.
    pub command_id: Option<String>,
    pub kiosk_id: KioskId,
    pub payload: CommandPayload,
    pub max_retries: u32,
}

impl NewCommand {
    pub fn new(kiosk_id: KioskId, payload: CommandPayload) -> Self {
        Self {
            command_id: None,
            kiosk_id,
            payload,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_id(mut self, command_id: impl Into<String>) -> Self {
        self.command_id = Some(command_id.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use locker_core::OwnerType;

    fn locker(id: u16) -> LockerId {
        LockerId::new(id).unwrap()
    }

    #[test]
    fn test_open_payload_json_shape() {
        let payload = CommandPayload::open(locker(7), OpenPurpose::Release, None);
        assert_eq!(
            payload.to_json().unwrap(),
            r#"{"locker_id":7,"purpose":"release"}"#
        );
    }

    #[test]
    fn test_open_payload_defaults_to_release() {
        let payload = CommandPayload::from_json(CommandType::OpenLocker, r#"{"locker_id":3}"#)
            .unwrap();
        assert_eq!(
            payload,
            CommandPayload::open(locker(3), OpenPurpose::Release, None)
        );
    }

    #[test]
    fn test_assign_payload_keeps_owner() {
        let owner = Owner::new(OwnerType::Rfid, "04ABCDEF");
        let payload = CommandPayload::open(locker(9), OpenPurpose::Assign, Some(owner.clone()));
        let json = payload.to_json().unwrap();
        let back = CommandPayload::from_json(CommandType::OpenLocker, &json).unwrap();
        assert_eq!(back, payload);
        assert!(json.contains(r#""owner_type":"rfid""#));
    }

    #[test]
    fn test_payload_rejects_invalid_locker() {
        assert!(CommandPayload::from_json(CommandType::CloseRelay, r#"{"locker_id":0}"#).is_err());
        assert!(
            CommandPayload::from_json(CommandType::BulkOpen, r#"{"locker_ids":[1,2]}"#).is_err()
        );
    }

    #[test]
    fn test_command_type_follows_variant() {
        assert_eq!(
            CommandPayload::bulk_open(vec![locker(1)], 500).command_type(),
            CommandType::BulkOpen
        );
        assert_eq!(
            CommandPayload::close_relay(locker(1)).command_type(),
            CommandType::CloseRelay
        );
    }
}
