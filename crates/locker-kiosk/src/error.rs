use locker_core::{ErrorKind, LockerId, LockerStatus};
use locker_hardware::HardwareError;
use locker_storage::StorageError;
use thiserror::Error;

/// Errors surfaced by the kiosk runtime.
#[derive(Debug, Error)]
pub enum KioskError {
    #[error(transparent)]
    Hardware(#[from] HardwareError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The session was never opened, has timed out, or was superseded by a
    /// newer scan.
    #[error("Session expired")]
    SessionExpired,

    #[error("No lockers available")]
    NoLockersAvailable,

    /// The locker is not in a status that allows the requested action.
    #[error("Locker {locker_id} is {status}, cannot {action}")]
    Conflict {
        locker_id: LockerId,
        status: LockerStatus,
        action: &'static str,
    },

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
}

impl KioskError {
    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidParameters(message.into())
    }

    /// Stable classification for UI layers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Hardware(e) => e.kind(),
            Self::Storage(e) => e.kind(),
            Self::SessionExpired => ErrorKind::SessionExpired,
            Self::NoLockersAvailable | Self::Conflict { .. } => ErrorKind::AssignmentConflict,
            Self::InvalidParameters(_) => ErrorKind::InvalidParameters,
            Self::NotFound { .. } => ErrorKind::NotFound,
        }
    }

    /// `"<error_kind>: <detail>"`, the form stored in `error_message`.
    pub fn to_message(&self) -> String {
        format!("{}: {}", self.kind(), self)
    }
}

impl From<locker_core::Error> for KioskError {
    fn from(error: locker_core::Error) -> Self {
        Self::InvalidParameters(error.to_string())
    }
}

/// Result type for kiosk operations.
pub type Result<T> = std::result::Result<T, KioskError>;
