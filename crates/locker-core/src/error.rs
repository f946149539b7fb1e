use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Stable, user-facing error classification.
///
/// UI layers render localized messages from these kinds and never from the
/// `Display` text of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    HardwareTimeout,
    HardwareCrcError,
    HardwareNack,
    HardwareUnavailable,
    BusBusy,
    StaleRecovery,
    SessionExpired,
    AssignmentConflict,
    InvalidParameters,
    NotFound,
    Storage,
}

impl ErrorKind {
    /// Wire name of the kind, as stored in `error_message` prefixes.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HardwareTimeout => "hardware_timeout",
            Self::HardwareCrcError => "hardware_crc_error",
            Self::HardwareNack => "hardware_nack",
            Self::HardwareUnavailable => "hardware_unavailable",
            Self::BusBusy => "bus_busy",
            Self::StaleRecovery => "stale_recovery",
            Self::SessionExpired => "session_expired",
            Self::AssignmentConflict => "assignment_conflict",
            Self::InvalidParameters => "invalid_parameters",
            Self::NotFound => "not_found",
            Self::Storage => "storage",
        }
    }

    /// Whether the fault happened before anything reached the relay cards.
    pub fn is_pre_hardware(&self) -> bool {
        matches!(self, Self::HardwareUnavailable | Self::BusBusy)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Invalid locker id: {0}")]
    InvalidLockerId(String),

    #[error("Invalid kiosk id: {0}")]
    InvalidKioskId(String),

    #[error("Invalid card id: {0}")]
    InvalidCardId(String),

    #[error("Unknown {kind} value: {value}")]
    UnknownVariant { kind: &'static str, value: String },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidStateTransition { .. } => ErrorKind::AssignmentConflict,
            _ => ErrorKind::InvalidParameters,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
