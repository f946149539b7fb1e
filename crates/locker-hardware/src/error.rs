//! Error types for relay bus operations.
//!
//! Every hardware error carries the bus target it was aimed at and how many
//! attempts were made, so callers can log and persist a precise reason.
//! [`HardwareError::kind`] maps each failure onto the stable
//! [`ErrorKind`](locker_core::ErrorKind) taxonomy.

use std::fmt;

use locker_core::{ErrorKind, HardwareAddress};
use locker_protocol::ExceptionCode;
use serde::{Deserialize, Serialize};

/// Result type alias for hardware operations.
pub type Result<T> = std::result::Result<T, HardwareError>;

/// What a bus operation was aimed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "target", rename_all = "snake_case")]
pub enum BusTarget {
    /// One relay coil.
    Coil(HardwareAddress),
    /// A whole card, for register maintenance.
    Slave { slave: u8 },
}

impl From<HardwareAddress> for BusTarget {
    fn from(address: HardwareAddress) -> Self {
        Self::Coil(address)
    }
}

impl fmt::Display for BusTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Coil(address) => address.fmt(f),
            Self::Slave { slave } => write!(f, "slave {slave}"),
        }
    }
}

/// Class of a single failed bus exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// No complete answer within the response timeout.
    Timeout,
    /// Checksum or framing error in the answer.
    Crc,
    /// The slave returned an exception response.
    Nack,
    /// Serial I/O failed mid-exchange.
    Io,
    /// The port is not open and could not be reopened.
    Unavailable,
}

impl FaultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Crc => "crc",
            Self::Nack => "nack",
            Self::Io => "io",
            Self::Unavailable => "unavailable",
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed exchange on the wire, before retry policy is applied.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {detail}")]
pub struct BusFault {
    pub kind: FaultKind,
    pub detail: String,
    /// Exception code, for [`FaultKind::Nack`].
    pub exception: Option<ExceptionCode>,
}

impl BusFault {
    pub fn new(kind: FaultKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
            exception: None,
        }
    }

    pub fn timeout(waited_ms: u64) -> Self {
        Self::new(FaultKind::Timeout, format!("no response within {waited_ms}ms"))
    }

    pub fn nack(code: ExceptionCode) -> Self {
        Self {
            kind: FaultKind::Nack,
            detail: code.to_string(),
            exception: Some(code),
        }
    }

    pub fn unavailable(detail: impl Into<String>) -> Self {
        Self::new(FaultKind::Unavailable, detail)
    }
}

impl From<locker_protocol::ProtocolError> for BusFault {
    fn from(error: locker_protocol::ProtocolError) -> Self {
        match error {
            locker_protocol::ProtocolError::Exception { code, .. } => Self::nack(code),
            other => Self::new(FaultKind::Crc, other.to_string()),
        }
    }
}

/// Errors returned by the relay driver.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HardwareError {
    /// No response after exhausting retries.
    #[error("Hardware timeout at {target} after {attempts} attempt(s)")]
    Timeout { target: BusTarget, attempts: u32 },

    /// Corrupted responses after exhausting retries.
    #[error("CRC error at {target} after {attempts} attempt(s): {detail}")]
    Crc {
        target: BusTarget,
        attempts: u32,
        detail: String,
    },

    /// The card kept rejecting the request.
    #[error("Hardware NACK at {target} after {attempts} attempt(s): {code}")]
    Nack {
        target: BusTarget,
        attempts: u32,
        code: ExceptionCode,
    },

    /// Serial I/O broke down after frames had already been written.
    #[error("I/O failure at {target} after {attempts} attempt(s): {detail}")]
    Io {
        target: BusTarget,
        attempts: u32,
        detail: String,
    },

    /// The port could not be used; nothing was written.
    #[error("Hardware unavailable for {target}: {reason}")]
    Unavailable {
        target: BusTarget,
        attempts: u32,
        reason: String,
    },

    /// The bus lock was not acquired in time; nothing was written.
    #[error("Bus busy: lock for {target} not acquired within {waited_ms}ms")]
    BusBusy {
        target: BusTarget,
        attempts: u32,
        waited_ms: u64,
    },

    /// Rejected before touching the bus.
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),
}

impl HardwareError {
    /// Turn the last fault of an exhausted retry loop into an error.
    pub fn from_fault(target: BusTarget, attempts: u32, fault: BusFault) -> Self {
        match fault.kind {
            FaultKind::Timeout => Self::Timeout { target, attempts },
            FaultKind::Crc => Self::Crc {
                target,
                attempts,
                detail: fault.detail,
            },
            FaultKind::Nack => Self::Nack {
                target,
                attempts,
                code: fault.exception.unwrap_or(ExceptionCode::Unknown(0)),
            },
            FaultKind::Io => Self::Io {
                target,
                attempts,
                detail: fault.detail,
            },
            FaultKind::Unavailable => Self::Unavailable {
                target,
                attempts,
                reason: fault.detail,
            },
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidParameters(message.into())
    }

    /// Stable classification of the failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout { .. } => ErrorKind::HardwareTimeout,
            Self::Crc { .. } => ErrorKind::HardwareCrcError,
            Self::Nack { .. } => ErrorKind::HardwareNack,
            Self::Io { .. } | Self::Unavailable { .. } => ErrorKind::HardwareUnavailable,
            Self::BusBusy { .. } => ErrorKind::BusBusy,
            Self::InvalidParameters(_) => ErrorKind::InvalidParameters,
        }
    }

    /// True when no frame reached the bus, so the operation may be replayed.
    pub fn is_pre_hardware(&self) -> bool {
        matches!(
            self,
            Self::Unavailable { .. } | Self::BusBusy { .. } | Self::InvalidParameters(_)
        )
    }

    pub fn target(&self) -> Option<BusTarget> {
        match self {
            Self::Timeout { target, .. }
            | Self::Crc { target, .. }
            | Self::Nack { target, .. }
            | Self::Io { target, .. }
            | Self::Unavailable { target, .. }
            | Self::BusBusy { target, .. } => Some(*target),
            Self::InvalidParameters(_) => None,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::Timeout { attempts, .. }
            | Self::Crc { attempts, .. }
            | Self::Nack { attempts, .. }
            | Self::Io { attempts, .. }
            | Self::Unavailable { attempts, .. }
            | Self::BusBusy { attempts, .. } => *attempts,
            Self::InvalidParameters(_) => 0,
        }
    }
}
