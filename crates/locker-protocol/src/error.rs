use crate::exception::ExceptionCode;
use crate::function::FunctionCode;
use thiserror::Error;

/// Errors raised while building or validating Modbus RTU frames.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Trailing CRC does not match the frame contents.
    #[error("CRC mismatch: expected {expected:#06X}, got {actual:#06X}")]
    CrcMismatch { expected: u16, actual: u16 },

    /// The slave answered with an exception response.
    #[error("Slave {slave} rejected {function}: {code}")]
    Exception {
        slave: u8,
        function: FunctionCode,
        code: ExceptionCode,
    },

    /// Frame shorter than its function code requires.
    #[error("Frame too short: expected {expected} bytes, got {actual}")]
    FrameTooShort { expected: usize, actual: usize },

    /// Response came from another slave.
    #[error("Unexpected slave address: expected {expected}, got {actual}")]
    UnexpectedSlave { expected: u8, actual: u8 },

    /// Response carries another function code.
    #[error("Unexpected function code: expected {expected:#04X}, got {actual:#04X}")]
    UnexpectedFunction { expected: u8, actual: u8 },

    /// Write echo does not repeat the request.
    #[error("Write echo mismatch for {function}")]
    EchoMismatch { function: FunctionCode },

    /// Unicast address outside 1-247.
    #[error("Invalid slave address: {0}")]
    InvalidSlaveAddress(u8),

    /// Function code byte not supported by this crate.
    #[error("Unsupported function code: {0:#04X}")]
    UnsupportedFunction(u8),
}

impl ProtocolError {
    /// Whether the error reflects line corruption rather than a slave decision.
    pub fn is_crc(&self) -> bool {
        matches!(self, Self::CrcMismatch { .. })
    }

    /// Whether the slave actively refused the request.
    pub fn is_exception(&self) -> bool {
        matches!(self, Self::Exception { .. })
    }
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
