use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Modbus function codes used with relay cards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FunctionCode {
    ReadCoils = 0x01,
    ReadHoldingRegisters = 0x03,
    WriteSingleCoil = 0x05,
    WriteSingleRegister = 0x06,
    WriteMultipleCoils = 0x0F,
}

/// Bit set on the function code of an exception response.
pub const EXCEPTION_FLAG: u8 = 0x80;

impl FunctionCode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Exception responses echo the function code with the high bit set.
    pub fn exception_code(self) -> u8 {
        self.as_u8() | EXCEPTION_FLAG
    }
}

impl TryFrom<u8> for FunctionCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::ReadCoils),
            0x03 => Ok(Self::ReadHoldingRegisters),
            0x05 => Ok(Self::WriteSingleCoil),
            0x06 => Ok(Self::WriteSingleRegister),
            0x0F => Ok(Self::WriteMultipleCoils),
            other => Err(ProtocolError::UnsupportedFunction(other)),
        }
    }
}

impl fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X}", self.as_u8())
    }
}
