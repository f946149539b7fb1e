use crate::crc::append_crc;
use crate::error::{ProtocolError, Result};
use crate::function::FunctionCode;
use bytes::{BufMut, Bytes, BytesMut};
use locker_core::constants::{BROADCAST_ADDRESS, MAX_SLAVE_ADDRESS};

/// Coil value for ON in Write Single Coil.
pub const COIL_ON: u16 = 0xFF00;

/// Coil value for OFF in Write Single Coil.
pub const COIL_OFF: u16 = 0x0000;

/// Exception response length: slave, function, code, CRC.
pub const EXCEPTION_FRAME_LEN: usize = 5;

/// A Modbus RTU request addressed to one relay card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// `0x05`: set one coil.
    WriteSingleCoil { slave: u8, coil: u16, on: bool },

    /// `0x0F` with quantity 1: set one coil through the multi-coil write.
    WriteMultipleCoils { slave: u8, coil: u16, on: bool },

    /// `0x01`: read `count` coils starting at `coil`.
    ReadCoils { slave: u8, coil: u16, count: u16 },

    /// `0x03`: read `count` holding registers.
    ReadHoldingRegisters { slave: u8, register: u16, count: u16 },

    /// `0x06`: write one holding register.
    WriteSingleRegister { slave: u8, register: u16, value: u16 },
}

impl Request {
    pub fn write_single_coil(slave: u8, coil: u16, on: bool) -> Self {
        Self::WriteSingleCoil { slave, coil, on }
    }

    pub fn write_multiple_coils(slave: u8, coil: u16, on: bool) -> Self {
        Self::WriteMultipleCoils { slave, coil, on }
    }

    pub fn read_coils(slave: u8, coil: u16, count: u16) -> Self {
        Self::ReadCoils { slave, coil, count }
    }

    pub fn read_holding_register(slave: u8, register: u16) -> Self {
        Self::ReadHoldingRegisters {
            slave,
            register,
            count: 1,
        }
    }

    pub fn write_single_register(slave: u8, register: u16, value: u16) -> Self {
        Self::WriteSingleRegister {
            slave,
            register,
            value,
        }
    }

    /// Target slave address.
    pub fn slave(&self) -> u8 {
        match *self {
            Self::WriteSingleCoil { slave, .. }
            | Self::WriteMultipleCoils { slave, .. }
            | Self::ReadCoils { slave, .. }
            | Self::ReadHoldingRegisters { slave, .. }
            | Self::WriteSingleRegister { slave, .. } => slave,
        }
    }

    pub fn function(&self) -> FunctionCode {
        match self {
            Self::WriteSingleCoil { .. } => FunctionCode::WriteSingleCoil,
            Self::WriteMultipleCoils { .. } => FunctionCode::WriteMultipleCoils,
            Self::ReadCoils { .. } => FunctionCode::ReadCoils,
            Self::ReadHoldingRegisters { .. } => FunctionCode::ReadHoldingRegisters,
            Self::WriteSingleRegister { .. } => FunctionCode::WriteSingleRegister,
        }
    }

    /// Broadcast requests are executed by every slave and answered by none.
    pub fn is_broadcast(&self) -> bool {
        self.slave() == BROADCAST_ADDRESS
    }

    /// Check the slave address and quantities before the frame hits the wire.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSlaveAddress` for addresses above 247, and for
    /// broadcast reads (nobody would answer).
    pub fn validate(&self) -> Result<()> {
        let slave = self.slave();
        if slave > MAX_SLAVE_ADDRESS {
            return Err(ProtocolError::InvalidSlaveAddress(slave));
        }
        let is_read = matches!(
            self,
            Self::ReadCoils { .. } | Self::ReadHoldingRegisters { .. }
        );
        if is_read && slave == BROADCAST_ADDRESS {
            return Err(ProtocolError::InvalidSlaveAddress(slave));
        }
        Ok(())
    }

    /// Number of bytes in a successful response, or `None` for broadcasts.
    pub fn expected_response_len(&self) -> Option<usize> {
        if self.is_broadcast() {
            return None;
        }
        let len = match *self {
            Self::ReadCoils { count, .. } => 3 + count.div_ceil(8) as usize + 2,
            Self::ReadHoldingRegisters { count, .. } => 3 + 2 * count as usize + 2,
            Self::WriteSingleCoil { .. }
            | Self::WriteMultipleCoils { .. }
            | Self::WriteSingleRegister { .. } => 8,
        };
        Some(len)
    }

    /// Encode the request including its CRC.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(10);
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Append the encoded request to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        let start = buf.len();
        buf.put_u8(self.slave());
        buf.put_u8(self.function().as_u8());
        match *self {
            Self::WriteSingleCoil { coil, on, .. } => {
                buf.put_u16(coil);
                buf.put_u16(if on { COIL_ON } else { COIL_OFF });
            }
            Self::WriteMultipleCoils { coil, on, .. } => {
                buf.put_u16(coil);
                buf.put_u16(1);
                buf.put_u8(1);
                buf.put_u8(u8::from(on));
            }
            Self::ReadCoils { coil, count, .. } => {
                buf.put_u16(coil);
                buf.put_u16(count);
            }
            Self::ReadHoldingRegisters {
                register, count, ..
            } => {
                buf.put_u16(register);
                buf.put_u16(count);
            }
            Self::WriteSingleRegister {
                register, value, ..
            } => {
                buf.put_u16(register);
                buf.put_u16(value);
            }
        }
        let mut frame = buf.split_off(start);
        append_crc(&mut frame);
        buf.unsplit(frame);
    }
}
