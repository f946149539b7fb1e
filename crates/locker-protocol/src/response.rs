use crate::crc::check_crc;
use crate::error::{ProtocolError, Result};
use crate::exception::ExceptionCode;
use crate::function::EXCEPTION_FLAG;
use crate::request::{COIL_OFF, COIL_ON, EXCEPTION_FRAME_LEN, Request};

/// A validated Modbus RTU response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Echo of a `0x05` write.
    CoilWritten { coil: u16, on: bool },

    /// Acknowledge of a `0x0F` write.
    CoilsWritten { coil: u16, quantity: u16 },

    /// Coil states from `0x01`, truncated to the requested count.
    Coils(Vec<bool>),

    /// Register values from `0x03`.
    Registers(Vec<u16>),

    /// Echo of a `0x06` write.
    RegisterWritten { register: u16, value: u16 },
}

impl Response {
    /// Validate `frame` as the answer to `request`.
    ///
    /// Checks, in order: minimum length, CRC, slave address, exception flag,
    /// function code, full length and payload echo.
    ///
    /// # Errors
    ///
    /// - `CrcMismatch` when the checksum is wrong
    /// - `Exception` when the slave returned an exception response
    /// - `FrameTooShort`, `UnexpectedSlave`, `UnexpectedFunction`,
    ///   `EchoMismatch` for malformed answers
    pub fn parse(request: &Request, frame: &[u8]) -> Result<Self> {
        if frame.len() < EXCEPTION_FRAME_LEN {
            return Err(ProtocolError::FrameTooShort {
                expected: EXCEPTION_FRAME_LEN,
                actual: frame.len(),
            });
        }
        check_crc(frame)
            .map_err(|(expected, actual)| ProtocolError::CrcMismatch { expected, actual })?;

        let slave = frame[0];
        if slave != request.slave() {
            return Err(ProtocolError::UnexpectedSlave {
                expected: request.slave(),
                actual: slave,
            });
        }

        let function = request.function();
        if frame[1] == function.exception_code() {
            return Err(ProtocolError::Exception {
                slave,
                function,
                code: ExceptionCode::from(frame[2]),
            });
        }
        if frame[1] != function.as_u8() {
            return Err(ProtocolError::UnexpectedFunction {
                expected: function.as_u8(),
                actual: frame[1] & !EXCEPTION_FLAG,
            });
        }

        let expected_len = request.expected_response_len().unwrap_or(8);
        if frame.len() < expected_len {
            return Err(ProtocolError::FrameTooShort {
                expected: expected_len,
                actual: frame.len(),
            });
        }

        let word = |offset: usize| u16::from_be_bytes([frame[offset], frame[offset + 1]]);

        match *request {
            Request::WriteSingleCoil { coil, on, .. } => {
                let value = if on { COIL_ON } else { COIL_OFF };
                if word(2) != coil || word(4) != value {
                    return Err(ProtocolError::EchoMismatch { function });
                }
                Ok(Self::CoilWritten { coil, on })
            }
            Request::WriteMultipleCoils { coil, .. } => {
                if word(2) != coil || word(4) != 1 {
                    return Err(ProtocolError::EchoMismatch { function });
                }
                Ok(Self::CoilsWritten { coil, quantity: 1 })
            }
            Request::ReadCoils { count, .. } => {
                let byte_count = frame[2] as usize;
                if byte_count != (count as usize).div_ceil(8) {
                    return Err(ProtocolError::EchoMismatch { function });
                }
                let coils = frame[3..3 + byte_count]
                    .iter()
                    .flat_map(|byte| (0..8).map(move |bit| byte & (1 << bit) != 0))
                    .take(count as usize)
                    .collect();
                Ok(Self::Coils(coils))
            }
            Request::ReadHoldingRegisters { count, .. } => {
                let byte_count = frame[2] as usize;
                if byte_count != 2 * count as usize {
                    return Err(ProtocolError::EchoMismatch { function });
                }
                let registers = (0..count as usize).map(|i| word(3 + 2 * i)).collect();
                Ok(Self::Registers(registers))
            }
            Request::WriteSingleRegister {
                register, value, ..
            } => {
                if word(2) != register || word(4) != value {
                    return Err(ProtocolError::EchoMismatch { function });
                }
                Ok(Self::RegisterWritten { register, value })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crc::append_crc;

    fn frame(bytes: &[u8]) -> Vec<u8> {
        let mut frame = bytes.to_vec();
        append_crc(&mut frame);
        frame
    }

    #[test]
    fn test_single_coil_echo() {
        let request = Request::write_single_coil(2, 4, false);
        let response = Response::parse(&request, &request.encode()).unwrap();
        assert_eq!(response, Response::CoilWritten { coil: 4, on: false });
    }

    #[test]
    fn test_multiple_coils_ack() {
        let request = Request::write_multiple_coils(1, 9, true);
        let ack = frame(&[0x01, 0x0F, 0x00, 0x09, 0x00, 0x01]);
        assert_eq!(
            Response::parse(&request, &ack).unwrap(),
            Response::CoilsWritten {
                coil: 9,
                quantity: 1
            }
        );
    }

    #[test]
    fn test_read_coils_bits() {
        let request = Request::read_coils(1, 0, 3);
        let reply = frame(&[0x01, 0x01, 0x01, 0b0000_0101]);
        assert_eq!(
            Response::parse(&request, &reply).unwrap(),
            Response::Coils(vec![true, false, true])
        );
    }

    #[test]
    fn test_read_register() {
        let request = Request::read_holding_register(3, 0x4000);
        let reply = frame(&[0x03, 0x03, 0x02, 0x00, 0x03]);
        assert_eq!(
            Response::parse(&request, &reply).unwrap(),
            Response::Registers(vec![3])
        );
    }

    #[test]
    fn test_exception_response() {
        let request = Request::write_multiple_coils(1, 0, true);
        let reply = frame(&[0x01, 0x8F, 0x01]);
        let error = Response::parse(&request, &reply).unwrap_err();
        assert!(error.is_exception());
        assert_eq!(
            error,
            ProtocolError::Exception {
                slave: 1,
                function: crate::FunctionCode::WriteMultipleCoils,
                code: ExceptionCode::IllegalFunction,
            }
        );
    }

    #[test]
    fn test_crc_mismatch() {
        let request = Request::write_single_coil(1, 0, true);
        let mut reply = request.encode().to_vec();
        reply[7] ^= 0xFF;
        assert!(Response::parse(&request, &reply).unwrap_err().is_crc());
    }

    #[test]
    fn test_wrong_slave() {
        let request = Request::write_single_coil(1, 0, true);
        let other = Request::write_single_coil(2, 0, true).encode();
        assert!(matches!(
            Response::parse(&request, &other),
            Err(ProtocolError::UnexpectedSlave {
                expected: 1,
                actual: 2
            })
        ));
    }

    #[test]
    fn test_echo_mismatch() {
        let request = Request::write_single_coil(1, 0, true);
        let off = Request::write_single_coil(1, 0, false).encode();
        assert!(matches!(
            Response::parse(&request, &off),
            Err(ProtocolError::EchoMismatch { .. })
        ));
    }

    #[test]
    fn test_too_short() {
        let request = Request::write_single_coil(1, 0, true);
        assert!(matches!(
            Response::parse(&request, &[0x01, 0x05]),
            Err(ProtocolError::FrameTooShort { .. })
        ));
    }
}
