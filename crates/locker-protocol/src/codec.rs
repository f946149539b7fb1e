//! Tokio codec splitting an RS-485 byte stream into RTU frames.
//!
//! Modbus RTU has no start/end markers; the length of a response follows
//! from its function code:
//!
//! ```text
//! exception (fc | 0x80)        -> 5 bytes
//! 0x01 / 0x03 (byte count n)   -> 3 + n + 2 bytes
//! 0x05 / 0x06 / 0x0F           -> 8 bytes
//! ```
//!
//! The decoder yields raw frames; CRC and echo checks are done by
//! [`Response::parse`](crate::Response::parse) against the request that was
//! sent.
//!
//! # Example
//!
//! ```
//! use bytes::BytesMut;
//! use tokio_util::codec::Decoder;
//! use locker_protocol::{Request, RtuCodec};
//!
//! let mut codec = RtuCodec::new();
//! let mut buf = BytesMut::from(&Request::write_single_coil(1, 0, true).encode()[..4]);
//! assert!(codec.decode(&mut buf).unwrap().is_none());
//!
//! buf.extend_from_slice(&Request::write_single_coil(1, 0, true).encode()[4..]);
//! let frame = codec.decode(&mut buf).unwrap().unwrap();
//! assert_eq!(frame.len(), 8);
//! ```

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::function::{EXCEPTION_FLAG, FunctionCode};
use crate::request::{EXCEPTION_FRAME_LEN, Request};

/// Largest RTU frame allowed by the Modbus serial line specification.
pub const MAX_RTU_FRAME_SIZE: usize = 256;

/// Errors raised while framing a byte stream.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Frame splitter for Modbus RTU responses.
#[derive(Debug, Default, Clone, Copy)]
pub struct RtuCodec;

impl RtuCodec {
    pub fn new() -> Self {
        Self
    }

    /// Length of the frame starting at `buf[0]`, if enough header is buffered.
    fn frame_len(buf: &[u8]) -> Result<Option<usize>, ProtocolError> {
        if buf.len() < 2 {
            return Ok(None);
        }
        let function = buf[1];
        if function & EXCEPTION_FLAG != 0 {
            return Ok(Some(EXCEPTION_FRAME_LEN));
        }
        match FunctionCode::try_from(function)? {
            FunctionCode::ReadCoils | FunctionCode::ReadHoldingRegisters => {
                Ok(buf.get(2).map(|&count| 3 + count as usize + 2))
            }
            FunctionCode::WriteSingleCoil
            | FunctionCode::WriteSingleRegister
            | FunctionCode::WriteMultipleCoils => Ok(Some(8)),
        }
    }
}

impl Decoder for RtuCodec {
    type Item = BytesMut;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(len) = Self::frame_len(src)? else {
            return Ok(None);
        };
        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }
        Ok(Some(src.split_to(len)))
    }
}

impl Encoder<Request> for RtuCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Request, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.validate()?;
        item.encode_into(dst);
        Ok(())
    }
}
