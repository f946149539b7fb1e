//! Modbus RTU framing for RS-485 relay cards.
//!
//! This crate builds request frames for the relay cards that drive locker
//! latches, validates their responses and splits a raw byte stream into
//! complete RTU frames. It performs no I/O; transports live in
//! `locker-hardware`.
//!
//! # Frame Layout
//!
//! ```text
//! [slave][function][addr_hi][addr_lo][data_hi][data_lo][crc_lo][crc_hi]
//! ```
//!
//! Write Multiple Coils (`0x0F`) inserts a byte count and the coil bits
//! between the quantity and the CRC.
//!
//! # Examples
//!
//! ```
//! use locker_protocol::{Request, Response};
//!
//! let request = Request::write_single_coil(1, 0, true);
//! assert_eq!(&request.encode()[..], &[0x01, 0x05, 0x00, 0x00, 0xFF, 0x00, 0x8C, 0x3A]);
//!
//! // Relay cards echo single-coil writes.
//! let response = Response::parse(&request, &request.encode()).unwrap();
//! assert_eq!(response, Response::CoilWritten { coil: 0, on: true });
//! ```

pub mod codec;
pub mod crc;
pub mod error;
pub mod exception;
pub mod function;
pub mod request;
pub mod response;

pub use codec::{CodecError, RtuCodec};
pub use error::{ProtocolError, Result};
pub use exception::ExceptionCode;
pub use function::FunctionCode;
pub use request::Request;
pub use response::Response;
