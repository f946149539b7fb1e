//! Transport abstraction for the RS-485 bus.
//!
//! A [`RelayBus`] moves one request frame onto the wire and collects the
//! raw answer. It knows nothing about retries, pacing or pulses; those live
//! in [`RelayDriver`](crate::RelayDriver), which serializes all access to a
//! bus behind its lock.
//!
//! The trait uses native `async fn` (Edition 2024 RPITIT) and is therefore
//! not object-safe. Concrete dispatch goes through
//! [`AnyRelayBus`](crate::devices::AnyRelayBus).

#![allow(async_fn_in_trait)]

use bytes::BytesMut;
use locker_protocol::Request;

use crate::error::BusFault;
use crate::types::BusInfo;

/// A half-duplex Modbus RTU transport.
///
/// # Examples
///
/// ```
/// use locker_hardware::mock::MockRelayBus;
/// use locker_hardware::traits::RelayBus;
/// use locker_protocol::{Request, Response};
///
/// #[tokio::main]
/// async fn main() {
///     let (mut bus, _handle) = MockRelayBus::with_cards(1..=1);
///     let request = Request::write_single_coil(1, 0, true);
///
///     let frame = bus.transact(&request).await.unwrap().unwrap();
///     let response = Response::parse(&request, &frame).unwrap();
///     assert_eq!(response, Response::CoilWritten { coil: 0, on: true });
/// }
/// ```
pub trait RelayBus: Send {
    /// Write `request` and read one complete response frame.
    ///
    /// Returns `Ok(None)` for broadcast requests, which no slave answers.
    /// The frame is returned unparsed; validate it with
    /// [`Response::parse`](locker_protocol::Response::parse).
    ///
    /// # Errors
    ///
    /// - [`FaultKind::Timeout`](crate::FaultKind::Timeout) when no complete
    ///   frame arrives in time
    /// - [`FaultKind::Crc`](crate::FaultKind::Crc) for garbled or truncated
    ///   frames
    /// - [`FaultKind::Io`](crate::FaultKind::Io) when the port fails; the
    ///   transport is closed afterwards
    /// - [`FaultKind::Unavailable`](crate::FaultKind::Unavailable) when the
    ///   port is not open
    async fn transact(&mut self, request: &Request) -> Result<Option<BytesMut>, BusFault>;

    /// (Re)open the underlying port.
    async fn open(&mut self) -> Result<(), BusFault>;

    /// Whether the port is currently usable.
    fn is_open(&self) -> bool;

    fn info(&self) -> BusInfo;
}
