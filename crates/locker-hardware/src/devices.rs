//! Enum wrapper for relay bus dispatch.
//!
//! Native `async fn` in traits is not object-safe, so `Box<dyn RelayBus>`
//! is not an option. [`AnyRelayBus`] gives the driver one concrete type
//! while keeping the transport choice a runtime decision.
//!
//! # Examples
//!
//! ```
//! use locker_hardware::devices::AnyRelayBus;
//! use locker_hardware::mock::MockRelayBus;
//! use locker_hardware::traits::RelayBus;
//!
//! let (bus, _handle) = MockRelayBus::with_cards(1..=4);
//! let bus = AnyRelayBus::Mock(bus);
//! assert!(bus.is_open());
//! ```

use bytes::BytesMut;
use locker_protocol::Request;

use crate::error::BusFault;
use crate::mock::MockRelayBus;
use crate::traits::RelayBus;
#[cfg(feature = "hardware-serial")]
use crate::transport::SerialBus;
use crate::types::BusInfo;

#[derive(Debug)]
#[non_exhaustive]
pub enum AnyRelayBus {
    /// USB-RS485 adapter.
    #[cfg(feature = "hardware-serial")]
    Serial(SerialBus),
    /// Simulated cards for development and testing.
    Mock(MockRelayBus),
}

impl RelayBus for AnyRelayBus {
    async fn transact(&mut self, request: &Request) -> Result<Option<BytesMut>, BusFault> {
        match self {
            #[cfg(feature = "hardware-serial")]
            Self::Serial(bus) => bus.transact(request).await,
            Self::Mock(bus) => bus.transact(request).await,
        }
    }

    async fn open(&mut self) -> Result<(), BusFault> {
        match self {
            #[cfg(feature = "hardware-serial")]
            Self::Serial(bus) => bus.open().await,
            Self::Mock(bus) => bus.open().await,
        }
    }

    fn is_open(&self) -> bool {
        match self {
            #[cfg(feature = "hardware-serial")]
            Self::Serial(bus) => bus.is_open(),
            Self::Mock(bus) => bus.is_open(),
        }
    }

    fn info(&self) -> BusInfo {
        match self {
            #[cfg(feature = "hardware-serial")]
            Self::Serial(bus) => bus.info(),
            Self::Mock(bus) => bus.info(),
        }
    }
}

impl From<MockRelayBus> for AnyRelayBus {
    fn from(bus: MockRelayBus) -> Self {
        Self::Mock(bus)
    }
}

#[cfg(feature = "hardware-serial")]
impl From<SerialBus> for AnyRelayBus {
    fn from(bus: SerialBus) -> Self {
        Self::Serial(bus)
    }
}
