//! Relay hardware layer for the locker controller.
//!
//! Lockers are latched by 16-channel Modbus RTU relay cards chained on one
//! RS-485 line per kiosk. This crate owns that line:
//!
//! - [`RelayBus`] moves single frames over a transport ([`SerialBus`] for a
//!   USB-RS485 adapter, [`MockRelayBus`](mock::MockRelayBus) for tests).
//! - [`RelayDriver`] serializes access to the bus and turns "open locker N"
//!   into a timed ON/OFF pulse with retries, backoff and a `0x0F` → `0x05`
//!   fallback, keeping health counters as it goes.
//! - [`maintenance`] reads, writes and scans card addresses.
//!
//! # Examples
//!
//! ```
//! use locker_core::LockerId;
//! use locker_hardware::mock::MockRelayBus;
//! use locker_hardware::{DriverConfig, RelayDriver};
//! use locker_protocol::FunctionCode;
//!
//! #[tokio::main]
//! async fn main() -> locker_hardware::Result<()> {
//!     let (bus, handle) = MockRelayBus::for_lockers(16);
//!     let driver = RelayDriver::new(bus, DriverConfig::default());
//!
//!     driver.open(LockerId::new(3).unwrap()).await?;
//!
//!     // ON then OFF, both through Write Multiple Coils.
//!     assert_eq!(handle.frames_with(FunctionCode::WriteMultipleCoils).len(), 2);
//!     Ok(())
//! }
//! ```
//!
//! # Error Handling
//!
//! Every failure is a [`HardwareError`] carrying the bus target and attempt
//! count; [`HardwareError::kind`] gives the stable classification stored
//! with failed commands.

pub mod devices;
pub mod driver;
pub mod error;
pub mod maintenance;
pub mod mock;
pub mod traits;
pub mod transport;
pub mod types;

pub use devices::AnyRelayBus;
pub use driver::RelayDriver;
pub use error::{BusFault, BusTarget, FaultKind, HardwareError, Result};
pub use traits::RelayBus;
#[cfg(feature = "hardware-serial")]
pub use transport::SerialBus;
pub use types::{
    BulkItemResult, BusInfo, DriverConfig, HealthSnapshot, LastFault, PulseReport, ScanHit,
    SerialConfig, SlaveAddressChange, WriteMode,
};
