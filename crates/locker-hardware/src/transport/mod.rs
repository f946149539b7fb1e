//! Real transports.

#[cfg(feature = "hardware-serial")]
pub mod serial;

#[cfg(feature = "hardware-serial")]
pub use serial::SerialBus;
