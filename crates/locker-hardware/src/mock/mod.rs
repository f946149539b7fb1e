//! Mock relay bus for development and testing without RS-485 hardware.

mod bus;

pub use bus::{MockRelayBus, MockRelayBusHandle, RecordedFrame};
