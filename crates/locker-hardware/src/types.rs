//! Configuration and report types shared by the driver and transports.

use std::time::Duration;

use locker_core::constants::{
    DEFAULT_BACKOFF_BASE_MS, DEFAULT_BACKOFF_MAX_MS, DEFAULT_BAUD_RATE,
    DEFAULT_BUS_LOCK_TIMEOUT_MS, DEFAULT_COMMAND_INTERVAL_MS, DEFAULT_MAX_RETRIES,
    DEFAULT_PULSE_DURATION_MS, DEFAULT_RESPONSE_TIMEOUT_MS, DEFAULT_SERIAL_PORT,
};
use locker_core::{HardwareAddress, LockerId};
use serde::{Deserialize, Serialize};

use crate::error::{FaultKind, HardwareError};

/// Serial line settings. Framing is fixed at 8N1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Device path, e.g. `/dev/ttyUSB0`.
    pub port: String,
    pub baud_rate: u32,
    pub response_timeout_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_SERIAL_PORT.to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
            response_timeout_ms: DEFAULT_RESPONSE_TIMEOUT_MS,
        }
    }
}

impl SerialConfig {
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            ..Self::default()
        }
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

/// Function code used to switch a coil.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// `0x0F` first, one `0x05` retry of the same write on failure.
    #[default]
    MultiCoil,
    /// `0x05` only.
    SingleCoil,
}

/// Timing and retry policy of a [`RelayDriver`](crate::RelayDriver).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub write_mode: WriteMode,
    /// Time between the ON and OFF writes of a pulse.
    pub pulse_duration_ms: u64,
    /// Minimum gap between two commands on the bus.
    pub command_interval_ms: u64,
    /// Failed exchanges tolerated per command.
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub bus_lock_timeout_ms: u64,
    /// Read the coil back after a pulse.
    pub verify: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            write_mode: WriteMode::default(),
            pulse_duration_ms: DEFAULT_PULSE_DURATION_MS,
            command_interval_ms: DEFAULT_COMMAND_INTERVAL_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            bus_lock_timeout_ms: DEFAULT_BUS_LOCK_TIMEOUT_MS,
            verify: false,
        }
    }
}

impl DriverConfig {
    pub fn with_write_mode(mut self, write_mode: WriteMode) -> Self {
        self.write_mode = write_mode;
        self
    }

    pub fn with_pulse_duration(mut self, duration: Duration) -> Self {
        self.pulse_duration_ms = duration.as_millis() as u64;
        self
    }

    pub fn with_command_interval(mut self, interval: Duration) -> Self {
        self.command_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base_ms = base.as_millis() as u64;
        self.backoff_max_ms = max.as_millis() as u64;
        self
    }

    pub fn with_bus_lock_timeout(mut self, timeout: Duration) -> Self {
        self.bus_lock_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    pub fn pulse_duration(&self) -> Duration {
        Duration::from_millis(self.pulse_duration_ms)
    }

    pub fn command_interval(&self) -> Duration {
        Duration::from_millis(self.command_interval_ms)
    }

    pub fn bus_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.bus_lock_timeout_ms)
    }
}

/// Outcome of a successful pulse or release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PulseReport {
    pub locker_id: LockerId,
    pub address: HardwareAddress,
    /// Exchanges that failed and were retried.
    pub retries: u32,
    /// Writes that fell back from `0x0F` to `0x05`.
    pub fallbacks: u32,
    /// Measured time between the ON and OFF writes.
    pub on_duration_ms: Option<u64>,
    /// `None` when read-back is disabled.
    pub verified: Option<bool>,
    pub duration_ms: u64,
}

/// Per-locker result of a bulk open.
#[derive(Debug, Clone)]
pub struct BulkItemResult {
    pub locker_id: LockerId,
    pub result: Result<PulseReport, HardwareError>,
}

impl BulkItemResult {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Result of a slave address write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaveAddressChange {
    pub previous: u8,
    pub new: u8,
    /// Whether a read-back at the new address confirmed the change.
    pub verified: bool,
}

/// A card that answered during a bus scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanHit {
    /// Address the probe was sent to.
    pub probed: u8,
    /// Address stored in the card's register.
    pub reported: u8,
}

/// Point-in-time driver health.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub port: String,
    pub port_open: bool,
    pub total_commands: u64,
    pub failed_commands: u64,
    pub error_rate_percent: f64,
    pub fallback_count: u64,
    pub last_fault: Option<LastFault>,
}

/// Most recent failed exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastFault {
    pub kind: FaultKind,
    pub target: String,
    pub detail: String,
}

/// Transport description for logs and health output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusInfo {
    pub name: String,
    pub port: String,
    pub baud_rate: Option<u32>,
}

impl BusInfo {
    pub fn new(name: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            port: port.into(),
            baud_rate: None,
        }
    }

    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = Some(baud_rate);
        self
    }
}
