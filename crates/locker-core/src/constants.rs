//! Core constants for locker hardware and command execution.
//!
//! This module centralizes the values shared by the relay driver, the
//! command queue and the session manager: bus addressing limits, pulse and
//! pacing timings, retry budgets and session windows.
//!
//! # Addressing
//!
//! Lockers are wired to 16-channel Modbus RTU relay cards. Each card owns
//! one slave address on the RS-485 bus:
//!
//! ```text
//! locker 1..=16   -> slave 1, coils 0..=15
//! locker 17..=32  -> slave 2, coils 0..=15
//! ...
//! ```
//!
//! # Usage
//!
//! ```
//! use locker_core::constants::*;
//! use std::time::Duration;
//!
//! assert_eq!(COILS_PER_CARD, 16);
//! let pulse = Duration::from_millis(DEFAULT_PULSE_DURATION_MS);
//! assert_eq!(pulse.as_millis(), 400);
//! ```

// ============================================================================
// Bus Addressing
// ============================================================================

/// Number of relay channels (coils) on one relay card.
pub const COILS_PER_CARD: u16 = 16;

/// Lowest unicast Modbus slave address.
pub const MIN_SLAVE_ADDRESS: u8 = 1;

/// Highest unicast Modbus slave address.
pub const MAX_SLAVE_ADDRESS: u8 = 247;

/// Broadcast slave address. Slaves never answer broadcast requests.
pub const BROADCAST_ADDRESS: u8 = 0;

/// Smallest valid locker id.
pub const MIN_LOCKER_ID: u16 = 1;

/// Largest locker id addressable on one bus (247 cards of 16 channels).
pub const MAX_LOCKER_ID: u16 = MAX_SLAVE_ADDRESS as u16 * COILS_PER_CARD;

/// Holding register where Waveshare relay cards store their slave address.
pub const SLAVE_ADDRESS_REGISTER: u16 = 0x4000;

// ============================================================================
// Serial Line
// ============================================================================

/// Default RS-485 baud rate (8 data bits, no parity, 1 stop bit).
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Default per-request response timeout in milliseconds.
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 500;

/// Default serial device path.
///
/// Stable by-id paths are preferred in deployment because enumerated
/// `ttyUSBn` names change when the adapter is replugged.
pub const DEFAULT_SERIAL_PORT: &str = "/dev/ttyUSB0";

// ============================================================================
// Pulse and Pacing
// ============================================================================

/// Default time a relay stays energized during an open pulse.
pub const DEFAULT_PULSE_DURATION_MS: u64 = 400;

/// Accepted deviation of the measured pulse length.
pub const PULSE_TOLERANCE_MS: u64 = 50;

/// Minimum gap between two bus transactions, for relay-card settling.
pub const DEFAULT_COMMAND_INTERVAL_MS: u64 = 300;

/// Lower clamp for the caller-supplied bulk-open interval.
pub const MIN_BULK_INTERVAL_MS: u64 = 100;

/// Upper clamp for the caller-supplied bulk-open interval.
pub const MAX_BULK_INTERVAL_MS: u64 = 5000;

/// How long a caller waits for the bus lock before giving up with `bus_busy`.
pub const DEFAULT_BUS_LOCK_TIMEOUT_MS: u64 = 5000;

// ============================================================================
// Retries
// ============================================================================

/// Default number of hardware attempts per command.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff between hardware attempts.
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 100;

/// Upper bound for a single backoff delay.
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 5000;

// ============================================================================
// Queue and Sessions
// ============================================================================

/// Commands stuck in `executing` longer than this are recovered at startup.
pub const DEFAULT_STALE_THRESHOLD_SECS: u64 = 120;

/// Dispatcher poll interval.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Lifetime of an RFID locker-selection session.
pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 30;

/// Error message written by stale recovery when no retries remain.
pub const STALE_RECOVERY_MESSAGE: &str = "stale_recovery";

/// Clamp a bulk-open interval into the supported range.
///
/// # Examples
///
/// ```
/// use locker_core::constants::clamp_bulk_interval;
///
/// assert_eq!(clamp_bulk_interval(10), 100);
/// assert_eq!(clamp_bulk_interval(500), 500);
/// assert_eq!(clamp_bulk_interval(60_000), 5000);
/// ```
pub fn clamp_bulk_interval(interval_ms: u64) -> u64 {
    interval_ms.clamp(MIN_BULK_INTERVAL_MS, MAX_BULK_INTERVAL_MS)
}
