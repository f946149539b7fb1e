//! Kiosk runtime: locker lifecycle, RFID sessions and command dispatch.
//!
//! [`KioskService`] is the entry point the web layer calls. It validates
//! requests, drives the [`LockerStateMachine`], keeps one selection session
//! per kiosk and writes hardware work to the command queue. A
//! [`Dispatcher`] per kiosk drains that queue through the kiosk's
//! [`RelayDriver`](locker_hardware::RelayDriver) and records the outcome.
//!
//! ```text
//! scan ──▶ KioskService ──enqueue──▶ commands ◀──poll── Dispatcher ──▶ RelayDriver
//!              │                                           │
//!              └──────────── LockerStateMachine ◀──────────┘
//! ```

pub mod dispatcher;
pub mod error;
pub mod service;
pub mod session;
pub mod state_machine;

pub use dispatcher::{BulkItemOutcome, Dispatcher, DispatcherConfig, DispatcherHandle};
pub use error::{KioskError, Result};
pub use service::{
    CardAction, CardResponse, KioskService, KioskServiceBuilder, OpenResponse, SelectResponse,
};
pub use session::{Session, SessionConfig, SessionManager, SessionStatus};
pub use state_machine::{LockerEvent, LockerStateMachine, OpenOutcome};
