//! SQLite persistence for the locker controller.
//!
//! Two tables back the kiosk runtime:
//!
//! - `commands`, the durable hardware command queue ([`CommandQueue`]).
//!   Rows are transitioned, never deleted, so the table is also the audit
//!   trail of every relay pulse.
//! - `lockers`, ownership and status per physical relay channel
//!   ([`LockerRepository`]).
//!
//! Both repositories express every mutation as one conditional `UPDATE`
//! (compare-and-set on the current status). Concurrent deliveries of the same
//! command, or racing admin and dispatcher transitions, therefore resolve to
//! exactly one winner without explicit locking.
//!
//! # Examples
//!
//! ```no_run
//! use locker_core::{KioskId, LockerId, OpenPurpose};
//! use locker_storage::models::{CommandPayload, NewCommand};
//! use locker_storage::{CommandQueue, Database, SqliteCommandQueue};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::in_memory().await?;
//! let queue = SqliteCommandQueue::new(db.pool().clone());
//!
//! let kiosk = KioskId::new("lobby")?;
//! let command = NewCommand::new(
//!     kiosk.clone(),
//!     CommandPayload::open(LockerId::new(12)?, OpenPurpose::Release, None),
//! )
//! .with_id("req-7");
//!
//! let first = queue.enqueue(&command).await?;
//! let again = queue.enqueue(&command).await?;
//! assert!(first.created && !again.created);
//!
//! if let Some(next) = queue.next_pending(&kiosk).await? {
//!     if queue.mark_executing(&next.command_id).await? {
//!         // drive the hardware, then mark_completed / mark_failed
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod error;
pub mod models;
pub mod repositories;

pub use connection::{Database, DatabaseConfig};
pub use error::{StorageError, StorageResult};
pub use models::{Command, CommandPayload, Locker, NewCommand};
pub use repositories::{
    CommandQueue, Enqueued, LockerRepository, SqliteCommandQueue, SqliteLockerRepository,
    StaleRecovery,
};
