pub mod command;
pub mod locker;

pub use command::{CommandQueue, Enqueued, SqliteCommandQueue, StaleRecovery};
pub use locker::{LockerRepository, SqliteLockerRepository};
