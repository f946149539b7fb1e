pub mod command;
pub mod locker;

pub use command::{
    BulkOpenPayload, CloseRelayPayload, Command, CommandPayload, NewCommand, OpenLockerPayload,
};
pub use locker::Locker;

use chrono::{DateTime, Utc};

/// Current time truncated to milliseconds.
///
/// Timestamps are stored as RFC 3339 text and compared lexically in SQL;
/// a fixed sub-second precision keeps that comparison ordered.
pub(crate) fn now() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}
