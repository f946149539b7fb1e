use chrono::{DateTime, Utc};
use locker_core::{KioskId, LockerId, LockerStatus, Owner, OwnerType};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};

/// One physical locker of a kiosk.
///
/// `owner` is present exactly when `status` is `Owned` or `Opening`; the
/// table enforces this with a CHECK constraint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Locker {
    pub kiosk_id: KioskId,
    pub locker_id: LockerId,
    pub status: LockerStatus,
    pub owner: Option<Owner>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Locker {
    pub fn is_owned_by(&self, owner: &Owner) -> bool {
        self.owner.as_ref() == Some(owner)
    }
}

fn decode_error(column: &str, error: impl std::error::Error + Send + Sync + 'static) -> sqlx::Error {
    sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(error),
    }
}

impl<'r> FromRow<'r, SqliteRow> for Locker {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let kiosk_id = KioskId::new(row.try_get::<String, _>("kiosk_id")?)
            .map_err(|e| decode_error("kiosk_id", e))?;
        let locker_id = LockerId::new(row.try_get::<u16, _>("locker_id")?)
            .map_err(|e| decode_error("locker_id", e))?;
        let status = row
            .try_get::<String, _>("status")?
            .parse::<LockerStatus>()
            .map_err(|e| decode_error("status", e))?;

        let owner_type: Option<String> = row.try_get("owner_type")?;
        let owner_id: Option<String> = row.try_get("owner_id")?;
        let owner = match (owner_type, owner_id) {
            (Some(owner_type), Some(owner_id)) => {
                let owner_type = owner_type
                    .parse::<OwnerType>()
                    .map_err(|e| decode_error("owner_type", e))?;
                Some(Owner::new(owner_type, owner_id))
            }
            _ => None,
        };

        Ok(Self {
            kiosk_id,
            locker_id,
            status,
            owner,
            assigned_at: row.try_get("assigned_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}
