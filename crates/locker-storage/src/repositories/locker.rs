#![allow(async_fn_in_trait)]

use locker_core::constants::MAX_LOCKER_ID;
use locker_core::{KioskId, LockerId, LockerStatus, Owner};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::error::{StorageError, StorageResult};
use crate::models::{Locker, now};

const LOCKER_COLUMNS: &str =
    "kiosk_id, locker_id, status, owner_type, owner_id, assigned_at, updated_at";

/// Persistence of locker ownership and status.
///
/// Status changes go through [`LockerRepository::transition`], a
/// compare-and-set on the current status; deciding which transitions are
/// legal is left to the caller.
pub trait LockerRepository: Send + Sync {
    /// Create lockers `1..=count` as `Free`, leaving existing rows untouched.
    /// Returns the number of rows created.
    async fn provision(&self, kiosk_id: &KioskId, count: u16) -> StorageResult<u64>;

    async fn get(&self, kiosk_id: &KioskId, locker_id: LockerId) -> StorageResult<Option<Locker>>;

    async fn list(&self, kiosk_id: &KioskId) -> StorageResult<Vec<Locker>>;

    async fn list_by_status(
        &self,
        kiosk_id: &KioskId,
        status: LockerStatus,
    ) -> StorageResult<Vec<Locker>>;

    /// The locker currently held (`Owned` or `Opening`) by `owner`, if any.
    async fn find_by_owner(
        &self,
        kiosk_id: &KioskId,
        owner: &Owner,
    ) -> StorageResult<Option<Locker>>;

    /// Move a locker from `from` to `to`.
    ///
    /// Returns `None` when the locker is not currently in `from`. Entering an
    /// owning status stores `owner` (or keeps the current owner when `None`);
    /// leaving one clears the owner and the assignment time.
    async fn transition(
        &self,
        kiosk_id: &KioskId,
        locker_id: LockerId,
        from: LockerStatus,
        to: LockerStatus,
        owner: Option<&Owner>,
    ) -> StorageResult<Option<Locker>>;
}

/// SQLite implementation of [`LockerRepository`]
#[derive(Debug, Clone)]
pub struct SqliteLockerRepository {
    pool: SqlitePool,
}

impl SqliteLockerRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

impl LockerRepository for SqliteLockerRepository {
    async fn provision(&self, kiosk_id: &KioskId, count: u16) -> StorageResult<u64> {
        if count == 0 || count > MAX_LOCKER_ID {
            return Err(StorageError::Validation(format!(
                "locker count must be 1-{MAX_LOCKER_ID}, got {count}"
            )));
        }

        let at = now();
        let mut tx = self.pool.begin().await?;
        let mut created = 0;
        for locker_id in 1..=count {
            let result = sqlx::query(
                r#"
                INSERT INTO lockers (kiosk_id, locker_id, status, updated_at)
                VALUES (?, ?, 'Free', ?)
                ON CONFLICT (kiosk_id, locker_id) DO NOTHING
                "#,
            )
            .bind(kiosk_id.as_str())
            .bind(locker_id)
            .bind(at)
            .execute(&mut *tx)
            .await?;
            created += result.rows_affected();
        }
        tx.commit().await?;

        info!(kiosk = %kiosk_id, count, created, "Lockers provisioned");
        Ok(created)
    }

    async fn get(&self, kiosk_id: &KioskId, locker_id: LockerId) -> StorageResult<Option<Locker>> {
        let locker = sqlx::query_as::<_, Locker>(&format!(
            "SELECT {LOCKER_COLUMNS} FROM lockers WHERE kiosk_id = ? AND locker_id = ?"
        ))
        .bind(kiosk_id.as_str())
        .bind(locker_id.get())
        .fetch_optional(&self.pool)
        .await?;

        Ok(locker)
    }

    async fn list(&self, kiosk_id: &KioskId) -> StorageResult<Vec<Locker>> {
        let lockers = sqlx::query_as::<_, Locker>(&format!(
            "SELECT {LOCKER_COLUMNS} FROM lockers WHERE kiosk_id = ? ORDER BY locker_id"
        ))
        .bind(kiosk_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(lockers)
    }

    async fn list_by_status(
        &self,
        kiosk_id: &KioskId,
        status: LockerStatus,
    ) -> StorageResult<Vec<Locker>> {
        let lockers = sqlx::query_as::<_, Locker>(&format!(
            r#"
            SELECT {LOCKER_COLUMNS}
            FROM lockers
            WHERE kiosk_id = ? AND status = ?
            ORDER BY locker_id
            "#
        ))
        .bind(kiosk_id.as_str())
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(lockers)
    }

    async fn find_by_owner(
        &self,
        kiosk_id: &KioskId,
        owner: &Owner,
    ) -> StorageResult<Option<Locker>> {
        let locker = sqlx::query_as::<_, Locker>(&format!(
            r#"
            SELECT {LOCKER_COLUMNS}
            FROM lockers
            WHERE kiosk_id = ? AND owner_type = ? AND owner_id = ?
              AND status IN ('Owned', 'Opening')
            ORDER BY assigned_at
            LIMIT 1
            "#
        ))
        .bind(kiosk_id.as_str())
        .bind(owner.owner_type.as_str())
        .bind(&owner.owner_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(locker)
    }

    async fn transition(
        &self,
        kiosk_id: &KioskId,
        locker_id: LockerId,
        from: LockerStatus,
        to: LockerStatus,
        owner: Option<&Owner>,
    ) -> StorageResult<Option<Locker>> {
        let at = now();
        let keeps_owner = to.has_owner();
        let (owner_type, owner_id) = match owner {
            Some(owner) if keeps_owner => (
                Some(owner.owner_type.as_str()),
                Some(owner.owner_id.as_str()),
            ),
            _ => (None, None),
        };
        let assigned_at = owner_id.map(|_| at);

        let locker = sqlx::query_as::<_, Locker>(&format!(
            r#"
            UPDATE lockers
            SET status = ?,
                owner_type = CASE WHEN ? THEN COALESCE(?, owner_type) ELSE NULL END,
                owner_id = CASE WHEN ? THEN COALESCE(?, owner_id) ELSE NULL END,
                assigned_at = CASE WHEN ? THEN COALESCE(?, assigned_at) ELSE NULL END,
                updated_at = ?
            WHERE kiosk_id = ? AND locker_id = ? AND status = ?
            RETURNING {LOCKER_COLUMNS}
            "#
        ))
        .bind(to.as_str())
        .bind(keeps_owner)
        .bind(owner_type)
        .bind(keeps_owner)
        .bind(owner_id)
        .bind(keeps_owner)
        .bind(assigned_at)
        .bind(at)
        .bind(kiosk_id.as_str())
        .bind(locker_id.get())
        .bind(from.as_str())
        .fetch_optional(&self.pool)
        .await?;

        if locker.is_some() {
            debug!(kiosk = %kiosk_id, locker = %locker_id, %from, %to, "Locker transition");
        }
        Ok(locker)
    }
}
