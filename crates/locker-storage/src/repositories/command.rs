#![allow(async_fn_in_trait)]

use std::time::Duration;

use chrono::TimeDelta;
use locker_core::constants::STALE_RECOVERY_MESSAGE;
use locker_core::{CommandStatus, KioskId};
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{StorageError, StorageResult};
use crate::models::{Command, NewCommand, now};

const COMMAND_COLUMNS: &str = "command_id, kiosk_id, command_type, payload, status, \
     retry_count, max_retries, created_at, next_attempt_at, started_at, completed_at, \
     duration_ms, error_message, result";

/// Outcome of [`CommandQueue::enqueue`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Enqueued {
    pub command_id: String,
    /// `false` when a command with the same id already existed.
    pub created: bool,
}

/// Commands touched by [`CommandQueue::recover_stale`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StaleRecovery {
    pub requeued: u64,
    pub failed: u64,
}

/// Durable per-kiosk queue of hardware commands.
///
/// Every status change is a single conditional `UPDATE`, so `status`,
/// `started_at`, `completed_at` and `duration_ms` always move together.
pub trait CommandQueue: Send + Sync {
    /// Insert a command unless one with the same id exists.
    async fn enqueue(&self, command: &NewCommand) -> StorageResult<Enqueued>;

    async fn get(&self, command_id: &str) -> StorageResult<Option<Command>>;

    /// Oldest pending command of the kiosk whose retry delay has elapsed.
    async fn next_pending(&self, kiosk_id: &KioskId) -> StorageResult<Option<Command>>;

    /// Claim a pending command. Returns `false` if it is no longer pending.
    async fn mark_executing(&self, command_id: &str) -> StorageResult<bool>;

    async fn mark_completed(
        &self,
        command_id: &str,
        duration_ms: u64,
        result: Option<&str>,
    ) -> StorageResult<()>;

    async fn mark_failed(
        &self,
        command_id: &str,
        error_message: &str,
        duration_ms: Option<u64>,
        result: Option<&str>,
    ) -> StorageResult<()>;

    /// Return an executing command to `pending` after `delay`, or fail it
    /// when its retries are used up. Returns the new status.
    async fn reschedule(
        &self,
        command_id: &str,
        error_message: &str,
        delay: Duration,
    ) -> StorageResult<CommandStatus>;

    /// Cancel a pending command. Returns `false` if it was not pending.
    async fn cancel(&self, command_id: &str) -> StorageResult<bool>;

    /// Reset the kiosk's commands left `executing` for longer than `threshold`.
    async fn recover_stale(
        &self,
        kiosk_id: &KioskId,
        threshold: Duration,
    ) -> StorageResult<StaleRecovery>;

    /// Newest commands of the kiosk first.
    async fn list_recent(&self, kiosk_id: &KioskId, limit: u32) -> StorageResult<Vec<Command>>;

    /// The kiosk's `pending` and `executing` commands, oldest first.
    async fn list_active(&self, kiosk_id: &KioskId) -> StorageResult<Vec<Command>>;
}

/// SQLite implementation of [`CommandQueue`]
#[derive(Debug, Clone)]
pub struct SqliteCommandQueue {
    pool: SqlitePool,
}

impl SqliteCommandQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn not_executing(&self, command_id: &str) -> StorageError {
        match self.get(command_id).await {
            Ok(Some(command)) => StorageError::Conflict(format!(
                "command {} is {}, not executing",
                command_id, command.status
            )),
            Ok(None) => StorageError::not_found("Command", "command_id", command_id),
            Err(e) => e,
        }
    }
}

fn delay_delta(delay: Duration) -> StorageResult<TimeDelta> {
    TimeDelta::from_std(delay)
        .map_err(|e| StorageError::Validation(format!("delay out of range: {}", e)))
}

impl CommandQueue for SqliteCommandQueue {
    async fn enqueue(&self, command: &NewCommand) -> StorageResult<Enqueued> {
        let command_id = match &command.command_id {
            Some(id) if id.trim().is_empty() => {
                return Err(StorageError::Validation("command_id must not be empty".into()));
            }
            Some(id) => id.clone(),
            None => Uuid::new_v4().to_string(),
        };
        let payload = command.payload.to_json()?;

        let result = sqlx::query(
            r#"
            INSERT INTO commands (
                command_id, kiosk_id, command_type, payload, status,
                retry_count, max_retries, created_at
            )
            VALUES (?, ?, ?, ?, 'pending', 0, ?, ?)
            ON CONFLICT (command_id) DO NOTHING
            "#,
        )
        .bind(&command_id)
        .bind(command.kiosk_id.as_str())
        .bind(command.payload.command_type().as_str())
        .bind(&payload)
        .bind(command.max_retries)
        .bind(now())
        .execute(&self.pool)
        .await?;

        let created = result.rows_affected() == 1;
        if created {
            debug!(
                command_id = %command_id,
                kiosk = %command.kiosk_id,
                command_type = %command.payload.command_type(),
                "Command enqueued"
            );
        } else {
            info!(command_id = %command_id, "Duplicate command ignored");
        }

        Ok(Enqueued {
            command_id,
            created,
        })
    }

    async fn get(&self, command_id: &str) -> StorageResult<Option<Command>> {
        let command = sqlx::query_as::<_, Command>(&format!(
            "SELECT {COMMAND_COLUMNS} FROM commands WHERE command_id = ?"
        ))
        .bind(command_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(command)
    }

    async fn next_pending(&self, kiosk_id: &KioskId) -> StorageResult<Option<Command>> {
        let command = sqlx::query_as::<_, Command>(&format!(
            r#"
            SELECT {COMMAND_COLUMNS}
            FROM commands
            WHERE kiosk_id = ?
              AND status = 'pending'
              AND (next_attempt_at IS NULL OR next_attempt_at <= ?)
            ORDER BY created_at, rowid
            LIMIT 1
            "#
        ))
        .bind(kiosk_id.as_str())
        .bind(now())
        .fetch_optional(&self.pool)
        .await?;

        Ok(command)
    }

    async fn mark_executing(&self, command_id: &str) -> StorageResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE commands
            SET status = 'executing', started_at = ?, completed_at = NULL
            WHERE command_id = ? AND status = 'pending'
            "#,
        )
        .bind(now())
        .bind(command_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_completed(
        &self,
        command_id: &str,
        duration_ms: u64,
        result: Option<&str>,
    ) -> StorageResult<()> {
        let updated = sqlx::query(
            r#"
            UPDATE commands
            SET status = 'completed', completed_at = ?, duration_ms = ?,
                error_message = NULL, result = ?
            WHERE command_id = ? AND status = 'executing'
            "#,
        )
        .bind(now())
        .bind(duration_ms as i64)
        .bind(result)
        .bind(command_id)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(self.not_executing(command_id).await);
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        command_id: &str,
        error_message: &str,
        duration_ms: Option<u64>,
        result: Option<&str>,
    ) -> StorageResult<()> {
        let updated = sqlx::query(
            r#"
            UPDATE commands
            SET status = 'failed', completed_at = ?, duration_ms = ?,
                error_message = ?, result = ?
            WHERE command_id = ? AND status = 'executing'
            "#,
        )
        .bind(now())
        .bind(duration_ms.map(|ms| ms as i64))
        .bind(error_message)
        .bind(result)
        .bind(command_id)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(self.not_executing(command_id).await);
        }
        Ok(())
    }

    async fn reschedule(
        &self,
        command_id: &str,
        error_message: &str,
        delay: Duration,
    ) -> StorageResult<CommandStatus> {
        let at = now();
        let next_attempt = at + delay_delta(delay)?;

        // SET expressions all read the pre-update row.
        let status: Option<(String,)> = sqlx::query_as(
            r#"
            UPDATE commands
            SET status = CASE WHEN retry_count < max_retries THEN 'pending' ELSE 'failed' END,
                retry_count = CASE WHEN retry_count < max_retries
                                   THEN retry_count + 1 ELSE retry_count END,
                next_attempt_at = CASE WHEN retry_count < max_retries
                                       THEN ? ELSE next_attempt_at END,
                started_at = CASE WHEN retry_count < max_retries THEN NULL ELSE started_at END,
                completed_at = CASE WHEN retry_count < max_retries THEN NULL ELSE ? END,
                error_message = ?
            WHERE command_id = ? AND status = 'executing'
            RETURNING status
            "#,
        )
        .bind(next_attempt)
        .bind(at)
        .bind(error_message)
        .bind(command_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some((status,)) = status else {
            return Err(self.not_executing(command_id).await);
        };
        let status: CommandStatus = status.parse()?;
        if status == CommandStatus::Failed {
            warn!(command_id, "Retries exhausted: {}", error_message);
        } else {
            debug!(command_id, delay_ms = delay.as_millis() as u64, "Command rescheduled");
        }
        Ok(status)
    }

    async fn cancel(&self, command_id: &str) -> StorageResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE commands
            SET status = 'cancelled', completed_at = ?
            WHERE command_id = ? AND status = 'pending'
            "#,
        )
        .bind(now())
        .bind(command_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn recover_stale(
        &self,
        kiosk_id: &KioskId,
        threshold: Duration,
    ) -> StorageResult<StaleRecovery> {
        let at = now();
        let cutoff = at - delay_delta(threshold)?;

        let statuses: Vec<(String,)> = sqlx::query_as(
            r#"
            UPDATE commands
            SET status = CASE WHEN retry_count < max_retries THEN 'pending' ELSE 'failed' END,
                retry_count = CASE WHEN retry_count < max_retries
                                   THEN retry_count + 1 ELSE retry_count END,
                started_at = CASE WHEN retry_count < max_retries THEN NULL ELSE started_at END,
                next_attempt_at = NULL,
                completed_at = CASE WHEN retry_count < max_retries THEN NULL ELSE ? END,
                error_message = CASE WHEN retry_count < max_retries
                                     THEN error_message ELSE ? END
            WHERE kiosk_id = ? AND status = 'executing' AND started_at < ?
            RETURNING status
            "#,
        )
        .bind(at)
        .bind(STALE_RECOVERY_MESSAGE)
        .bind(kiosk_id.as_str())
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        let mut recovery = StaleRecovery::default();
        for (status,) in statuses {
            if status == CommandStatus::Pending.as_str() {
                recovery.requeued += 1;
            } else {
                recovery.failed += 1;
            }
        }

        if recovery.requeued + recovery.failed > 0 {
            warn!(
                kiosk = %kiosk_id,
                requeued = recovery.requeued,
                failed = recovery.failed,
                "Recovered stale commands"
            );
        }
        Ok(recovery)
    }

    async fn list_recent(&self, kiosk_id: &KioskId, limit: u32) -> StorageResult<Vec<Command>> {
        let commands = sqlx::query_as::<_, Command>(&format!(
            r#"
            SELECT {COMMAND_COLUMNS}
            FROM commands
            WHERE kiosk_id = ?
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?
            "#
        ))
        .bind(kiosk_id.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(commands)
    }

    async fn list_active(&self, kiosk_id: &KioskId) -> StorageResult<Vec<Command>> {
        let commands = sqlx::query_as::<_, Command>(&format!(
            r#"
            SELECT {COMMAND_COLUMNS}
            FROM commands
            WHERE kiosk_id = ? AND status IN ('pending', 'executing')
            ORDER BY created_at, rowid
            "#
        ))
        .bind(kiosk_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(commands)
    }
}
