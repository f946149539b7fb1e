//! Command queue lifecycle against an in-memory database.

use std::time::Duration;

use locker_core::constants::STALE_RECOVERY_MESSAGE;
use locker_core::{CommandStatus, CommandType, KioskId, LockerId, OpenPurpose};
use locker_storage::models::{CommandPayload, NewCommand};
use locker_storage::{CommandQueue, Database, SqliteCommandQueue, StorageError};
use rstest::rstest;

fn kiosk(id: &str) -> KioskId {
    KioskId::new(id).unwrap()
}

fn open(locker: u16) -> CommandPayload {
    CommandPayload::open(LockerId::new(locker).unwrap(), OpenPurpose::Release, None)
}

async fn setup() -> (Database, SqliteCommandQueue) {
    let db = Database::in_memory().await.unwrap();
    let queue = SqliteCommandQueue::new(db.pool().clone());
    (db, queue)
}

/// Age a command's start time so stale recovery picks it up.
async fn backdate_start(db: &Database, command_id: &str, secs: i64) {
    let started = chrono::Utc::now() - chrono::TimeDelta::seconds(secs);
    sqlx::query("UPDATE commands SET started_at = ? WHERE command_id = ?")
        .bind(started)
        .bind(command_id)
        .execute(db.pool())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_enqueue_generates_id() {
    let (_db, queue) = setup().await;

    let enqueued = queue
        .enqueue(&NewCommand::new(kiosk("k1"), open(3)))
        .await
        .unwrap();
    assert!(enqueued.created);
    assert!(uuid::Uuid::parse_str(&enqueued.command_id).is_ok());

    let command = queue.get(&enqueued.command_id).await.unwrap().unwrap();
    assert_eq!(command.status, CommandStatus::Pending);
    assert_eq!(command.command_type, CommandType::OpenLocker);
    assert_eq!(command.retry_count, 0);
    assert_eq!(command.max_retries, 3);
    assert_eq!(command.payload().unwrap(), open(3));
    assert!(command.started_at.is_none());
}

#[tokio::test]
async fn test_enqueue_is_idempotent() {
    let (db, queue) = setup().await;
    let command = NewCommand::new(kiosk("k1"), open(3)).with_id("req-1");

    let first = queue.enqueue(&command).await.unwrap();
    let second = queue
        .enqueue(&NewCommand::new(kiosk("k1"), open(9)).with_id("req-1"))
        .await
        .unwrap();

    assert!(first.created);
    assert!(!second.created);
    assert_eq!(second.command_id, "req-1");

    let (rows,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM commands")
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(rows, 1);

    // The original payload wins.
    let stored = queue.get("req-1").await.unwrap().unwrap();
    assert_eq!(stored.payload().unwrap(), open(3));
}

#[tokio::test]
async fn test_enqueue_rejects_blank_id() {
    let (_db, queue) = setup().await;
    let error = queue
        .enqueue(&NewCommand::new(kiosk("k1"), open(1)).with_id("  "))
        .await
        .unwrap_err();
    assert!(matches!(error, StorageError::Validation(_)));
}

#[tokio::test]
async fn test_next_pending_is_fifo_per_kiosk() {
    let (_db, queue) = setup().await;
    for (id, kiosk_id) in [("a", "k1"), ("b", "k2"), ("c", "k1")] {
        queue
            .enqueue(&NewCommand::new(kiosk(kiosk_id), open(1)).with_id(id))
            .await
            .unwrap();
    }

    let next = queue.next_pending(&kiosk("k1")).await.unwrap().unwrap();
    assert_eq!(next.command_id, "a");
    assert!(queue.mark_executing("a").await.unwrap());

    let next = queue.next_pending(&kiosk("k1")).await.unwrap().unwrap();
    assert_eq!(next.command_id, "c");

    let next = queue.next_pending(&kiosk("k2")).await.unwrap().unwrap();
    assert_eq!(next.command_id, "b");

    assert!(queue.next_pending(&kiosk("k3")).await.unwrap().is_none());
}

#[tokio::test]
async fn test_mark_executing_claims_once() {
    let (_db, queue) = setup().await;
    queue
        .enqueue(&NewCommand::new(kiosk("k1"), open(1)).with_id("c1"))
        .await
        .unwrap();

    assert!(queue.mark_executing("c1").await.unwrap());
    assert!(!queue.mark_executing("c1").await.unwrap());
    assert!(!queue.mark_executing("missing").await.unwrap());

    let command = queue.get("c1").await.unwrap().unwrap();
    assert_eq!(command.status, CommandStatus::Executing);
    assert!(command.started_at.is_some());
    assert!(command.completed_at.is_none());
}

#[tokio::test]
async fn test_mark_completed_records_duration() {
    let (_db, queue) = setup().await;
    queue
        .enqueue(&NewCommand::new(kiosk("k1"), open(1)).with_id("c1"))
        .await
        .unwrap();
    queue.mark_executing("c1").await.unwrap();

    queue.mark_completed("c1", 412, None).await.unwrap();

    let command = queue.get("c1").await.unwrap().unwrap();
    assert_eq!(command.status, CommandStatus::Completed);
    assert_eq!(command.duration_ms, Some(412));
    assert!(command.completed_at.is_some());
    assert!(command.error_message.is_none());
}

#[tokio::test]
async fn test_mark_failed_keeps_error_and_result() {
    let (_db, queue) = setup().await;
    queue
        .enqueue(&NewCommand::new(kiosk("k1"), open(1)).with_id("c1"))
        .await
        .unwrap();
    queue.mark_executing("c1").await.unwrap();

    queue
        .mark_failed("c1", "hardware_timeout: no response", Some(1800), Some("[]"))
        .await
        .unwrap();

    let command = queue.get("c1").await.unwrap().unwrap();
    assert_eq!(command.status, CommandStatus::Failed);
    assert_eq!(
        command.error_message.as_deref(),
        Some("hardware_timeout: no response")
    );
    assert_eq!(command.result.as_deref(), Some("[]"));
}

#[tokio::test]
async fn test_terminal_transitions_require_executing() {
    let (_db, queue) = setup().await;
    queue
        .enqueue(&NewCommand::new(kiosk("k1"), open(1)).with_id("c1"))
        .await
        .unwrap();

    let error = queue.mark_completed("c1", 10, None).await.unwrap_err();
    assert!(matches!(error, StorageError::Conflict(_)));

    let error = queue.mark_failed("nope", "x", None, None).await.unwrap_err();
    assert!(matches!(error, StorageError::NotFound { .. }));
}

#[tokio::test]
async fn test_reschedule_until_retries_exhausted() {
    let (_db, queue) = setup().await;
    queue
        .enqueue(
            &NewCommand::new(kiosk("k1"), open(1))
                .with_id("c1")
                .with_max_retries(2),
        )
        .await
        .unwrap();

    for expected_retry in 1..=2 {
        assert!(queue.mark_executing("c1").await.unwrap());
        let status = queue
            .reschedule("c1", "bus_busy: lock not acquired", Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(status, CommandStatus::Pending);

        let command = queue.get("c1").await.unwrap().unwrap();
        assert_eq!(command.retry_count, expected_retry);
        assert!(command.started_at.is_none());
    }

    assert!(queue.mark_executing("c1").await.unwrap());
    let status = queue
        .reschedule("c1", "bus_busy: lock not acquired", Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(status, CommandStatus::Failed);

    let command = queue.get("c1").await.unwrap().unwrap();
    assert_eq!(command.retry_count, 2);
    assert!(command.completed_at.is_some());
}

#[tokio::test]
async fn test_rescheduled_command_waits_for_delay() {
    let (_db, queue) = setup().await;
    queue
        .enqueue(&NewCommand::new(kiosk("k1"), open(1)).with_id("c1"))
        .await
        .unwrap();
    queue.mark_executing("c1").await.unwrap();

    queue
        .reschedule("c1", "hardware_unavailable: port closed", Duration::from_secs(60))
        .await
        .unwrap();

    assert!(queue.next_pending(&kiosk("k1")).await.unwrap().is_none());
    let command = queue.get("c1").await.unwrap().unwrap();
    assert!(command.next_attempt_at.unwrap() > command.created_at);
}

#[tokio::test]
async fn test_cancel_only_pending() {
    let (_db, queue) = setup().await;
    for id in ["c1", "c2"] {
        queue
            .enqueue(&NewCommand::new(kiosk("k1"), open(1)).with_id(id))
            .await
            .unwrap();
    }
    queue.mark_executing("c2").await.unwrap();

    assert!(queue.cancel("c1").await.unwrap());
    assert!(!queue.cancel("c1").await.unwrap());
    assert!(!queue.cancel("c2").await.unwrap());

    assert_eq!(
        queue.get("c1").await.unwrap().unwrap().status,
        CommandStatus::Cancelled
    );
    assert!(!queue.mark_executing("c1").await.unwrap());
}

#[rstest]
#[case::retries_left(3, CommandStatus::Pending)]
#[case::no_retries(0, CommandStatus::Failed)]
#[tokio::test]
async fn test_stale_recovery(#[case] max_retries: u32, #[case] expected: CommandStatus) {
    let (db, queue) = setup().await;
    queue
        .enqueue(
            &NewCommand::new(kiosk("k1"), open(1))
                .with_id("c1")
                .with_max_retries(max_retries),
        )
        .await
        .unwrap();
    queue.mark_executing("c1").await.unwrap();
    backdate_start(&db, "c1", 300).await;

    let recovery = queue
        .recover_stale(&kiosk("k1"), Duration::from_secs(120))
        .await
        .unwrap();
    assert_eq!(recovery.requeued + recovery.failed, 1);

    let command = queue.get("c1").await.unwrap().unwrap();
    assert_eq!(command.status, expected);
    if expected == CommandStatus::Failed {
        assert_eq!(command.error_message.as_deref(), Some(STALE_RECOVERY_MESSAGE));
    } else {
        assert_eq!(command.retry_count, 1);
        assert!(command.started_at.is_none());
    }
}

#[tokio::test]
async fn test_stale_recovery_ignores_recent_commands() {
    let (db, queue) = setup().await;
    for id in ["old", "fresh"] {
        queue
            .enqueue(&NewCommand::new(kiosk("k1"), open(1)).with_id(id))
            .await
            .unwrap();
        queue.mark_executing(id).await.unwrap();
    }
    backdate_start(&db, "old", 600).await;

    let recovery = queue
        .recover_stale(&kiosk("k1"), Duration::from_secs(120))
        .await
        .unwrap();
    assert_eq!(recovery.requeued, 1);
    assert_eq!(recovery.failed, 0);
    assert_eq!(
        queue.get("fresh").await.unwrap().unwrap().status,
        CommandStatus::Executing
    );
}

#[tokio::test]
async fn test_stale_recovery_is_per_kiosk() {
    let (db, queue) = setup().await;
    queue
        .enqueue(&NewCommand::new(kiosk("k2"), open(1)).with_id("other"))
        .await
        .unwrap();
    queue.mark_executing("other").await.unwrap();
    backdate_start(&db, "other", 600).await;

    let recovery = queue
        .recover_stale(&kiosk("k1"), Duration::from_secs(120))
        .await
        .unwrap();
    assert_eq!(recovery, Default::default());
    assert_eq!(
        queue.get("other").await.unwrap().unwrap().status,
        CommandStatus::Executing
    );
}

#[tokio::test]
async fn test_list_recent_newest_first() {
    let (_db, queue) = setup().await;
    for id in ["c1", "c2", "c3"] {
        queue
            .enqueue(&NewCommand::new(kiosk("k1"), open(1)).with_id(id))
            .await
            .unwrap();
    }

    let recent = queue.list_recent(&kiosk("k1"), 2).await.unwrap();
    let ids: Vec<&str> = recent.iter().map(|c| c.command_id.as_str()).collect();
    assert_eq!(ids, vec!["c3", "c2"]);
}

#[tokio::test]
async fn test_list_active_skips_settled_commands() {
    let (_db, queue) = setup().await;
    for id in ["done", "running", "queued", "dropped"] {
        queue
            .enqueue(&NewCommand::new(kiosk("k1"), open(1)).with_id(id))
            .await
            .unwrap();
    }
    queue
        .enqueue(&NewCommand::new(kiosk("k2"), open(1)).with_id("elsewhere"))
        .await
        .unwrap();

    assert!(queue.mark_executing("done").await.unwrap());
    queue.mark_completed("done", 5, None).await.unwrap();
    assert!(queue.mark_executing("running").await.unwrap());
    assert!(queue.cancel("dropped").await.unwrap());

    let active = queue.list_active(&kiosk("k1")).await.unwrap();
    let ids: Vec<&str> = active.iter().map(|c| c.command_id.as_str()).collect();
    assert_eq!(ids, vec!["running", "queued"]);
}
