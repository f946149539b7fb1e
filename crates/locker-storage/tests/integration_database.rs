//! Database connection, migrations and schema constraints.

use std::sync::Arc;

use locker_storage::{Database, DatabaseConfig};
use tokio::sync::Barrier;

#[tokio::test]
async fn test_in_memory_database() {
    let db = Database::in_memory().await.unwrap();
    db.health_check().await.unwrap();
    db.close().await;
}

#[tokio::test]
async fn test_file_database_creates_parent_directory() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state").join("lockerd.db");

    let db = Database::new(DatabaseConfig::new(path.to_string_lossy()))
        .await
        .unwrap();
    db.health_check().await.unwrap();
    db.close().await;

    assert!(path.exists());
}

#[tokio::test]
async fn test_concurrent_queries_share_pool() {
    let db = Database::in_memory().await.unwrap();

    const TASKS: usize = 8;
    let barrier = Arc::new(Barrier::new(TASKS));

    let handles: Vec<_> = (0..TASKS)
        .map(|i| {
            let db = db.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                let row: (i64,) = sqlx::query_as("SELECT ?")
                    .bind(i as i64)
                    .fetch_one(db.pool())
                    .await
                    .unwrap();
                row.0
            })
        })
        .collect();

    let results = futures::future::join_all(handles).await;
    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap(), i as i64);
    }

    db.close().await;
}

#[tokio::test]
async fn test_migration_idempotency() {
    let db = Database::in_memory().await.unwrap();
    db.migrate().await.unwrap();
    db.migrate().await.unwrap();

    let tables: Vec<(String,)> = sqlx::query_as(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name IN ('lockers', 'commands') ORDER BY name",
    )
    .fetch_all(db.pool())
    .await
    .unwrap();

    assert_eq!(
        tables.into_iter().map(|t| t.0).collect::<Vec<_>>(),
        vec!["commands".to_string(), "lockers".to_string()]
    );
}

#[tokio::test]
async fn test_schema_rejects_owner_on_free_locker() {
    let db = Database::in_memory().await.unwrap();

    let result = sqlx::query(
        r#"
        INSERT INTO lockers (kiosk_id, locker_id, status, owner_type, owner_id, updated_at)
        VALUES ('k1', 1, 'Free', 'rfid', '04ABCDEF', '2025-01-01T00:00:00+00:00')
        "#,
    )
    .execute(db.pool())
    .await;
    assert!(result.is_err());

    let result = sqlx::query(
        r#"
        INSERT INTO lockers (kiosk_id, locker_id, status, updated_at)
        VALUES ('k1', 1, 'Owned', '2025-01-01T00:00:00+00:00')
        "#,
    )
    .execute(db.pool())
    .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_schema_rejects_executing_without_start() {
    let db = Database::in_memory().await.unwrap();

    let result = sqlx::query(
        r#"
        INSERT INTO commands (command_id, kiosk_id, command_type, payload, status, created_at)
        VALUES ('c1', 'k1', 'open_locker', '{"locker_id":1}', 'executing',
                '2025-01-01T00:00:00+00:00')
        "#,
    )
    .execute(db.pool())
    .await;
    assert!(result.is_err());
}
