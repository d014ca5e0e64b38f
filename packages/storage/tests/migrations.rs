// ABOUTME: Integration tests for database bootstrap
// ABOUTME: Verifies migrations create every table on file-backed and in-memory databases

use corral_storage::{connect, connect_in_memory};
use sqlx::SqlitePool;

async fn table_names(pool: &SqlitePool) -> Vec<String> {
    sqlx::query_scalar::<_, String>(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE '\\_%' ESCAPE '\\' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )
    .fetch_all(pool)
    .await
    .expect("Failed to list tables")
}

#[tokio::test]
async fn test_in_memory_database_has_schema() {
    let pool = connect_in_memory().await.expect("Failed to open in-memory db");
    let tables = table_names(&pool).await;
    assert_eq!(
        tables,
        vec!["executions", "sessions", "webhook_deliveries", "webhooks"]
    );
}

#[tokio::test]
async fn test_file_database_is_created_and_reopened() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let url = format!("sqlite://{}", dir.path().join("corral.db").display());

    let pool = connect(&url).await.expect("Failed to create database");
    sqlx::query(
        "INSERT INTO sessions (id, state, created_at, last_active_at) VALUES ('ses_1', 'created', '2025-01-01T00:00:00Z', '2025-01-01T00:00:00Z')",
    )
    .execute(&pool)
    .await
    .expect("Failed to insert session");
    pool.close().await;

    // Migrations are idempotent on reopen
    let pool = connect(&url).await.expect("Failed to reopen database");
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sessions")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn test_state_check_constraint() {
    let pool = connect_in_memory().await.unwrap();
    let result = sqlx::query(
        "INSERT INTO sessions (id, state, created_at, last_active_at) VALUES ('ses_1', 'paused', '2025-01-01T00:00:00Z', '2025-01-01T00:00:00Z')",
    )
    .execute(&pool)
    .await;
    assert!(result.is_err());
}
