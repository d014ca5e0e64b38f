// ABOUTME: SQLite persistence for session records
// ABOUTME: The registry is the only writer; reads back records for listing and recovery

use crate::types::{Session, SessionState};
use chrono::{DateTime, Utc};
use corral_sandbox::SandboxHandle;
use corral_storage::{parse_timestamp, Result, StorageError};
use sqlx::{Row, SqlitePool};

const SESSION_COLUMNS: &str = "id, state, sandbox_id, sandbox_provider, current_execution_id, \
                               error_message, created_at, last_active_at";

#[derive(Clone)]
pub struct SessionStorage {
    pool: SqlitePool,
}

impl SessionStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, session: &Session) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (
                id, state, sandbox_id, sandbox_provider, current_execution_id,
                error_message, created_at, last_active_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(&session.id)
        .bind(session.state.as_str())
        .bind(session.sandbox.as_ref().map(|h| h.id.as_str()))
        .bind(session.sandbox.as_ref().map(|h| h.provider.as_str()))
        .bind(&session.current_execution_id)
        .bind(&session.error_message)
        .bind(session.created_at.to_rfc3339())
        .bind(session.last_active_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Session> {
        let query = format!("SELECT {} FROM sessions WHERE id = ?1", SESSION_COLUMNS);
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => row_to_session(row),
            None => Err(StorageError::NotFound(id.to_string())),
        }
    }

    /// Newest first, with the total count for pagination
    pub async fn list(&self, limit: i64, offset: i64) -> Result<(Vec<Session>, i64)> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sessions")
            .fetch_one(&self.pool)
            .await?;

        let query = format!(
            "SELECT {} FROM sessions ORDER BY created_at DESC, id DESC LIMIT ?1 OFFSET ?2",
            SESSION_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        let sessions = rows
            .into_iter()
            .map(row_to_session)
            .collect::<Result<Vec<_>>>()?;
        Ok((sessions, total))
    }

    pub async fn list_in_states(&self, states: &[SessionState]) -> Result<Vec<Session>> {
        if states.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders: Vec<String> = (1..=states.len()).map(|i| format!("?{}", i)).collect();
        let query = format!(
            "SELECT {} FROM sessions WHERE state IN ({}) ORDER BY created_at",
            SESSION_COLUMNS,
            placeholders.join(", ")
        );

        let mut q = sqlx::query(&query);
        for state in states {
            q = q.bind(state.as_str());
        }
        let rows = q.fetch_all(&self.pool).await?;

        rows.into_iter().map(row_to_session).collect()
    }

    /// Persist lifecycle fields; `current_execution_id` is written separately
    pub async fn update(&self, session: &Session) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE sessions
            SET state = ?1, sandbox_id = ?2, sandbox_provider = ?3,
                error_message = ?4, last_active_at = ?5
            WHERE id = ?6
            "#,
        )
        .bind(session.state.as_str())
        .bind(session.sandbox.as_ref().map(|h| h.id.as_str()))
        .bind(session.sandbox.as_ref().map(|h| h.provider.as_str()))
        .bind(&session.error_message)
        .bind(session.last_active_at.to_rfc3339())
        .bind(&session.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(session.id.clone()));
        }
        Ok(())
    }

    pub async fn set_current_execution(&self, id: &str, execution_id: Option<&str>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE sessions SET current_execution_id = ?1, last_active_at = ?2 WHERE id = ?3",
        )
        .bind(execution_id)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Clear the current execution only if it still names `execution_id`
    pub async fn clear_current_execution(&self, id: &str, execution_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE sessions SET current_execution_id = NULL WHERE id = ?1 AND current_execution_id = ?2",
        )
        .bind(id)
        .bind(execution_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn touch(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query("UPDATE sessions SET last_active_at = ?1 WHERE id = ?2")
            .bind(at.to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM sessions WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(id.to_string()));
        }
        Ok(())
    }
}

fn row_to_session(row: sqlx::sqlite::SqliteRow) -> Result<Session> {
    let sandbox = match (
        row.get::<Option<String>, _>("sandbox_id"),
        row.get::<Option<String>, _>("sandbox_provider"),
    ) {
        (Some(id), Some(provider)) => Some(SandboxHandle { id, provider }),
        _ => None,
    };

    Ok(Session {
        id: row.get("id"),
        state: SessionState::from_str(&row.get::<String, _>("state"))?,
        sandbox,
        current_execution_id: row.get("current_execution_id"),
        error_message: row.get("error_message"),
        created_at: parse_timestamp(&row.get::<String, _>("created_at"))?,
        last_active_at: parse_timestamp(&row.get::<String, _>("last_active_at"))?,
    })
}
