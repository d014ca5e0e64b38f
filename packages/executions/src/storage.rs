// ABOUTME: SQLite persistence for execution records
// ABOUTME: Records are written on submission, on start and once at their terminal status

use crate::types::{ErrorDetail, Execution, ExecutionStatus};
use chrono::{DateTime, Utc};
use corral_storage::{
    decode_string_set, encode_string_set, parse_optional_timestamp, parse_timestamp, Result,
    StorageError,
};
use sqlx::{Row, SqlitePool};
use tracing::debug;

const EXECUTION_COLUMNS: &str = "id, session_id, prompt, max_turns, timeout_seconds, allowed_tools, \
                                 disallowed_tools, effective_tools, status, exit_code, response, error, \
                                 error_detail, duration_ms, turns, created_at, started_at, ended_at";

#[derive(Clone)]
pub struct ExecutionStorage {
    pool: SqlitePool,
}

impl ExecutionStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, execution: &Execution) -> Result<()> {
        debug!(
            execution_id = %execution.id,
            session_id = %execution.session_id,
            "Recording execution"
        );

        sqlx::query(
            r#"
            INSERT INTO executions (
                id, session_id, prompt, max_turns, timeout_seconds, allowed_tools,
                disallowed_tools, effective_tools, status, turns, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(&execution.id)
        .bind(&execution.session_id)
        .bind(&execution.prompt)
        .bind(execution.max_turns as i64)
        .bind(execution.timeout_seconds as i64)
        .bind(encode_string_set(&execution.allowed_tools)?)
        .bind(encode_string_set(&execution.disallowed_tools)?)
        .bind(encode_string_set(&execution.effective_tools)?)
        .bind(execution.status.as_str())
        .bind(execution.turns as i64)
        .bind(execution.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn mark_running(&self, id: &str, started_at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE executions SET status = 'running', started_at = ?1 WHERE id = ?2 AND status = 'queued'",
        )
        .bind(started_at.to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Write the terminal outcome; a record that is already terminal is left alone
    pub async fn complete(&self, execution: &Execution) -> Result<()> {
        if !execution.status.is_terminal() {
            return Err(StorageError::InvalidStatus(execution.status.to_string()));
        }

        let result = sqlx::query(
            r#"
            UPDATE executions
            SET status = ?1, exit_code = ?2, response = ?3, error = ?4, error_detail = ?5,
                duration_ms = ?6, turns = ?7, started_at = ?8, ended_at = ?9
            WHERE id = ?10 AND status IN ('queued', 'running')
            "#,
        )
        .bind(execution.status.as_str())
        .bind(execution.exit_code)
        .bind(&execution.response)
        .bind(&execution.error)
        .bind(execution.error_detail.map(|d| d.as_str()))
        .bind(execution.duration_ms.map(|ms| ms as i64))
        .bind(execution.turns as i64)
        .bind(execution.started_at.map(|t| t.to_rfc3339()))
        .bind(execution.ended_at.map(|t| t.to_rfc3339()))
        .bind(&execution.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(execution.id.clone()));
        }
        Ok(())
    }

    pub async fn get(&self, session_id: &str, id: &str) -> Result<Execution> {
        let query = format!(
            "SELECT {} FROM executions WHERE id = ?1 AND session_id = ?2",
            EXECUTION_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(id)
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => row_to_execution(row),
            None => Err(StorageError::NotFound(id.to_string())),
        }
    }

    /// Newest first, with the total count for pagination
    pub async fn list(
        &self,
        session_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<Execution>, i64)> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM executions WHERE session_id = ?1")
            .bind(session_id)
            .fetch_one(&self.pool)
            .await?;

        let query = format!(
            "SELECT {} FROM executions WHERE session_id = ?1 \
             ORDER BY created_at DESC, id DESC LIMIT ?2 OFFSET ?3",
            EXECUTION_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(session_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        let executions = rows
            .into_iter()
            .map(row_to_execution)
            .collect::<Result<Vec<_>>>()?;
        Ok((executions, total))
    }

    /// Fail every execution left Queued or Running by a previous process
    pub async fn fail_unfinished(&self, reason: &str) -> Result<u64> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            r#"
            UPDATE executions
            SET status = 'failed', error = ?1, error_detail = ?2, ended_at = ?3
            WHERE status IN ('queued', 'running')
            "#,
        )
        .bind(reason)
        .bind(ErrorDetail::RunnerFault.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

fn row_to_execution(row: sqlx::sqlite::SqliteRow) -> Result<Execution> {
    let error_detail = match row.get::<Option<String>, _>("error_detail") {
        Some(raw) => Some(
            ErrorDetail::parse(&raw)
                .ok_or_else(|| StorageError::InvalidInput(format!("unknown error detail {}", raw)))?,
        ),
        None => None,
    };

    Ok(Execution {
        id: row.get("id"),
        session_id: row.get("session_id"),
        prompt: row.get("prompt"),
        max_turns: row.get::<i64, _>("max_turns").max(0) as u32,
        timeout_seconds: row.get::<i64, _>("timeout_seconds").max(0) as u64,
        allowed_tools: decode_string_set(&row.get::<String, _>("allowed_tools"))?,
        disallowed_tools: decode_string_set(&row.get::<String, _>("disallowed_tools"))?,
        effective_tools: decode_string_set(&row.get::<String, _>("effective_tools"))?,
        status: ExecutionStatus::from_str(&row.get::<String, _>("status"))?,
        exit_code: row.get("exit_code"),
        response: row.get("response"),
        error: row.get("error"),
        error_detail,
        duration_ms: row
            .get::<Option<i64>, _>("duration_ms")
            .map(|ms| ms.max(0) as u64),
        turns: row.get::<i64, _>("turns").max(0) as u32,
        created_at: parse_timestamp(&row.get::<String, _>("created_at"))?,
        started_at: parse_optional_timestamp(row.get("started_at"))?,
        ended_at: parse_optional_timestamp(row.get("ended_at"))?,
    })
}
