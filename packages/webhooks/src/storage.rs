// ABOUTME: SQLite persistence for webhooks and their delivery records
// ABOUTME: Pending deliveries double as the retry queue that is resumed at startup

use crate::types::{Delivery, DeliveryStatus, Webhook, WebhookEventKind};
use chrono::Utc;
use corral_storage::{parse_timestamp, Result, StorageError};
use sqlx::{Row, SqlitePool};
use std::collections::BTreeSet;

const DELIVERY_COLUMNS: &str = "id, webhook_id, event_id, event_kind, payload, status, attempts, \
                                last_status_code, last_error, created_at, updated_at";

#[derive(Clone)]
pub struct WebhookStorage {
    pool: SqlitePool,
}

impl WebhookStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert_webhook(&self, webhook: &Webhook) -> Result<()> {
        sqlx::query(
            "INSERT INTO webhooks (id, url, events, enabled, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&webhook.id)
        .bind(&webhook.url)
        .bind(serde_json::to_string(&webhook.events)?)
        .bind(webhook.enabled)
        .bind(webhook.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_webhook(&self, id: &str) -> Result<Webhook> {
        let row = sqlx::query("SELECT id, url, events, enabled, created_at FROM webhooks WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => row_to_webhook(row),
            None => Err(StorageError::NotFound(id.to_string())),
        }
    }

    pub async fn list_webhooks(&self) -> Result<Vec<Webhook>> {
        let rows = sqlx::query(
            "SELECT id, url, events, enabled, created_at FROM webhooks ORDER BY created_at, id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_webhook).collect()
    }

    /// Enabled webhooks subscribed to `kind`
    pub async fn subscribers(&self, kind: WebhookEventKind) -> Result<Vec<Webhook>> {
        let rows = sqlx::query(
            "SELECT id, url, events, enabled, created_at FROM webhooks WHERE enabled = 1 ORDER BY created_at, id",
        )
        .fetch_all(&self.pool)
        .await?;

        let webhooks = rows
            .into_iter()
            .map(row_to_webhook)
            .collect::<Result<Vec<_>>>()?;
        Ok(webhooks
            .into_iter()
            .filter(|webhook| webhook.subscribes_to(kind))
            .collect())
    }

    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let result = sqlx::query("UPDATE webhooks SET enabled = ?1 WHERE id = ?2")
            .bind(enabled)
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Removes the webhook and, by cascade, its delivery records
    pub async fn delete_webhook(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM webhooks WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn insert_delivery(&self, delivery: &Delivery) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO webhook_deliveries (
                id, webhook_id, event_id, event_kind, payload, status, attempts,
                last_status_code, last_error, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(&delivery.id)
        .bind(&delivery.webhook_id)
        .bind(&delivery.event_id)
        .bind(delivery.event_kind.as_str())
        .bind(serde_json::to_string(&delivery.payload)?)
        .bind(delivery.status.as_str())
        .bind(delivery.attempts as i64)
        .bind(delivery.last_status_code.map(i64::from))
        .bind(&delivery.last_error)
        .bind(delivery.created_at.to_rfc3339())
        .bind(delivery.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Record the outcome of an attempt
    pub async fn update_delivery(
        &self,
        id: &str,
        status: DeliveryStatus,
        attempts: u32,
        last_status_code: Option<u16>,
        last_error: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_deliveries
            SET status = ?1, attempts = ?2, last_status_code = ?3, last_error = ?4, updated_at = ?5
            WHERE id = ?6
            "#,
        )
        .bind(status.as_str())
        .bind(attempts as i64)
        .bind(last_status_code.map(i64::from))
        .bind(last_error)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn get_delivery(&self, id: &str) -> Result<Delivery> {
        let query = format!(
            "SELECT {} FROM webhook_deliveries WHERE id = ?1",
            DELIVERY_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => row_to_delivery(row),
            None => Err(StorageError::NotFound(id.to_string())),
        }
    }

    /// Newest first
    pub async fn list_deliveries(&self, webhook_id: &str, limit: i64) -> Result<Vec<Delivery>> {
        let query = format!(
            "SELECT {} FROM webhook_deliveries WHERE webhook_id = ?1 \
             ORDER BY created_at DESC, id DESC LIMIT ?2",
            DELIVERY_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(webhook_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(row_to_delivery).collect()
    }

    /// Oldest first, so resumed deliveries keep their original order
    pub async fn pending_deliveries(&self) -> Result<Vec<Delivery>> {
        let query = format!(
            "SELECT {} FROM webhook_deliveries WHERE status = 'pending' ORDER BY created_at, id",
            DELIVERY_COLUMNS
        );
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;

        rows.into_iter().map(row_to_delivery).collect()
    }
}

fn row_to_webhook(row: sqlx::sqlite::SqliteRow) -> Result<Webhook> {
    let events: BTreeSet<WebhookEventKind> =
        serde_json::from_str(&row.get::<String, _>("events"))?;

    Ok(Webhook {
        id: row.get("id"),
        url: row.get("url"),
        events,
        enabled: row.get("enabled"),
        created_at: parse_timestamp(&row.get::<String, _>("created_at"))?,
    })
}

fn row_to_delivery(row: sqlx::sqlite::SqliteRow) -> Result<Delivery> {
    let raw_kind: String = row.get("event_kind");
    let event_kind = WebhookEventKind::parse(&raw_kind)
        .ok_or_else(|| StorageError::InvalidInput(format!("unknown event kind {}", raw_kind)))?;
    let last_status_code = row
        .get::<Option<i64>, _>("last_status_code")
        .and_then(|code| u16::try_from(code).ok());

    Ok(Delivery {
        id: row.get("id"),
        webhook_id: row.get("webhook_id"),
        event_id: row.get("event_id"),
        event_kind,
        payload: serde_json::from_str(&row.get::<String, _>("payload"))?,
        status: DeliveryStatus::from_str(&row.get::<String, _>("status"))?,
        attempts: row.get::<i64, _>("attempts").max(0) as u32,
        last_status_code,
        last_error: row.get("last_error"),
        created_at: parse_timestamp(&row.get::<String, _>("created_at"))?,
        updated_at: parse_timestamp(&row.get::<String, _>("updated_at"))?,
    })
}
