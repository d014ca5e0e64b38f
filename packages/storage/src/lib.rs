// ABOUTME: SQLite pool construction, embedded migrations and shared storage errors
// ABOUTME: Every Corral store receives the pool built here through its constructor

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid status: {0}")]
    InvalidStatus(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Open (creating if missing) the database at `database_url` and apply migrations
pub async fn connect(database_url: &str) -> Result<SqlitePool> {
    info!("Opening database: {}", database_url);

    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;

    migrate(&pool).await?;
    Ok(pool)
}

/// Private in-memory database with migrations applied
///
/// A single connection is used so every query sees the same database.
pub async fn connect_in_memory() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;

    migrate(&pool).await?;
    Ok(pool)
}

pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    MIGRATOR.run(pool).await?;
    debug!("Database migrations applied");
    Ok(())
}

/// Generate a prefixed opaque identifier, e.g. `ses_V1StGXR8Z5jdHi6BmyT`
pub fn generate_id(prefix: &str) -> String {
    format!("{}_{}", prefix, nanoid::nanoid!())
}

/// Parse an RFC 3339 timestamp column
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::InvalidInput(format!("bad timestamp {:?}: {}", raw, e)))
}

pub fn parse_optional_timestamp(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_timestamp).transpose()
}

/// Encode a string collection as a JSON array column
pub fn encode_string_set<'a, I>(values: I) -> Result<String>
where
    I: IntoIterator<Item = &'a String>,
{
    let values: Vec<&String> = values.into_iter().collect();
    Ok(serde_json::to_string(&values)?)
}

/// Decode a JSON array column into any string collection
pub fn decode_string_set<C>(raw: &str) -> Result<C>
where
    C: FromIterator<String>,
{
    let values: Vec<String> = serde_json::from_str(raw)?;
    Ok(values.into_iter().collect())
}
