//! SQLite-backed store for DNSBL lookup results.
//!
//! One row per IP address. Writes are upserts keyed on `ip_address`: a
//! repeat write refreshes `response_code` and `updated_at` and leaves the
//! row's `uuid` and `created_at` alone.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteStatement,
};
use sqlx::{Executor, Row, Statement};
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS ip_details (
    uuid TEXT PRIMARY KEY NOT NULL,
    ip_address TEXT NOT NULL UNIQUE,
    response_code TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

const GET_SQL: &str = r#"
SELECT uuid, ip_address, response_code, created_at, updated_at
FROM ip_details
WHERE ip_address = ?
"#;

const UPSERT_SQL: &str = r#"
INSERT INTO ip_details (uuid, ip_address, response_code, created_at, updated_at)
VALUES (?, ?, ?, ?, ?)
ON CONFLICT(ip_address) DO UPDATE SET
    response_code = excluded.response_code,
    updated_at = excluded.updated_at
"#;

/// Lookup result for one IP address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReputationRecord {
    /// Row identifier, fixed at first insert.
    pub id: String,
    pub ip_address: String,
    /// DNSBL response code, the not-listed sentinel, or an error description.
    pub response_code: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReputationRecord {
    /// Create a record with a fresh id and both timestamps set to now.
    pub fn new(ip_address: &str, response_code: impl Into<String>) -> Self {
        let now = Utc::now().trunc_subsecs(0);
        Self {
            id: Uuid::new_v4().to_string(),
            ip_address: ip_address.to_string(),
            response_code: response_code.into(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Check the fields required for persisting.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.id.is_empty() || self.ip_address.is_empty() || self.response_code.is_empty() {
            return Err(StoreError::Validation(
                "id, ip_address, and response_code must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Error from a store operation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Input rejected before touching the database.
    #[error("{0}")]
    Validation(String),

    /// The store has been closed.
    #[error("store is closed")]
    Closed,

    /// Database query or connection failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored timestamp could not be parsed.
    #[error("failed to parse {column}: {source}")]
    Timestamp {
        column: &'static str,
        #[source]
        source: chrono::ParseError,
    },

    /// Creating the database directory failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Format a timestamp the way it is stored.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_timestamp(column: &'static str, value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|source| StoreError::Timestamp { column, source })
}

/// Statements prepared on first use.
struct Statements {
    get: SqliteStatement<'static>,
    upsert: SqliteStatement<'static>,
}

/// Persistent store of reputation records.
pub struct ResultStore {
    pool: SqlitePool,
    /// Prepared on first use, dropped on close.
    statements: Mutex<Option<Arc<Statements>>>,
    closed: AtomicBool,
}

impl ResultStore {
    /// Open or create the database at `path`.
    pub async fn open(path: impl AsRef<Path>, max_connections: u32) -> Result<Self, StoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        info!(path = %path.display(), "Result store opened");
        Self::with_pool(pool).await
    }

    /// Open a private in-memory database.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;

        // Every connection to :memory: is its own database, so keep exactly one alive.
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        debug!("Result store schema ready");

        Ok(Self {
            pool,
            statements: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    async fn statements(&self) -> Result<Arc<Statements>, StoreError> {
        let mut slot = self.statements.lock().await;
        self.ensure_open()?;

        if let Some(statements) = slot.as_ref() {
            return Ok(statements.clone());
        }

        debug!("Preparing result store statements");
        let get = self.pool.prepare(GET_SQL).await?;
        let upsert = self.pool.prepare(UPSERT_SQL).await?;
        let statements = Arc::new(Statements { get, upsert });
        *slot = Some(statements.clone());
        Ok(statements)
    }

    /// Fetch the record for `ip_address`; `Ok(None)` when nothing is stored.
    pub async fn get(&self, ip_address: &str) -> Result<Option<ReputationRecord>, StoreError> {
        if ip_address.is_empty() {
            return Err(StoreError::Validation(
                "ip_address must not be empty".to_string(),
            ));
        }
        self.ensure_open()?;

        let statements = self.statements().await?;
        let row = statements
            .get
            .query()
            .bind(ip_address)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    /// Insert `record`, or update the response code and `updated_at` of the
    /// existing row for the same address.
    pub async fn upsert(&self, record: &ReputationRecord) -> Result<(), StoreError> {
        record.validate()?;
        self.ensure_open()?;

        let statements = self.statements().await?;
        statements
            .upsert
            .query()
            .bind(record.id.as_str())
            .bind(record.ip_address.as_str())
            .bind(record.response_code.as_str())
            .bind(format_timestamp(&record.created_at))
            .bind(format_timestamp(&record.updated_at))
            .execute(&self.pool)
            .await?;

        debug!(ip = %record.ip_address, code = %record.response_code, "Stored lookup result");
        Ok(())
    }

    /// Number of stored records.
    pub async fn count(&self) -> Result<u64, StoreError> {
        self.ensure_open()?;

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ip_details")
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// Close the store, its prepared statements and its connections.
    /// Later calls return [`StoreError::Closed`].
    pub async fn close(&self) -> Result<(), StoreError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(StoreError::Closed);
        }
        self.statements.lock().await.take();
        self.pool.close().await;
        info!("Result store closed");
        Ok(())
    }
}

fn record_from_row(row: &SqliteRow) -> Result<ReputationRecord, StoreError> {
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(ReputationRecord {
        id: row.try_get("uuid")?,
        ip_address: row.try_get("ip_address")?,
        response_code: row.try_get("response_code")?,
        created_at: parse_timestamp("created_at", &created_at)?,
        updated_at: parse_timestamp("updated_at", &updated_at)?,
    })
}
