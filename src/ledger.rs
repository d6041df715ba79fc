//! Durable deduplication ledger.
//!
//! Records the terminal status of every processed item identifier in a
//! SQLite file inside the output directory, so a rerun skips work that
//! already succeeded. Only a SUCCESS row suppresses a re-fetch; FAILED
//! rows exist for reporting and are retried on the next run.
//!
//! The connection pool is capped at a single connection, which makes the
//! ledger the natural serialization point for writes: workers only read,
//! and all writes funnel through the aggregator task.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Ledger filename inside the output directory.
pub const LEDGER_FILE_NAME: &str = ".ledger";

/// How long a connection waits on a locked database before erroring.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors from ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Underlying database failure.
    #[error("ledger database error: {0}")]
    Db(#[from] sqlx::Error),

    /// Filesystem failure while preparing the ledger location.
    #[error("ledger IO error at {path}: {source}")]
    Io {
        /// Path involved in the failure.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A stored status value that is neither `success` nor `failed`.
    #[error("invalid ledger status: {value}")]
    InvalidStatus {
        /// The offending stored value.
        value: String,
    },
}

/// Terminal status of a processed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerStatus {
    /// The item was downloaded and placed under its final name.
    Success,

    /// All attempts failed; the item will be retried on the next run.
    Failed,
}

impl LedgerStatus {
    /// Stable string form used in the database.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for LedgerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LedgerStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(LedgerError::InvalidStatus {
                value: other.to_string(),
            }),
        }
    }
}

/// One ledger row.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    /// Stable item identifier from the listing.
    pub identifier: String,
    /// Terminal status of the last run that touched this item.
    pub status: LedgerStatus,
    /// UTC timestamp (`datetime('now')`) of the last status change.
    pub recorded_at: String,
}

/// Handle to the ledger database. Clones share the same pool.
#[derive(Debug, Clone)]
pub struct Ledger {
    pool: SqlitePool,
}

impl Ledger {
    /// Opens (creating if needed) the ledger inside `output_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Io`] if the output directory cannot be
    /// created, or [`LedgerError::Db`] if the database cannot be opened
    /// or initialized.
    #[instrument(skip(output_dir), fields(dir = %output_dir.as_ref().display()))]
    pub async fn open(output_dir: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let output_dir = output_dir.as_ref();
        tokio::fs::create_dir_all(output_dir)
            .await
            .map_err(|source| LedgerError::Io {
                path: output_dir.to_path_buf(),
                source,
            })?;

        let db_path = output_dir.join(LEDGER_FILE_NAME);
        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let ledger = Self::connect(options).await?;
        info!(path = %db_path.display(), "ledger opened");
        Ok(ledger)
    }

    /// Opens an in-memory ledger. Test-oriented; nothing persists.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Db`] if the database cannot be initialized.
    pub async fn open_in_memory() -> Result<Self, LedgerError> {
        let options = SqliteConnectOptions::new().in_memory(true);
        Self::connect(options).await
    }

    async fn connect(options: SqliteConnectOptions) -> Result<Self, LedgerError> {
        // One connection: the pool doubles as the write-serialization point
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS fetched_items (
                identifier  TEXT PRIMARY KEY,
                status      TEXT NOT NULL CHECK (status IN ('success', 'failed')),
                recorded_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            ",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    /// Returns whether `identifier` has already been fetched successfully.
    ///
    /// A FAILED row does not count; those items are retried.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Db`] on database failure.
    pub async fn has(&self, identifier: &str) -> Result<bool, LedgerError> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM fetched_items WHERE identifier = ?")
                .bind(identifier)
                .fetch_optional(&self.pool)
                .await?;

        Ok(status.as_deref() == Some("success"))
    }

    /// Records the terminal status of an item, replacing any prior row.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Db`] on database failure.
    #[instrument(skip(self))]
    pub async fn record(&self, identifier: &str, status: LedgerStatus) -> Result<(), LedgerError> {
        sqlx::query(
            r"
            INSERT INTO fetched_items (identifier, status)
            VALUES (?, ?)
            ON CONFLICT(identifier) DO UPDATE SET
                status = excluded.status,
                recorded_at = datetime('now')
            ",
        )
        .bind(identifier)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;

        debug!(identifier, %status, "ledger updated");
        Ok(())
    }

    /// Looks up the ledger row for `identifier`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Db`] on database failure, or
    /// [`LedgerError::InvalidStatus`] if the row holds a status value this
    /// version does not know.
    pub async fn entry(&self, identifier: &str) -> Result<Option<LedgerEntry>, LedgerError> {
        let row = sqlx::query(
            "SELECT identifier, status, recorded_at FROM fetched_items WHERE identifier = ?",
        )
        .bind(identifier)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            let status: String = row.get("status");
            Ok(LedgerEntry {
                identifier: row.get("identifier"),
                status: status.parse()?,
                recorded_at: row.get("recorded_at"),
            })
        })
        .transpose()
    }

    /// Closes the underlying pool, flushing WAL state.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
