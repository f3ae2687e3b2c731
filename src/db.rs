//! Database connection and schema management.
//!
//! This module provides SQLite database connectivity with:
//! - Connection pool management
//! - WAL mode and `synchronous=NORMAL` on every pooled connection
//! - Automatic migration execution
//! - Integrity checking on open
//!
//! # Example
//!
//! ```no_run
//! use grabia_core::Database;
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::new(Path::new("state.db")).await?;
//! // Use db for queries...
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use thiserror::Error;
use tracing::{instrument, warn};

/// Default maximum number of connections in the pool.
/// Kept low for SQLite since it uses file-level locking.
const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// SQLite busy timeout.
/// Connections will wait this long before returning `SQLITE_BUSY`.
const BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

/// Primary result codes for `SQLITE_CORRUPT` and `SQLITE_NOTADB`.
const SQLITE_CORRUPT: i64 = 11;
const SQLITE_NOTADB: i64 = 26;

/// Database-related errors.
#[derive(Error, Debug)]
pub enum DbError {
    /// Failed to connect to the database.
    #[error("failed to connect to database: {0}")]
    Connection(#[from] sqlx::Error),

    /// Failed to run migrations.
    #[error("failed to run migrations: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// The database file exists but is not a readable SQLite database.
    #[error(
        "state database is corrupt: {path}: {message}\n  Suggestion: Move the file aside or start with --fresh"
    )]
    Corrupt {
        /// Database file path.
        path: PathBuf,
        /// Driver or integrity-check message.
        message: String,
    },
}

impl DbError {
    fn classify(path: &Path, err: sqlx::Error) -> Self {
        if is_corruption(&err) {
            return Self::Corrupt {
                path: path.to_path_buf(),
                message: err.to_string(),
            };
        }
        Self::Connection(err)
    }

    fn classify_migration(path: &Path, err: sqlx::migrate::MigrateError) -> Self {
        if let sqlx::migrate::MigrateError::Execute(inner) = &err
            && is_corruption(inner)
        {
            return Self::Corrupt {
                path: path.to_path_buf(),
                message: inner.to_string(),
            };
        }
        Self::Migration(err)
    }

    /// Returns true when the error means the on-disk state cannot be trusted.
    #[must_use]
    pub fn is_corrupt(&self) -> bool {
        matches!(self, Self::Corrupt { .. })
    }
}

/// Returns true when `err` is SQLite reporting a malformed or foreign file.
#[must_use]
pub fn is_corruption(err: &sqlx::Error) -> bool {
    let sqlx::Error::Database(db_err) = err else {
        return false;
    };
    let primary = db_err
        .code()
        .and_then(|code| code.parse::<i64>().ok())
        .map(|code| code & 0xff);
    if matches!(primary, Some(SQLITE_CORRUPT | SQLITE_NOTADB)) {
        return true;
    }
    let message = db_err.message().to_ascii_lowercase();
    message.contains("malformed") || message.contains("not a database")
}

/// Database connection wrapper with connection pool.
///
/// Handles SQLite connection pooling, WAL mode configuration,
/// and automatic migration execution.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens (creating if needed) the database at the specified path.
    ///
    /// This will:
    /// 1. Create the database file if it doesn't exist
    /// 2. Enable WAL mode for concurrent reads
    /// 3. Run any pending migrations
    /// 4. Run `PRAGMA quick_check`
    ///
    /// # Errors
    ///
    /// Returns `DbError::Corrupt` if the file is not a healthy SQLite database,
    /// `DbError::Connection` if the connection fails,
    /// or `DbError::Migration` if migrations fail.
    #[instrument(skip(db_path), fields(path = %db_path.display()))]
    pub async fn new(db_path: &Path) -> Result<Self, DbError> {
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(DEFAULT_MAX_CONNECTIONS)
            .connect_with(options)
            .await
            .map_err(|err| DbError::classify(db_path, err))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|err| DbError::classify_migration(db_path, err))?;

        let db = Self { pool };
        db.check_integrity(db_path).await?;
        Ok(db)
    }

    /// Creates an in-memory database for testing.
    ///
    /// The database exists only for the lifetime of the connection
    /// and is useful for unit tests. WAL mode is not enabled
    /// for in-memory databases as it provides no benefit.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Connection` if the connection fails,
    /// or `DbError::Migration` if migrations fail.
    #[instrument]
    pub async fn new_in_memory() -> Result<Self, DbError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    async fn check_integrity(&self, db_path: &Path) -> Result<(), DbError> {
        let result: Result<(String,), sqlx::Error> = sqlx::query_as("PRAGMA quick_check")
            .fetch_one(&self.pool)
            .await;
        match result {
            Ok((verdict,)) if verdict.eq_ignore_ascii_case("ok") => Ok(()),
            Ok((verdict,)) => {
                warn!(path = %db_path.display(), verdict = %verdict, "integrity check failed");
                Err(DbError::Corrupt {
                    path: db_path.to_path_buf(),
                    message: verdict,
                })
            }
            Err(err) => Err(DbError::classify(db_path, err)),
        }
    }

    /// Returns a reference to the underlying connection pool.
    ///
    /// Use this for executing queries with sqlx.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Checks if WAL mode is enabled.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Connection` if the query fails.
    #[instrument(skip(self))]
    pub async fn is_wal_enabled(&self) -> Result<bool, DbError> {
        let result: (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&self.pool)
            .await?;

        Ok(result.0.eq_ignore_ascii_case("wal"))
    }

    /// Gracefully closes all connections in the pool.
    #[instrument(skip(self))]
    pub async fn close(self) {
        self.pool.close().await;
    }
}
