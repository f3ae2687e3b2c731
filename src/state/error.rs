//! Error types for state store operations.

use std::fmt;

use thiserror::Error;

use crate::db::{DbError, is_corruption};

/// Structured classification for state database failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateDbErrorKind {
    /// `SQLite` returned busy/locked under concurrent access.
    BusyOrLocked,
    /// Constraint failure (unique/check/not-null).
    ConstraintViolation,
    /// Connection pool timed out waiting for a free connection.
    PoolTimeout,
    /// Connection pool is closed.
    PoolClosed,
    /// Expected row was not found.
    RowNotFound,
    /// Filesystem or transport IO failure.
    Io,
    /// SQL protocol/driver error.
    Protocol,
    /// Malformed database image.
    Corrupt,
    /// Unclassified database failure.
    Other,
}

impl StateDbErrorKind {
    #[must_use]
    pub fn from_sqlx(error: &sqlx::Error) -> Self {
        if is_corruption(error) {
            return Self::Corrupt;
        }
        match error {
            sqlx::Error::PoolTimedOut => Self::PoolTimeout,
            sqlx::Error::PoolClosed => Self::PoolClosed,
            sqlx::Error::RowNotFound => Self::RowNotFound,
            sqlx::Error::Io(_) => Self::Io,
            sqlx::Error::Protocol(_) => Self::Protocol,
            sqlx::Error::Database(database_error) => {
                classify_database_error(database_error.as_ref())
            }
            _ => Self::Other,
        }
    }
}

impl fmt::Display for StateDbErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::BusyOrLocked => "busy_or_locked",
            Self::ConstraintViolation => "constraint_violation",
            Self::PoolTimeout => "pool_timeout",
            Self::PoolClosed => "pool_closed",
            Self::RowNotFound => "row_not_found",
            Self::Io => "io",
            Self::Protocol => "protocol",
            Self::Corrupt => "corrupt",
            Self::Other => "other",
        };
        write!(f, "{label}")
    }
}

fn classify_database_error(
    database_error: &(dyn sqlx::error::DatabaseError + 'static),
) -> StateDbErrorKind {
    let code = database_error.code();
    if matches!(
        code.as_deref(),
        Some("SQLITE_BUSY" | "SQLITE_LOCKED" | "5" | "6")
    ) {
        return StateDbErrorKind::BusyOrLocked;
    }

    if database_error.is_unique_violation()
        || database_error.is_check_violation()
        || code
            .as_deref()
            .is_some_and(|value| value.starts_with("SQLITE_CONSTRAINT"))
    {
        return StateDbErrorKind::ConstraintViolation;
    }

    let message = database_error.message().to_ascii_lowercase();
    if message.contains("database is locked")
        || message.contains("database table is locked")
        || message.contains("database is busy")
    {
        return StateDbErrorKind::BusyOrLocked;
    }

    StateDbErrorKind::Other
}

/// Errors that can occur during state store operations.
#[derive(Debug, Clone, Error)]
pub enum StateError {
    /// Database operation failed.
    #[error("state database error ({kind}): {message}")]
    Database {
        /// Typed classification used for failure handling.
        kind: StateDbErrorKind,
        /// Human-readable database error text.
        message: String,
    },

    /// The state database cannot be trusted. Fatal for the run.
    #[error(
        "state store corrupted: {0}\n  Suggestion: Move .grabia/state.db aside or rerun with --fresh"
    )]
    Corruption(String),

    /// Task not found.
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// A persisted value could not be decoded.
    #[error("invalid persisted value for '{field}': {reason}")]
    InvalidValue {
        /// Column or meta key.
        field: String,
        /// Why it's invalid.
        reason: String,
    },
}

impl From<sqlx::Error> for StateError {
    fn from(err: sqlx::Error) -> Self {
        let kind = StateDbErrorKind::from_sqlx(&err);
        if kind == StateDbErrorKind::Corrupt {
            return Self::Corruption(err.to_string());
        }
        Self::Database {
            kind,
            message: err.to_string(),
        }
    }
}

impl From<DbError> for StateError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Corrupt { .. } => Self::Corruption(err.to_string()),
            DbError::Connection(inner) => Self::from(inner),
            DbError::Migration(inner) => Self::Database {
                kind: StateDbErrorKind::Other,
                message: inner.to_string(),
            },
        }
    }
}

impl StateError {
    /// Creates an `InvalidValue` error.
    #[must_use]
    pub fn invalid_value(field: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    /// Returns the typed database error kind, when this is a database error.
    #[must_use]
    pub fn database_kind(&self) -> Option<StateDbErrorKind> {
        match self {
            Self::Database { kind, .. } => Some(*kind),
            Self::Corruption(_) => Some(StateDbErrorKind::Corrupt),
            Self::TaskNotFound(_) | Self::InvalidValue { .. } => None,
        }
    }

    /// Returns true when the store integrity is compromised.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption(_))
    }

    /// Returns true when this error is a database busy/locked condition.
    #[must_use]
    pub fn is_busy_or_locked(&self) -> bool {
        self.database_kind() == Some(StateDbErrorKind::BusyOrLocked)
    }
}
