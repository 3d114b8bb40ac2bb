//! # Storage Errors
//!
//! Every repository returns [`DbResult`]. sqlx errors are folded into
//! [`DbError`] at the boundary so callers never match on driver types.
//!
//! ```text
//! sqlx::Error ──┐
//! MigrateError ─┼──► DbError ──► SyncError::DatabaseError ──► run FAILED
//! ValidationError ┘
//! ```

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    /// A live row expected by the caller is gone.
    ///
    /// ## When This Occurs
    /// - Archiving an id that was removed between diff and archive
    #[error("{table} has no row with id {id}")]
    NotFound { table: String, id: String },

    /// Two rows with the same id in one table.
    #[error("Duplicate id in {0}")]
    DuplicateId(String),

    /// A child row points at a parent that is not stored.
    #[error("Foreign key violation: {0}")]
    ForeignKeyViolation(String),

    /// The database file could not be opened or created.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// SQL rejected at runtime.
    ///
    /// ## When This Occurs
    /// - A live table predates a column added to the descriptor
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// A descriptor failed validation before any SQL was built from it.
    #[error("Invalid entity descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Connection pool exhausted")]
    PoolExhausted,

    /// Stored data that cannot be decoded.
    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

impl DbError {
    pub fn not_found(table: impl Into<String>, id: impl ToString) -> Self {
        DbError::NotFound {
            table: table.into(),
            id: id.to_string(),
        }
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DbError::not_found("unknown", "unknown"),
            sqlx::Error::Database(db_err) => {
                // SQLite reports "UNIQUE constraint failed: <table>.<column>"
                let message = db_err.message();
                if let Some(column) = message.strip_prefix("UNIQUE constraint failed: ") {
                    DbError::DuplicateId(column.to_string())
                } else if message.contains("FOREIGN KEY constraint failed") {
                    DbError::ForeignKeyViolation(message.to_string())
                } else {
                    DbError::QueryFailed(message.to_string())
                }
            }
            sqlx::Error::PoolTimedOut => DbError::PoolExhausted,
            sqlx::Error::PoolClosed => DbError::ConnectionFailed("pool is closed".to_string()),
            other => DbError::QueryFailed(other.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for DbError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DbError::MigrationFailed(err.to_string())
    }
}

impl From<mirror_core::ValidationError> for DbError {
    fn from(err: mirror_core::ValidationError) -> Self {
        DbError::InvalidDescriptor(err.to_string())
    }
}

pub type DbResult<T> = Result<T, DbError>;
