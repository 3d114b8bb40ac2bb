//! # Sync Error Types
//!
//! Error types for sync runs.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Source        │  │     Run                 │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  RateLimited    │  │  AlreadyRunning         │ │
//! │  │  InvalidUrl     │  │  Transport      │  │  FullNotSupported       │ │
//! │  │  ConfigLoad/Save│  │  ServerError    │  │  LeaseLost, Cancelled   │ │
//! │  │  UnknownEntity  │  │  Http (4xx)     │  │  IncompletePopulation   │ │
//! │  │                 │  │  Malformed      │  │  SuspiciousEmpty...     │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐                              │
//! │  │    Database     │  │    Internal     │                              │
//! │  │  DatabaseError  │  │  Internal       │                              │
//! │  │  InvalidRecord  │  │  TaskFailed     │                              │
//! │  └─────────────────┘  └─────────────────┘                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Only the transient source errors are retried; see
//! [`SyncError::is_retryable`].

use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering all possible sync failures.
///
/// ## Design Principles
/// - Each variant includes enough context for debugging
/// - Errors are categorized for different handling strategies
/// - All errors are `Send + Sync` so they cross task boundaries
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Invalid API base URL.
    #[error("Invalid API URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    /// Entity name not present in the catalog.
    #[error("Unknown entity: {0}")]
    UnknownEntity(String),

    // =========================================================================
    // Source Errors
    // =========================================================================
    /// The API answered 429.
    #[error("Rate limited by the API")]
    RateLimited,

    /// Connection refused, reset or timed out.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The API answered 5xx.
    #[error("Server error {status}: {body}")]
    ServerError { status: u16, body: String },

    /// The API answered a non-transient 4xx.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// The body was not the expected page shape.
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// Every attempt of a transient failure was used up.
    #[error("Max retries exceeded after {attempts} attempts: {last_error}")]
    MaxRetriesExceeded { attempts: u32, last_error: String },

    // =========================================================================
    // Run Errors
    // =========================================================================
    /// A run for the same entity is already in flight.
    #[error("A sync run for {0} is already in progress")]
    AlreadyRunning(String),

    /// The run's database lease expired and another process took it.
    #[error("Lost the run lease for {0}")]
    LeaseLost(String),

    /// FULL was requested for an entity that cannot be fully listed.
    #[error("Entity {0} does not support full synchronization")]
    FullNotSupported(String),

    /// The run was cancelled between pages.
    #[error("Sync run cancelled")]
    Cancelled,

    /// The fetched id set cannot be trusted for deletion detection.
    #[error("Population of {entity} is incomplete: {reason}")]
    IncompletePopulation { entity: String, reason: String },

    /// The API listed nothing while the local table still has rows.
    #[error("Refusing to archive all {local} rows of {entity}: remote listed none")]
    SuspiciousEmptyPopulation { entity: String, local: u64 },

    // =========================================================================
    // Database Errors
    // =========================================================================
    /// Database query failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// A record or descriptor could not be interpreted.
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal engine error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// A spawned entity run panicked or was aborted.
    #[error("Sync task failed: {0}")]
    TaskFailed(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<mirror_db::DbError> for SyncError {
    fn from(err: mirror_db::DbError) -> Self {
        SyncError::DatabaseError(err.to_string())
    }
}

impl From<mirror_core::CoreError> for SyncError {
    fn from(err: mirror_core::CoreError) -> Self {
        match err {
            mirror_core::CoreError::UnknownEntity(name) => SyncError::UnknownEntity(name),
            other => SyncError::InvalidRecord(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            SyncError::Transport(err.to_string())
        } else if err.is_decode() {
            SyncError::MalformedResponse(err.to_string())
        } else if err.is_builder() {
            SyncError::InvalidConfig(err.to_string())
        } else {
            SyncError::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::MalformedResponse(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

impl From<tokio::task::JoinError> for SyncError {
    fn from(err: tokio::task::JoinError) -> Self {
        SyncError::TaskFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns true if the request can be repeated after a backoff.
    ///
    /// ## Retryable Errors
    /// - 429 responses
    /// - Connection failures and timeouts
    /// - 5xx responses
    ///
    /// ## Non-Retryable Errors
    /// - Any other 4xx (bad token, bad filter): repeating cannot help
    /// - Malformed bodies
    /// - Configuration and database errors
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::RateLimited | SyncError::Transport(_) | SyncError::ServerError { .. }
        )
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
                | SyncError::UnknownEntity(_)
        )
    }

    /// Returns true if the remote API produced this error.
    pub fn is_source_error(&self) -> bool {
        matches!(
            self,
            SyncError::RateLimited
                | SyncError::Transport(_)
                | SyncError::ServerError { .. }
                | SyncError::Http { .. }
                | SyncError::MalformedResponse(_)
                | SyncError::MaxRetriesExceeded { .. }
        )
    }
}
