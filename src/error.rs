//! Error types for the automation store.

/// Top-level error type for store operations.
///
/// A missing schedule or trigger is never an error: lookups resolve to
/// `None`, updates to `false`, and deletes to `0`.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Saving would push the stored schedule count past the capacity limit.
    #[error(
        "capacity exceeded: {current} stored + {requested} requested > limit {limit}"
    )]
    CapacityExceeded {
        limit: usize,
        current: usize,
        requested: usize,
    },

    /// A schedule with this identifier already exists (or appears twice in a batch).
    #[error("duplicate schedule identifier: {0}")]
    DuplicateIdentifier(String),

    /// The schedule would not read back exactly as given.
    #[error("invalid schedule `{identifier}`: {reason}")]
    InvalidSchedule { identifier: String, reason: String },

    /// The SQLite backend failed; the surrounding transaction was rolled back.
    #[error("backend error: {0}")]
    Backend(#[from] rusqlite::Error),

    /// A JSON column could not be encoded or decoded.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// The store worker thread is not running.
    #[error("store worker unavailable: {0}")]
    WorkerUnavailable(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Encoding(e.to_string())
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, StoreError>;
