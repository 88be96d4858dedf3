use crate::store::JobTickStatus;
use thiserror::Error;

/// Errors surfaced by schedule store operations.
///
/// The store never retries internally; every failure is returned to the
/// caller, which is the only place that knows whether a tick was already
/// durably created.
#[derive(Debug, Error)]
pub enum StoreError {
    /// `add_job_state` was called for an origin id that is already present.
    #[error("job state already exists for origin {0}")]
    AlreadyExists(String),

    /// No job state with the given origin id.
    #[error("no job state for origin {0}")]
    JobStateNotFound(String),

    /// No job tick with the given id.
    #[error("no job tick with id {0}")]
    JobTickNotFound(i64),

    /// The store's schema version is behind what this build expects.
    /// Run `upgrade()` before retrying.
    #[error("schema migration required: store is at version {found}, expected {expected}")]
    MigrationRequired { found: usize, expected: usize },

    /// The stored schema's shape disagrees with the versioned definition.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    /// A stored payload failed to decode.
    #[error("corrupt stored payload: {0}")]
    Corrupt(String),

    /// Attempt to move a tick that already reached a terminal status back
    /// to `Started`.
    #[error("job tick {id} is already terminal ({status})")]
    TerminalTick { id: i64, status: JobTickStatus },

    /// Underlying SQLite / rusqlite error. Transient; safe to retry with
    /// backoff.
    #[error("storage unavailable: {0}")]
    Storage(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;
