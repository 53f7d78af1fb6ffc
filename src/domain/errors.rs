//! Domain errors for the task execution service.

use thiserror::Error;
use uuid::Uuid;

/// Error kinds of the public service surface (spec of behavior, not of
/// internal causes): transport layers translate these to status codes.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Malformed request; never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Admission full; the client should retry with backoff.
    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Task id collision on create.
    #[error("already exists: {0}")]
    AlreadyExists(Uuid),

    /// Operation on a task that has already ended.
    #[error("task already terminal: {0}")]
    AlreadyTerminal(Uuid),

    /// Transient tool/backend/store failure, retried locally then escalated.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Rate-limit or token budget exhausted; callers may downgrade.
    #[error("tool budget exhausted: {0}")]
    ToolBudgetExhausted(String),

    /// Distinguished terminal state, not a fault.
    #[error("cancelled")]
    Cancelled,

    /// Internal invariant violated; the task fails, the process survives.
    #[error("fatal: {0}")]
    Fatal(String),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    pub fn not_found_task(id: Uuid) -> Self {
        Self::NotFound(format!("task {id}"))
    }

    /// Whether local retry with backoff is worthwhile.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Classify a sqlx error: connection-level problems are worth retrying,
/// constraint and query errors are not.
pub fn sqlx_is_transient(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Tls(_)
            | sqlx::Error::WorkerCrashed
    )
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        if sqlx_is_transient(&err) {
            CoreError::Transient(format!("database: {err}"))
        } else {
            CoreError::Fatal(format!("database: {err}"))
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Fatal(format!("serialization: {err}"))
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::Fatal(format!("io: {err}"))
    }
}
