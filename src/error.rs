//! Application-wide error type.
//!
//! Every component (RL, MP, HS, TSS, SQM, WR, WE) returns `Result<T, AppError>`.
//! HTTP route handlers are an external collaborator (see spec §1), so unlike the
//! teacher's `AppError` this type has no `IntoResponse` impl — it is plain
//! `std::error::Error` currency for the core.

use thiserror::Error;

/// Application error type covering every error kind in spec §7.
#[derive(Debug, Error)]
pub enum AppError {
    /// SQM.submit found a live, non-terminal task with the same fingerprint.
    #[error("duplicate download for existing task {existing_task_id}")]
    DuplicateDownload { existing_task_id: String },

    /// RL exhausted its retry budget while trying to obtain a permit.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// The fetch library raised while the worker was running a job.
    #[error("fetch failed: {message}")]
    FetchError { message: String, can_retry: bool },

    /// Cancellation observed before or during a job.
    #[error("cancellation requested for task {task_id}")]
    CancellationRequested { task_id: String },

    /// A non-fatal failure while evolving the HS schema.
    #[error("schema evolution failed for {target}: {message}")]
    SchemaEvolutionFailure { target: String, message: String },

    /// WE's call into MP failed; the tick ends without touching any cursor.
    #[error("watch provider failure for {item_id}: {message}")]
    WatchProviderFailure { item_id: String, message: String },

    /// Startup-time config version outside the accepted set.
    #[error("config version mismatch: found {found}, expected one of {expected:?}")]
    VersionMismatch { found: String, expected: Vec<String> },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("retry not allowed for task {task_id}: {reason}")]
    RetryNotAllowed { task_id: String, reason: String },

    #[error("database error")]
    Database(#[from] sqlx::Error),

    #[error("redis error")]
    Redis(#[from] redis::RedisError),

    #[error("redis pool error")]
    RedisPool(#[from] deadpool_redis::PoolError),

    #[error("http request error")]
    Http(#[from] reqwest::Error),

    #[error("serialization error")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;

impl AppError {
    /// Whether this error should be surfaced to a user-initiated retry path
    /// (spec §7: "Nothing is silently swallowed at the task level").
    pub fn can_retry(&self) -> bool {
        matches!(self, AppError::FetchError { can_retry: true, .. })
    }
}
