use shard_backend::BackendError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("initialization failed: {0}")]
    Initialization(String),
    #[error("evaluation failed: {0}")]
    Evaluation(#[source] BackendError),
    #[error("cache eviction failed: {0}")]
    Eviction(#[source] BackendError),
    #[error("session is faulted, its cache may hold stale positions ({0}); roll back to retry or destroy it")]
    Faulted(String),
    #[error("buffer too small: need {needed} bytes, have {capacity}")]
    BufferTooSmall { needed: usize, capacity: usize },
    #[error("size limit exceeded: {size} bytes > limit {limit}")]
    LimitExceeded { size: usize, limit: usize },
    #[error("snapshot format mismatch: {0}")]
    FormatMismatch(String),
    #[error("corrupted snapshot: {0}")]
    CorruptedSnapshot(String),
    #[error("session poisoned by an earlier panic")]
    Poisoned,
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, SessionError>;
