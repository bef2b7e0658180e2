use std::os::raw::c_int;

use shard_session::SessionError;

/// Status codes shared by every FFI function.
///
/// Functions that return a count or size return it directly on success; any
/// negative return is one of the error codes below.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardStatus {
    ShardOk = 0,
    ShardErrorInvalidArgument = -1,
    ShardErrorLimitExceeded = -2,
    ShardErrorBufferTooSmall = -3,
    ShardErrorInitialization = -4,
    ShardErrorEvaluation = -5,
    ShardErrorEviction = -6,
    ShardErrorFormatMismatch = -7,
    ShardErrorCorruptedSnapshot = -8,
    ShardErrorInternal = -9,
}

impl ShardStatus {
    pub fn code(self) -> c_int {
        self as c_int
    }
}

impl From<&SessionError> for ShardStatus {
    fn from(err: &SessionError) -> Self {
        match err {
            SessionError::InvalidArgument(_) => ShardStatus::ShardErrorInvalidArgument,
            SessionError::Initialization(_) => ShardStatus::ShardErrorInitialization,
            SessionError::Evaluation(_) => ShardStatus::ShardErrorEvaluation,
            // A faulted session failed an eviction earlier and still needs one.
            SessionError::Eviction(_) | SessionError::Faulted(_) => {
                ShardStatus::ShardErrorEviction
            }
            SessionError::BufferTooSmall { .. } => ShardStatus::ShardErrorBufferTooSmall,
            SessionError::LimitExceeded { .. } => ShardStatus::ShardErrorLimitExceeded,
            SessionError::FormatMismatch(_) => ShardStatus::ShardErrorFormatMismatch,
            SessionError::CorruptedSnapshot(_) => ShardStatus::ShardErrorCorruptedSnapshot,
            SessionError::Poisoned | SessionError::Internal(_) => ShardStatus::ShardErrorInternal,
        }
    }
}
