use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid model file magic: expected 'GGUF', got {0:?}")]
    InvalidModelMagic([u8; 4]),
    #[error("unsupported model file version: {0}")]
    UnsupportedModelVersion(u32),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("backend bootstrap failed: {0}")]
    Bootstrap(String),
    #[error("context window full: {needed} tokens > n_ctx {n_ctx}")]
    ContextFull { needed: usize, n_ctx: usize },
    #[error("token id {token} exceeds vocab size {vocab}")]
    TokenOutOfRange { token: u32, vocab: usize },
    #[error("prefix mismatch: backend holds {held} tokens, caller expects {expected}")]
    PrefixMismatch { held: usize, expected: usize },
    #[error("truncated state payload: wanted {wanted} more bytes")]
    TruncatedState { wanted: usize },
    #[error("state payload does not match backend: {0}")]
    StateMismatch(String),
    #[error("unknown token id: {0}")]
    UnknownToken(u32),
    #[error("engine error: {0}")]
    Engine(String),
    /// The evaluation failed and the positions it wrote could not be
    /// removed, so the physical cache is ahead of the logical context.
    #[error("evaluation failed ({error}) and its partial cache writes could not be discarded: {cleanup}")]
    PartialEvaluation {
        error: Box<BackendError>,
        cleanup: Box<BackendError>,
    },
}

impl BackendError {
    /// Whether the backend's physical cache may now hold positions its
    /// logical context does not.
    pub fn leaves_cache_dirty(&self) -> bool {
        matches!(self, BackendError::PartialEvaluation { .. })
    }
}

pub type Result<T> = std::result::Result<T, BackendError>;
