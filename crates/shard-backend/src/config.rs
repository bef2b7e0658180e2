use crate::error::{BackendError, Result};

/// Default width of the score vector when a model reference does not set `vocab`.
pub const DEFAULT_VOCAB_SIZE: usize = 32000;

/// Default context window when a model reference does not set `n_ctx`.
pub const DEFAULT_N_CTX: usize = 4096;

/// Settings handed to a backend family when it opens a model.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendConfig {
    /// Model name or filesystem path (the part of the reference after the scheme).
    pub model: String,
    /// Width of the score vector.
    pub vocab_size: usize,
    /// Maximum number of tokens the decode context may hold.
    pub n_ctx: usize,
    /// Seed for backends that derive fixed state from an RNG.
    pub seed: u64,
}

impl BackendConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            vocab_size: DEFAULT_VOCAB_SIZE,
            n_ctx: DEFAULT_N_CTX,
            seed: 0,
        }
    }

    /// Check the limits every backend relies on.
    ///
    /// Positions and counts cross the C boundary as `int`, so neither the
    /// context window nor the vocabulary may exceed `i32::MAX`.
    pub fn validate(&self) -> Result<()> {
        if self.model.is_empty() {
            return Err(BackendError::Config("model reference is empty".to_string()));
        }
        if self.vocab_size == 0 || self.vocab_size > i32::MAX as usize {
            return Err(BackendError::Config(format!(
                "vocab must be in 1..={}, got {}",
                i32::MAX,
                self.vocab_size
            )));
        }
        if self.n_ctx == 0 || self.n_ctx > i32::MAX as usize {
            return Err(BackendError::Config(format!(
                "n_ctx must be in 1..={}, got {}",
                i32::MAX,
                self.n_ctx
            )));
        }
        Ok(())
    }
}
