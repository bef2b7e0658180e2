use crate::config::BackendConfig;
use crate::error::Result;

/// Uniform interface over an inference engine that a decode session drives.
///
/// A backend owns the physical decode context (for a real engine, its KV
/// cache) and the score vector produced by the most recent evaluation. The
/// session above it owns the logical bookkeeping; the two must agree on the
/// context length after every successful call.
///
/// Implementations must be atomic per call: a failed `evaluate` leaves the
/// context exactly as it was. `deserialize_state` may partially apply on
/// failure; callers that need all-or-nothing semantics keep a serialized copy
/// of the previous state and restore it.
pub trait DecodeBackend: Send {
    /// Returns the name of this backend (e.g., "deterministic", "engine").
    fn name(&self) -> &str;

    /// Evaluate `tokens` after the first `prefix_len` positions of the context.
    ///
    /// `prefix_len` must equal the current context length. On success the
    /// tokens become part of the context and `scores` reflects the last one.
    fn evaluate(&mut self, prefix_len: usize, tokens: &[u32]) -> Result<()>;

    /// Copy the current score vector into `out`.
    ///
    /// Returns how many leading entries of `out` were written; the caller
    /// zero-fills the remainder.
    fn scores(&self, out: &mut [f32]) -> usize;

    /// Discard every cached position `>= from_position`.
    ///
    /// Evicting past the end of the context is not an error.
    fn evict(&mut self, from_position: usize) -> Result<()>;

    /// Tokens currently held in the context, oldest first.
    fn context(&self) -> &[u32];

    /// Exact number of bytes `serialize_state` will append.
    fn state_size(&self) -> usize;

    /// Append the full recoverable state to `out`.
    fn serialize_state(&self, out: &mut Vec<u8>) -> Result<()>;

    /// Replace the current state with one produced by `serialize_state`.
    ///
    /// Returns the number of bytes consumed, which must be all of `bytes`
    /// for the payload to be considered intact.
    fn deserialize_state(&mut self, bytes: &[u8]) -> Result<usize>;

    /// Convert text into token ids.
    fn tokenize(&self, text: &str) -> Result<Vec<u32>>;

    /// Bytes of the text piece a single token id decodes to.
    fn token_to_piece(&self, token: u32) -> Result<Vec<u8>>;

    /// Approximate device memory held by this backend, in MiB.
    fn memory_usage_mib(&self) -> usize;
}

/// A selectable backend variant together with its process-wide lifecycle.
///
/// `bootstrap` is called before the first session of the family is opened
/// and `teardown` after the last one is destroyed; the lifecycle manager
/// guarantees they are never interleaved.
pub trait BackendFamily: Send + Sync {
    /// Scheme name used to select this family from a model reference.
    fn name(&self) -> &str;

    /// One-time process initialization for this family.
    fn bootstrap(&self) -> Result<()> {
        Ok(())
    }

    /// Undo `bootstrap`.
    fn teardown(&self) {}

    /// Load model resources and return a fresh backend with an empty context.
    fn open(&self, config: &BackendConfig) -> Result<Box<dyn DecodeBackend>>;
}
