use tracing::debug;

use crate::backend::{BackendFamily, DecodeBackend};
use crate::config::BackendConfig;
use crate::error::{BackendError, Result};
use crate::state::TokenContext;
use crate::tokenizer::ByteTokenizer;

/// Baseline reported by the stubs' memory query, in MiB.
pub(crate) const STUB_BASE_MEMORY_MIB: usize = 256;

/// Stub backend whose scores depend only on the context length.
///
/// Score `i` is `((len + i) % 100) / 100`, where `len` is the number of
/// tokens in the context. Two sessions fed the same tokens therefore report
/// identical scores, which makes this variant the reference for round-trip
/// and rollback tests.
#[derive(Debug)]
pub struct DeterministicBackend {
    context: TokenContext,
    vocab_size: usize,
    tokenizer: ByteTokenizer,
}

impl DeterministicBackend {
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            context: TokenContext::new(config.n_ctx),
            vocab_size: config.vocab_size,
            tokenizer: ByteTokenizer::new(),
        }
    }
}

/// Reject token ids outside `0..vocab_size`.
pub(crate) fn check_vocab(tokens: &[u32], vocab_size: usize) -> Result<()> {
    match tokens.iter().find(|&&t| t as usize >= vocab_size) {
        Some(&token) => Err(BackendError::TokenOutOfRange {
            token,
            vocab: vocab_size,
        }),
        None => Ok(()),
    }
}

impl DecodeBackend for DeterministicBackend {
    fn name(&self) -> &str {
        "deterministic"
    }

    fn evaluate(&mut self, prefix_len: usize, tokens: &[u32]) -> Result<()> {
        check_vocab(tokens, self.vocab_size)?;
        self.context.append(prefix_len, tokens)
    }

    fn scores(&self, out: &mut [f32]) -> usize {
        let seed = self.context.len();
        let n = out.len().min(self.vocab_size);
        for (i, s) in out.iter_mut().take(n).enumerate() {
            *s = ((seed + i) % 100) as f32 / 100.0;
        }
        n
    }

    fn evict(&mut self, from_position: usize) -> Result<()> {
        self.context.truncate(from_position);
        Ok(())
    }

    fn context(&self) -> &[u32] {
        self.context.tokens()
    }

    fn state_size(&self) -> usize {
        self.context.encoded_size()
    }

    fn serialize_state(&self, out: &mut Vec<u8>) -> Result<()> {
        self.context.write(out);
        Ok(())
    }

    fn deserialize_state(&mut self, bytes: &[u8]) -> Result<usize> {
        let mut reader = bytes;
        let context = TokenContext::read(&mut reader, self.context.n_ctx())?;
        check_vocab(context.tokens(), self.vocab_size)?;
        self.context = context;
        Ok(bytes.len() - reader.len())
    }

    fn tokenize(&self, text: &str) -> Result<Vec<u32>> {
        Ok(self.tokenizer.encode(text))
    }

    fn token_to_piece(&self, token: u32) -> Result<Vec<u8>> {
        self.tokenizer.piece(token)
    }

    fn memory_usage_mib(&self) -> usize {
        STUB_BASE_MEMORY_MIB + self.context.len() / 4
    }
}

/// Family for `deterministic:` model references. Needs no process setup.
#[derive(Debug, Default)]
pub struct DeterministicFamily;

impl BackendFamily for DeterministicFamily {
    fn name(&self) -> &str {
        "deterministic"
    }

    fn open(&self, config: &BackendConfig) -> Result<Box<dyn DecodeBackend>> {
        config.validate()?;
        debug!(model = %config.model, n_ctx = config.n_ctx, "opening deterministic backend");
        Ok(Box::new(DeterministicBackend::new(config)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn backend() -> DeterministicBackend {
        let mut cfg = BackendConfig::new("stub");
        cfg.n_ctx = 16;
        DeterministicBackend::new(&cfg)
    }

    #[test]
    fn test_scores_follow_context_length() {
        let mut b = backend();
        let mut out = [0.0f32; 3];
        assert_eq!(b.scores(&mut out), 3);
        assert_relative_eq!(out[0], 0.0);
        assert_relative_eq!(out[2], 0.02);

        b.evaluate(0, &[5, 6, 7]).unwrap();
        b.scores(&mut out);
        assert_relative_eq!(out[0], 0.03);
        assert_relative_eq!(out[1], 0.04);
    }

    #[test]
    fn test_scores_limited_to_vocab() {
        let mut cfg = BackendConfig::new("stub");
        cfg.vocab_size = 2;
        let b = DeterministicBackend::new(&cfg);
        let mut out = [9.0f32; 4];
        assert_eq!(b.scores(&mut out), 2);
        assert_relative_eq!(out[2], 9.0);
    }

    #[test]
    fn test_failed_evaluate_keeps_context() {
        let mut b = backend();
        b.evaluate(0, &[1, 2]).unwrap();
        assert!(b.evaluate(2, &[40000]).is_err());
        assert!(b.evaluate(0, &[3]).is_err());
        assert_eq!(b.context(), &[1, 2]);
    }

    #[test]
    fn test_state_restores_into_fresh_backend() {
        let mut b = backend();
        b.evaluate(0, &[5, 6, 7]).unwrap();
        let mut state = Vec::new();
        b.serialize_state(&mut state).unwrap();
        assert_eq!(state.len(), b.state_size());

        let mut fresh = backend();
        assert_eq!(fresh.deserialize_state(&state).unwrap(), state.len());
        assert_eq!(fresh.context(), &[5, 6, 7]);
    }

    #[test]
    fn test_deserialize_reports_consumed_prefix() {
        let b = backend();
        let mut state = Vec::new();
        b.serialize_state(&mut state).unwrap();
        state.extend_from_slice(&[0xAA, 0xBB]);

        let mut fresh = backend();
        assert_eq!(fresh.deserialize_state(&state).unwrap(), state.len() - 2);
    }

    #[test]
    fn test_memory_usage_grows_with_context() {
        let mut b = backend();
        assert_eq!(b.memory_usage_mib(), 256);
        b.evaluate(0, &[1; 8]).unwrap();
        assert_eq!(b.memory_usage_mib(), 258);
    }
}
