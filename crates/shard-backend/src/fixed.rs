use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::backend::{BackendFamily, DecodeBackend};
use crate::config::BackendConfig;
use crate::deterministic::{check_vocab, STUB_BASE_MEMORY_MIB};
use crate::error::Result;
use crate::state::TokenContext;
use crate::tokenizer::ByteTokenizer;

/// Stub backend that reports the same probability distribution after every
/// step.
///
/// The distribution is drawn once per backend from a `StdRng` seeded with
/// `config.seed` and normalized to sum to one. It is configuration, not
/// state, so it is not part of the serialized payload: restoring a snapshot
/// only requires a backend opened with the same seed and vocabulary.
#[derive(Debug)]
pub struct FixedDistributionBackend {
    context: TokenContext,
    distribution: Vec<f32>,
    tokenizer: ByteTokenizer,
}

impl FixedDistributionBackend {
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            context: TokenContext::new(config.n_ctx),
            distribution: fixed_distribution(config.vocab_size, config.seed),
            tokenizer: ByteTokenizer::new(),
        }
    }

    pub fn distribution(&self) -> &[f32] {
        &self.distribution
    }
}

/// Draw `n` weights from a seeded RNG and normalize them to a distribution.
fn fixed_distribution(n: usize, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    let weights: Vec<f32> = (0..n).map(|_| rng.gen_range(0.0f32..1.0)).collect();
    let sum: f32 = weights.iter().sum();
    if sum <= 0.0 {
        return vec![1.0 / n as f32; n];
    }
    weights.iter().map(|w| w / sum).collect()
}

impl DecodeBackend for FixedDistributionBackend {
    fn name(&self) -> &str {
        "fixed"
    }

    fn evaluate(&mut self, prefix_len: usize, tokens: &[u32]) -> Result<()> {
        check_vocab(tokens, self.distribution.len())?;
        self.context.append(prefix_len, tokens)
    }

    fn scores(&self, out: &mut [f32]) -> usize {
        let n = out.len().min(self.distribution.len());
        out[..n].copy_from_slice(&self.distribution[..n]);
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
        check_vocab(context.tokens(), self.distribution.len())?;
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

/// Family for `fixed:` model references. Needs no process setup.
#[derive(Debug, Default)]
pub struct FixedDistributionFamily;

impl BackendFamily for FixedDistributionFamily {
    fn name(&self) -> &str {
        "fixed"
    }

    fn open(&self, config: &BackendConfig) -> Result<Box<dyn DecodeBackend>> {
        config.validate()?;
        debug!(
            model = %config.model,
            vocab = config.vocab_size,
            seed = config.seed,
            "opening fixed-distribution backend"
        );
        Ok(Box::new(FixedDistributionBackend::new(config)))
    }
}
