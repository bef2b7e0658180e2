//! Binding to a real inference engine.
//!
//! The engine itself (weights, forward pass, KV cache) lives outside this
//! crate behind [`InferenceEngine`]; an [`EngineFactory`] supplies the
//! process-wide init/shutdown hooks and loads engines from a probed
//! [`ModelFile`]. [`EngineBackend`] adapts an engine to the
//! [`DecodeBackend`] contract.
//!
//! Payload layout produced by [`EngineBackend::serialize_state`]:
//!   - token context (see `state`)
//!   - 4 bytes: u32 logits count `n`, then 4 * n bytes of f32 logits
//!   - 4 bytes: u32 engine state size `m`, then `m` bytes of engine state

pub mod model_file;

pub use model_file::{ModelFile, GGUF_MAGIC};

use std::path::Path;

use tracing::{debug, info, warn};

use crate::backend::{BackendFamily, DecodeBackend};
use crate::config::BackendConfig;
use crate::error::{BackendError, Result};
use crate::state::{read_exact, read_f32s, read_u32, write_f32s, write_u32, TokenContext};

/// Operations a loaded model must provide to be driven by a decode session.
pub trait InferenceEngine: Send {
    /// Run the forward pass for `tokens` placed after `n_past` cached
    /// positions and return the logits of the last token.
    fn eval(&mut self, n_past: usize, tokens: &[u32]) -> Result<Vec<f32>>;

    /// Drop cached positions `>= from`.
    fn remove_from(&mut self, from: usize) -> Result<()>;

    /// Exact size of `save_state`'s output.
    fn state_size(&self) -> usize;

    /// Append the engine's internal state (KV cache and friends) to `out`.
    fn save_state(&self, out: &mut Vec<u8>) -> Result<()>;

    /// Restore state written by `save_state`, returning bytes consumed.
    fn load_state(&mut self, bytes: &[u8]) -> Result<usize>;

    fn tokenize(&self, text: &str) -> Result<Vec<u32>>;

    fn token_to_piece(&self, token: u32) -> Result<Vec<u8>>;

    /// Width of the logits vector.
    fn vocab_size(&self) -> usize;

    fn memory_usage_mib(&self) -> usize;
}

/// Loads engines for one engine implementation and owns its process setup.
pub trait EngineFactory: Send + Sync {
    fn name(&self) -> &str;

    /// Process-wide engine initialization (backend init, thread pools, ...).
    fn init_process(&self) -> Result<()> {
        Ok(())
    }

    fn shutdown_process(&self) {}

    fn load(&self, model: &ModelFile, config: &BackendConfig) -> Result<Box<dyn InferenceEngine>>;
}

/// Adapts an [`InferenceEngine`] to the [`DecodeBackend`] contract.
pub struct EngineBackend {
    engine: Box<dyn InferenceEngine>,
    context: TokenContext,
    logits: Vec<f32>,
}

impl EngineBackend {
    pub fn new(engine: Box<dyn InferenceEngine>, n_ctx: usize) -> Self {
        Self {
            engine,
            context: TokenContext::new(n_ctx),
            logits: Vec::new(),
        }
    }
}

impl DecodeBackend for EngineBackend {
    fn name(&self) -> &str {
        "engine"
    }

    fn evaluate(&mut self, prefix_len: usize, tokens: &[u32]) -> Result<()> {
        self.context.check_append(prefix_len, tokens)?;
        match self.engine.eval(prefix_len, tokens) {
            Ok(logits) => {
                self.context.append(prefix_len, tokens)?;
                self.logits = logits;
                Ok(())
            }
            // The engine may have written some positions before failing.
            Err(e) => match self.engine.remove_from(prefix_len) {
                Ok(()) => Err(e),
                Err(cleanup) => {
                    warn!(error = %cleanup, prefix_len, "failed to discard partial evaluation");
                    Err(BackendError::PartialEvaluation {
                        error: Box::new(e),
                        cleanup: Box::new(cleanup),
                    })
                }
            },
        }
    }

    fn scores(&self, out: &mut [f32]) -> usize {
        let n = out.len().min(self.logits.len());
        out[..n].copy_from_slice(&self.logits[..n]);
        n
    }

    /// Logits always describe the last context position, so they are
    /// discarded together with it.
    fn evict(&mut self, from_position: usize) -> Result<()> {
        if from_position < self.context.len() {
            self.logits.clear();
        }
        self.context.truncate(from_position);
        self.engine.remove_from(from_position)
    }

    fn context(&self) -> &[u32] {
        self.context.tokens()
    }

    fn state_size(&self) -> usize {
        self.context.encoded_size() + 4 + self.logits.len() * 4 + 4 + self.engine.state_size()
    }

    fn serialize_state(&self, out: &mut Vec<u8>) -> Result<()> {
        self.context.write(out);
        write_u32(out, self.logits.len() as u32);
        write_f32s(out, &self.logits);

        let engine_size = self.engine.state_size();
        write_u32(out, engine_size as u32);
        let before = out.len();
        self.engine.save_state(out)?;
        let written = out.len() - before;
        if written != engine_size {
            return Err(BackendError::StateMismatch(format!(
                "engine reported {} state bytes but wrote {}",
                engine_size, written
            )));
        }
        Ok(())
    }

    fn deserialize_state(&mut self, bytes: &[u8]) -> Result<usize> {
        let mut reader = bytes;
        let context = TokenContext::read(&mut reader, self.context.n_ctx())?;

        let n_logits = read_u32(&mut reader)? as usize;
        if n_logits > self.engine.vocab_size() {
            return Err(BackendError::StateMismatch(format!(
                "{} logits exceed vocab size {}",
                n_logits,
                self.engine.vocab_size()
            )));
        }
        let logits = read_f32s(&mut reader, n_logits)?;

        let engine_size = read_u32(&mut reader)? as usize;
        if engine_size > reader.len() {
            return Err(BackendError::TruncatedState {
                wanted: engine_size - reader.len(),
            });
        }
        let mut engine_state = vec![0u8; engine_size];
        read_exact(&mut reader, &mut engine_state)?;
        let consumed = self.engine.load_state(&engine_state)?;
        if consumed != engine_size {
            return Err(BackendError::StateMismatch(format!(
                "engine consumed {} of {} state bytes",
                consumed, engine_size
            )));
        }

        self.context = context;
        self.logits = logits;
        Ok(bytes.len() - reader.len())
    }

    fn tokenize(&self, text: &str) -> Result<Vec<u32>> {
        self.engine.tokenize(text)
    }

    fn token_to_piece(&self, token: u32) -> Result<Vec<u8>> {
        self.engine.token_to_piece(token)
    }

    fn memory_usage_mib(&self) -> usize {
        self.engine.memory_usage_mib()
    }
}

/// Backend family that opens model files through an [`EngineFactory`].
pub struct EngineFamily<F> {
    factory: F,
}

impl<F: EngineFactory> EngineFamily<F> {
    pub fn new(factory: F) -> Self {
        Self { factory }
    }
}

impl<F: EngineFactory> BackendFamily for EngineFamily<F> {
    fn name(&self) -> &str {
        "engine"
    }

    fn bootstrap(&self) -> Result<()> {
        info!(engine = self.factory.name(), "initializing engine process state");
        self.factory
            .init_process()
            .map_err(|e| BackendError::Bootstrap(e.to_string()))
    }

    fn teardown(&self) {
        info!(engine = self.factory.name(), "shutting down engine process state");
        self.factory.shutdown_process();
    }

    fn open(&self, config: &BackendConfig) -> Result<Box<dyn DecodeBackend>> {
        config.validate()?;
        let model = ModelFile::open(Path::new(&config.model))?;
        debug!(
            path = %model.path().display(),
            gguf_version = model.version(),
            "loading engine model"
        );
        let engine = self.factory.load(&model, config)?;
        Ok(Box::new(EngineBackend::new(engine, config.n_ctx)))
    }
}
