//! `shard-backend` - decode backend adapters for shard-engine.
//!
//! This crate provides:
//! - The `DecodeBackend` trait every session drives (evaluate / evict /
//!   serialize / deserialize, plus scores and tokenization)
//! - The `BackendFamily` trait pairing a variant with its process lifecycle
//! - A deterministic stub and a fixed-distribution stub
//! - `EngineBackend`, binding an external `InferenceEngine` loaded from a
//!   probed GGUF model file

pub mod backend;
pub mod config;
pub mod deterministic;
pub mod engine;
pub mod error;
pub mod fixed;
pub mod state;
pub mod tokenizer;

// Re-export primary types at the crate root for convenience.
pub use backend::{BackendFamily, DecodeBackend};
pub use config::{BackendConfig, DEFAULT_N_CTX, DEFAULT_VOCAB_SIZE};
pub use deterministic::{DeterministicBackend, DeterministicFamily};
pub use engine::{EngineBackend, EngineFactory, EngineFamily, InferenceEngine, ModelFile};
pub use error::{BackendError, Result};
pub use fixed::{FixedDistributionBackend, FixedDistributionFamily};
pub use tokenizer::ByteTokenizer;
