use crate::error::{BackendError, Result};

/// Number of ids the byte tokenizer assigns (one per byte value).
pub const BYTE_VOCAB_SIZE: usize = 256;

/// Byte-level tokenizer used by the stub backends.
///
/// Each UTF-8 byte of the input maps to the token id equal to its value, so
/// decoding a sequence of pieces reproduces the original text exactly.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteTokenizer;

impl ByteTokenizer {
    pub fn new() -> Self {
        Self
    }

    /// Encode `text` into one token id per byte.
    pub fn encode(&self, text: &str) -> Vec<u32> {
        text.bytes().map(u32::from).collect()
    }

    /// The single-byte piece for `token`.
    pub fn piece(&self, token: u32) -> Result<Vec<u8>> {
        u8::try_from(token)
            .map(|b| vec![b])
            .map_err(|_| BackendError::UnknownToken(token))
    }
}
