//! Little-endian helpers for backend state payloads, and the token context
//! every adapter keeps alongside its physical cache.
//!
//! Token context layout inside a payload:
//!   - 4 bytes: u32 token count `n`
//!   - 4 * n bytes: u32 token ids, oldest first

use std::io::{ErrorKind, Read};

use crate::error::{BackendError, Result};

/// Append a u32 in little-endian order.
pub fn write_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Append a run of f32 values in little-endian order.
pub fn write_f32s(out: &mut Vec<u8>, values: &[f32]) {
    out.reserve(values.len() * 4);
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
}

/// `read_exact` that reports running out of input as a truncated payload.
pub fn read_exact(reader: &mut impl Read, buf: &mut [u8]) -> Result<()> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => BackendError::TruncatedState { wanted: buf.len() },
        _ => BackendError::Io(e),
    })
}

/// Read a little-endian u32.
pub fn read_u32(reader: &mut impl Read) -> Result<u32> {
    let mut buf4 = [0u8; 4];
    read_exact(reader, &mut buf4)?;
    Ok(u32::from_le_bytes(buf4))
}

/// Fail unless `reader` still holds `n` 4-byte values.
fn ensure_remaining(reader: &[u8], n: usize) -> Result<()> {
    let wanted = n.saturating_mul(4);
    if wanted > reader.len() {
        return Err(BackendError::TruncatedState {
            wanted: wanted - reader.len(),
        });
    }
    Ok(())
}

/// Read `n` little-endian f32 values.
pub fn read_f32s(reader: &mut &[u8], n: usize) -> Result<Vec<f32>> {
    ensure_remaining(*reader, n)?;
    let mut out = Vec::with_capacity(n);
    let mut buf4 = [0u8; 4];
    for _ in 0..n {
        read_exact(reader, &mut buf4)?;
        out.push(f32::from_le_bytes(buf4));
    }
    Ok(out)
}

/// Ordered token ids held by a backend, bounded by its context window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenContext {
    tokens: Vec<u32>,
    n_ctx: usize,
}

impl TokenContext {
    pub fn new(n_ctx: usize) -> Self {
        Self {
            tokens: Vec::new(),
            n_ctx,
        }
    }

    pub fn tokens(&self) -> &[u32] {
        &self.tokens
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn n_ctx(&self) -> usize {
        self.n_ctx
    }

    /// Validate that `tokens` can be appended after `prefix_len` positions
    /// without touching the context.
    pub fn check_append(&self, prefix_len: usize, tokens: &[u32]) -> Result<()> {
        if prefix_len != self.tokens.len() {
            return Err(BackendError::PrefixMismatch {
                held: self.tokens.len(),
                expected: prefix_len,
            });
        }
        let needed = self.tokens.len() + tokens.len();
        if needed > self.n_ctx {
            return Err(BackendError::ContextFull {
                needed,
                n_ctx: self.n_ctx,
            });
        }
        Ok(())
    }

    /// Append after a successful `check_append`.
    pub fn append(&mut self, prefix_len: usize, tokens: &[u32]) -> Result<()> {
        self.check_append(prefix_len, tokens)?;
        self.tokens.extend_from_slice(tokens);
        Ok(())
    }

    /// Drop every position `>= from`. Truncating past the end is a no-op.
    pub fn truncate(&mut self, from: usize) {
        self.tokens.truncate(from);
    }

    /// Size of `write`'s output in bytes.
    pub fn encoded_size(&self) -> usize {
        4 + self.tokens.len() * 4
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.reserve(self.encoded_size());
        write_u32(out, self.tokens.len() as u32);
        for &t in &self.tokens {
            write_u32(out, t);
        }
    }

    /// Parse a token context written by `write`, rejecting one that would not
    /// fit a window of `n_ctx` positions.
    pub fn read(reader: &mut &[u8], n_ctx: usize) -> Result<TokenContext> {
        let n = read_u32(reader)? as usize;
        if n > n_ctx {
            return Err(BackendError::StateMismatch(format!(
                "context holds {} tokens but n_ctx is {}",
                n, n_ctx
            )));
        }
        ensure_remaining(*reader, n)?;
        let mut tokens = Vec::with_capacity(n);
        for _ in 0..n {
            tokens.push(read_u32(reader)?);
        }
        Ok(TokenContext { tokens, n_ctx })
    }
}
