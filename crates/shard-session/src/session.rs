use shard_backend::{BackendError, DecodeBackend};
use tracing::warn;

use crate::error::{Result, SessionError};

/// The unit of decode state: one backend plus the logical token history.
///
/// Invariant after every completed call: `position() == committed_history().len()`
/// and the backend's context holds exactly the committed tokens.
///
/// A session is not internally synchronized. Callers must not run two
/// operations on the same session concurrently; distinct sessions share
/// nothing and may be driven from different threads.
pub struct Session {
    pub(crate) backend: Box<dyn DecodeBackend>,
    pub(crate) position: usize,
    pub(crate) committed: Vec<u32>,
    pub(crate) staged: Vec<u32>,
    /// Set when a failed eviction, or a failed evaluation the backend could
    /// not clean up, may have left the physical cache out of step with
    /// `committed`.
    pub(crate) fault: Option<String>,
}

impl Session {
    /// Wrap a freshly opened backend. Its context must be empty.
    pub fn new(backend: Box<dyn DecodeBackend>) -> Self {
        debug_assert!(backend.context().is_empty());
        Self {
            backend,
            position: 0,
            committed: Vec::new(),
            staged: Vec::new(),
            fault: None,
        }
    }

    /// Number of committed decode steps.
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn committed_history(&self) -> &[u32] {
        &self.committed
    }

    /// Tokens submitted by the most recent `step`. Diagnostic only.
    pub fn staged_history(&self) -> &[u32] {
        &self.staged
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Reason the session is faulted, if it is.
    pub fn fault(&self) -> Option<&str> {
        self.fault.as_deref()
    }

    pub(crate) fn ensure_healthy(&self) -> Result<()> {
        match &self.fault {
            Some(reason) => Err(SessionError::Faulted(reason.clone())),
            None => Ok(()),
        }
    }

    /// Advance the session by `tokens`.
    ///
    /// An empty slice is a no-op that returns 0 without reaching the backend.
    /// On backend failure the logical state is left exactly as it was. If the
    /// backend could not discard what the failed evaluation wrote, the session
    /// is also faulted until a rollback evicts the leftovers.
    pub fn step(&mut self, tokens: &[u32]) -> Result<usize> {
        self.ensure_healthy()?;
        if tokens.is_empty() {
            return Ok(0);
        }

        if let Err(e) = self.backend.evaluate(self.position, tokens) {
            if e.leaves_cache_dirty() {
                warn!(error = %e, position = self.position, "partial evaluation left in cache, session faulted");
                self.fault = Some(e.to_string());
            }
            return Err(SessionError::Evaluation(e));
        }

        self.committed.extend_from_slice(tokens);
        self.position += tokens.len();
        self.staged.clear();
        self.staged.extend_from_slice(tokens);
        debug_assert_eq!(self.backend.context().len(), self.position);
        Ok(tokens.len())
    }

    /// Return the current scores, truncated or zero-padded to `requested_count`.
    pub fn peek_scores(&self, requested_count: usize) -> Result<Vec<f32>> {
        if requested_count == 0 {
            return Err(SessionError::InvalidArgument(
                "requested score count must be positive".to_string(),
            ));
        }
        let mut out = vec![0.0f32; requested_count];
        self.peek_scores_into(&mut out)?;
        Ok(out)
    }

    /// Fill `out` with the current scores, zero-padding past what the
    /// backend provides. Returns `out.len()`.
    pub fn peek_scores_into(&self, out: &mut [f32]) -> Result<usize> {
        if out.is_empty() {
            return Err(SessionError::InvalidArgument(
                "score buffer is empty".to_string(),
            ));
        }
        self.ensure_healthy()?;
        let written = self.backend.scores(out).min(out.len());
        out[written..].fill(0.0);
        Ok(out.len())
    }

    /// Convert text to token ids with the backend's tokenizer.
    pub fn tokenize(&self, text: &str) -> Result<Vec<u32>> {
        self.backend.tokenize(text).map_err(invalid_argument)
    }

    /// Bytes of the text piece for a single token id.
    pub fn token_to_piece(&self, token: u32) -> Result<Vec<u8>> {
        self.backend.token_to_piece(token).map_err(invalid_argument)
    }

    /// Approximate device memory held by the backend, in MiB.
    pub fn memory_usage_mib(&self) -> usize {
        self.backend.memory_usage_mib()
    }
}

fn invalid_argument(e: BackendError) -> SessionError {
    SessionError::InvalidArgument(e.to_string())
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("backend", &self.backend.name())
            .field("position", &self.position)
            .field("staged", &self.staged.len())
            .field("fault", &self.fault)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use shard_backend::{BackendConfig, DeterministicBackend, FixedDistributionBackend};

    fn deterministic(n_ctx: usize) -> Session {
        let mut cfg = BackendConfig::new("test");
        cfg.n_ctx = n_ctx;
        Session::new(Box::new(DeterministicBackend::new(&cfg)))
    }

    #[test]
    fn test_step_advances_position() {
        let mut s = deterministic(64);
        assert_eq!(s.step(&[5, 6, 7]).unwrap(), 3);
        assert_eq!(s.step(&[8]).unwrap(), 1);
        assert_eq!(s.position(), 4);
        assert_eq!(s.committed_history(), &[5, 6, 7, 8]);
        assert_eq!(s.staged_history(), &[8]);
    }

    #[test]
    fn test_empty_step_is_noop() {
        let mut s = deterministic(64);
        s.step(&[1, 2]).unwrap();
        assert_eq!(s.step(&[]).unwrap(), 0);
        assert_eq!(s.position(), 2);
        assert_eq!(s.staged_history(), &[1, 2]);
    }

    #[test]
    fn test_failed_step_leaves_state_unchanged() {
        let mut s = deterministic(4);
        s.step(&[1, 2, 3]).unwrap();
        let err = s.step(&[4, 5]).unwrap_err();
        assert!(matches!(err, SessionError::Evaluation(BackendError::ContextFull { .. })));
        assert_eq!(s.position(), 3);
        assert_eq!(s.committed_history(), &[1, 2, 3]);
        assert_eq!(s.staged_history(), &[1, 2, 3]);
    }

    #[test]
    fn test_peek_scores_does_not_mutate() {
        let mut s = deterministic(64);
        s.step(&[5, 6, 7]).unwrap();
        let a = s.peek_scores(4).unwrap();
        let b = s.peek_scores(4).unwrap();
        assert_eq!(a, b);
        assert_relative_eq!(a[0], 0.03);
        assert_eq!(s.position(), 3);
    }

    #[test]
    fn test_peek_scores_zero_pads() {
        let mut cfg = BackendConfig::new("test");
        cfg.vocab_size = 3;
        let s = Session::new(Box::new(FixedDistributionBackend::new(&cfg)));
        let scores = s.peek_scores(5).unwrap();
        assert_eq!(scores.len(), 5);
        assert!(scores[..3].iter().all(|&p| p > 0.0));
        assert_eq!(&scores[3..], &[0.0, 0.0]);
    }

    #[test]
    fn test_peek_scores_rejects_zero() {
        let s = deterministic(64);
        assert!(matches!(s.peek_scores(0), Err(SessionError::InvalidArgument(_))));
        assert!(matches!(
            s.peek_scores_into(&mut []),
            Err(SessionError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_tokenize_and_pieces() {
        let s = deterministic(64);
        let ids = s.tokenize("ok").unwrap();
        assert_eq!(ids, vec![111, 107]);
        assert_eq!(s.token_to_piece(111).unwrap(), b"o");
        assert!(matches!(
            s.token_to_piece(1000),
            Err(SessionError::InvalidArgument(_))
        ));
    }
}
