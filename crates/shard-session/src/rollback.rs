use tracing::{debug, info, warn};

use crate::error::{Result, SessionError};
use crate::session::Session;

impl Session {
    /// Undo up to `steps` of the most recent committed tokens.
    ///
    /// The count is clamped to the current position and the clamped value is
    /// returned, so rolling back more than was committed resets the session
    /// to position 0 and reports the previous position. Staged history is
    /// always cleared.
    ///
    /// After the logical rollback the backend evicts every position
    /// `>= new position`. If that fails the logical rollback stands, the
    /// session becomes faulted (its physical cache may still hold evicted
    /// entries) and `Eviction` is returned. Any later rollback, including one
    /// of zero steps, retries the eviction and clears the fault on success.
    pub fn rollback(&mut self, steps: usize) -> Result<usize> {
        let undone = steps.min(self.position);
        let new_position = self.position - undone;

        self.committed.truncate(new_position);
        self.position = new_position;
        self.staged.clear();

        if undone == 0 && self.fault.is_none() {
            return Ok(0);
        }

        match self.backend.evict(new_position) {
            Ok(()) => {
                if self.fault.take().is_some() {
                    info!(position = new_position, "eviction retry succeeded, fault cleared");
                }
                debug!(undone, position = new_position, "rolled back session");
                debug_assert_eq!(self.backend.context().len(), self.position);
                Ok(undone)
            }
            Err(e) => {
                warn!(error = %e, position = new_position, "eviction failed, session faulted");
                self.fault = Some(e.to_string());
                Err(SessionError::Eviction(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shard_backend::{BackendConfig, DeterministicBackend};

    fn session() -> Session {
        Session::new(Box::new(DeterministicBackend::new(&BackendConfig::new("test"))))
    }

    #[test]
    fn test_rollback_within_history() {
        let mut s = session();
        s.step(&[5, 6, 7]).unwrap();
        assert_eq!(s.rollback(1).unwrap(), 1);
        assert_eq!(s.position(), 2);
        assert_eq!(s.committed_history(), &[5, 6]);
        assert!(s.staged_history().is_empty());
    }

    #[test]
    fn test_over_rollback_clamps_to_zero() {
        let mut s = session();
        s.step(&[1, 2, 3, 4]).unwrap();
        assert_eq!(s.rollback(10).unwrap(), 4);
        assert_eq!(s.position(), 0);
        assert!(s.committed_history().is_empty());
        assert_eq!(s.rollback(1).unwrap(), 0);
    }

    #[test]
    fn test_zero_rollback_is_noop() {
        let mut s = session();
        s.step(&[1, 2]).unwrap();
        assert_eq!(s.rollback(0).unwrap(), 0);
        assert_eq!(s.position(), 2);
        assert_eq!(s.committed_history(), &[1, 2]);
    }

    #[test]
    fn test_rollback_then_step_matches_fresh_session() {
        let mut a = session();
        a.step(&[1, 2, 3]).unwrap();
        a.rollback(2).unwrap();
        a.step(&[9]).unwrap();

        let mut b = session();
        b.step(&[1]).unwrap();
        b.step(&[9]).unwrap();

        assert_eq!(a.committed_history(), b.committed_history());
        assert_eq!(a.peek_scores(8).unwrap(), b.peek_scores(8).unwrap());
    }
}
