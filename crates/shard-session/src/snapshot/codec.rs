use tracing::{debug, info, warn};

use super::header::{SnapshotHeader, SNAPSHOT_HEADER_SIZE};
use crate::error::{Result, SessionError};
use crate::session::Session;

/// Largest total snapshot the boundary can describe with a signed 32-bit size.
const MAX_REPRESENTABLE_BYTES: usize = i32::MAX as usize;

impl Session {
    /// Total bytes `export` would write right now: header plus backend payload.
    pub fn snapshot_size(&self) -> Result<usize> {
        let payload = self.backend.state_size();
        if payload > u32::MAX as usize {
            return Err(SessionError::LimitExceeded {
                size: payload,
                limit: u32::MAX as usize,
            });
        }
        let total = SNAPSHOT_HEADER_SIZE + payload;
        if total > MAX_REPRESENTABLE_BYTES {
            return Err(SessionError::LimitExceeded {
                size: total,
                limit: MAX_REPRESENTABLE_BYTES,
            });
        }
        Ok(total)
    }

    /// Write a snapshot of this session into `out`.
    ///
    /// Fails with `LimitExceeded` if the snapshot is larger than `max_bytes`
    /// and with `BufferTooSmall` if it does not fit in `out`, both before the
    /// backend is asked for its state. Nothing is written to `out` unless the
    /// whole snapshot is. Returns bytes written.
    pub fn export(&self, out: &mut [u8], max_bytes: usize) -> Result<usize> {
        let total = self.checked_snapshot_size(max_bytes)?;
        if total > out.len() {
            return Err(SessionError::BufferTooSmall {
                needed: total,
                capacity: out.len(),
            });
        }
        let blob = self.encode_snapshot(total)?;
        out[..total].copy_from_slice(&blob);
        Ok(total)
    }

    /// Encode a snapshot into a fresh vector, subject to `max_bytes`.
    pub fn export_to_vec(&self, max_bytes: usize) -> Result<Vec<u8>> {
        let total = self.checked_snapshot_size(max_bytes)?;
        self.encode_snapshot(total)
    }

    fn checked_snapshot_size(&self, max_bytes: usize) -> Result<usize> {
        self.ensure_healthy()?;
        let total = self.snapshot_size()?;
        if total > max_bytes {
            return Err(SessionError::LimitExceeded {
                size: total,
                limit: max_bytes,
            });
        }
        Ok(total)
    }

    fn encode_snapshot(&self, total: usize) -> Result<Vec<u8>> {
        let position = u32::try_from(self.position).map_err(|_| SessionError::LimitExceeded {
            size: self.position,
            limit: u32::MAX as usize,
        })?;
        let payload_size = (total - SNAPSHOT_HEADER_SIZE) as u32;

        let mut blob = Vec::with_capacity(total);
        SnapshotHeader::new(position, payload_size).write(&mut blob);
        self.backend
            .serialize_state(&mut blob)
            .map_err(|e| SessionError::Internal(format!("serializing backend state: {}", e)))?;

        if blob.len() != total {
            return Err(SessionError::Internal(format!(
                "backend reported {} payload bytes but wrote {}",
                payload_size,
                blob.len() - SNAPSHOT_HEADER_SIZE
            )));
        }

        debug!(position, bytes = total, "exported snapshot");
        Ok(blob)
    }

    /// Replace this session's state with the one encoded in `bytes`.
    ///
    /// All-or-nothing: on any error the session is observably unchanged.
    /// A successful import also clears an eviction fault, since the backend
    /// state is rebuilt from scratch.
    pub fn import(&mut self, bytes: &[u8], max_bytes: usize) -> Result<()> {
        if bytes.len() < SNAPSHOT_HEADER_SIZE {
            return Err(SessionError::InvalidArgument(format!(
                "snapshot of {} bytes is shorter than the {}-byte header",
                bytes.len(),
                SNAPSHOT_HEADER_SIZE
            )));
        }
        if bytes.len() > max_bytes {
            return Err(SessionError::LimitExceeded {
                size: bytes.len(),
                limit: max_bytes,
            });
        }

        let header = SnapshotHeader::parse(&mut &bytes[..SNAPSHOT_HEADER_SIZE])?;
        if header.total_size() != bytes.len() {
            return Err(SessionError::CorruptedSnapshot(format!(
                "header declares {} payload bytes but {} follow",
                header.payload_size,
                bytes.len() - SNAPSHOT_HEADER_SIZE
            )));
        }

        let mut backup = Vec::with_capacity(self.backend.state_size());
        self.backend
            .serialize_state(&mut backup)
            .map_err(|e| SessionError::Internal(format!("saving pre-import state: {}", e)))?;

        let payload = &bytes[SNAPSHOT_HEADER_SIZE..];
        if let Err(e) = self.restore_payload(payload, header.position as usize) {
            self.rollback_import(&backup);
            return Err(e);
        }

        self.position = header.position as usize;
        self.committed = self.backend.context().to_vec();
        self.staged.clear();
        if self.fault.take().is_some() {
            info!("snapshot import cleared eviction fault");
        }
        debug!(position = self.position, bytes = bytes.len(), "imported snapshot");
        Ok(())
    }

    fn restore_payload(&mut self, payload: &[u8], position: usize) -> Result<()> {
        let consumed = self
            .backend
            .deserialize_state(payload)
            .map_err(|e| SessionError::CorruptedSnapshot(e.to_string()))?;
        if consumed != payload.len() {
            return Err(SessionError::CorruptedSnapshot(format!(
                "backend consumed {} of {} payload bytes",
                consumed,
                payload.len()
            )));
        }
        let held = self.backend.context().len();
        if held != position {
            return Err(SessionError::CorruptedSnapshot(format!(
                "payload holds {} positions but header says {}",
                held, position
            )));
        }
        Ok(())
    }

    fn rollback_import(&mut self, backup: &[u8]) {
        match self.backend.deserialize_state(backup) {
            Ok(n) if n == backup.len() => {}
            Ok(n) => {
                warn!(consumed = n, expected = backup.len(), "pre-import state restore was short");
                self.fault = Some("pre-import state could not be restored".to_string());
            }
            Err(e) => {
                warn!(error = %e, "failed to restore pre-import state");
                self.fault = Some(format!("pre-import state could not be restored: {}", e));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{DEFAULT_MAX_SNAPSHOT_BYTES, SNAPSHOT_MAGIC};
    use shard_backend::{
        BackendConfig, BackendError, DecodeBackend, DeterministicBackend, FixedDistributionBackend,
    };

    fn session() -> Session {
        Session::new(Box::new(DeterministicBackend::new(&BackendConfig::new("test"))))
    }

    /// Deterministic backend with injectable state-transfer failures.
    struct Brittle {
        inner: DeterministicBackend,
        fail_serialize: bool,
        /// 1-based `deserialize_state` call that fails, if any.
        fail_deserialize_call: Option<usize>,
        deserialize_calls: usize,
    }

    impl Brittle {
        fn session(fail_serialize: bool, fail_deserialize_call: Option<usize>) -> Session {
            Session::new(Box::new(Brittle {
                inner: DeterministicBackend::new(&BackendConfig::new("test")),
                fail_serialize,
                fail_deserialize_call,
                deserialize_calls: 0,
            }))
        }
    }

    impl DecodeBackend for Brittle {
        fn name(&self) -> &str {
            "brittle"
        }

        fn evaluate(&mut self, prefix_len: usize, tokens: &[u32]) -> shard_backend::Result<()> {
            self.inner.evaluate(prefix_len, tokens)
        }

        fn scores(&self, out: &mut [f32]) -> usize {
            self.inner.scores(out)
        }

        fn evict(&mut self, from_position: usize) -> shard_backend::Result<()> {
            self.inner.evict(from_position)
        }

        fn context(&self) -> &[u32] {
            self.inner.context()
        }

        fn state_size(&self) -> usize {
            self.inner.state_size()
        }

        fn serialize_state(&self, out: &mut Vec<u8>) -> shard_backend::Result<()> {
            if self.fail_serialize {
                return Err(BackendError::Engine("state unavailable".to_string()));
            }
            self.inner.serialize_state(out)
        }

        fn deserialize_state(&mut self, bytes: &[u8]) -> shard_backend::Result<usize> {
            self.deserialize_calls += 1;
            if self.fail_deserialize_call == Some(self.deserialize_calls) {
                return Err(BackendError::Engine("device lost".to_string()));
            }
            self.inner.deserialize_state(bytes)
        }

        fn tokenize(&self, text: &str) -> shard_backend::Result<Vec<u32>> {
            self.inner.tokenize(text)
        }

        fn token_to_piece(&self, token: u32) -> shard_backend::Result<Vec<u8>> {
            self.inner.token_to_piece(token)
        }

        fn memory_usage_mib(&self) -> usize {
            self.inner.memory_usage_mib()
        }
    }

    #[test]
    fn test_export_layout() {
        let mut s = session();
        s.step(&[5, 6, 7]).unwrap();
        let blob = s.export_to_vec(DEFAULT_MAX_SNAPSHOT_BYTES).unwrap();
        assert_eq!(blob.len(), s.snapshot_size().unwrap());
        assert_eq!(&blob[0..4], &SNAPSHOT_MAGIC);
        assert_eq!(u32::from_le_bytes(blob[4..8].try_into().unwrap()), 1);
        assert_eq!(u32::from_le_bytes(blob[8..12].try_into().unwrap()), 3);
        let payload = u32::from_le_bytes(blob[12..16].try_into().unwrap()) as usize;
        assert_eq!(blob.len(), SNAPSHOT_HEADER_SIZE + payload);
    }

    #[test]
    fn test_export_limit_checked_before_capacity() {
        let mut s = session();
        s.step(&[1, 2, 3]).unwrap();
        let size = s.snapshot_size().unwrap();
        let mut small = vec![0u8; 4];
        assert!(matches!(
            s.export(&mut small, size - 1),
            Err(SessionError::LimitExceeded { .. })
        ));
        assert!(matches!(
            s.export(&mut small, size),
            Err(SessionError::BufferTooSmall { .. })
        ));
        assert_eq!(small, vec![0u8; 4]);
    }

    #[test]
    fn test_round_trip_restores_position_and_history() {
        let mut a = session();
        a.step(&[5, 6, 7]).unwrap();
        a.rollback(1).unwrap();
        let mut buf = vec![0u8; 1024];
        let n = a.export(&mut buf, DEFAULT_MAX_SNAPSHOT_BYTES).unwrap();

        let mut b = session();
        b.import(&buf[..n], DEFAULT_MAX_SNAPSHOT_BYTES).unwrap();
        assert_eq!(b.position(), 2);
        assert_eq!(b.committed_history(), &[5, 6]);

        a.step(&[8]).unwrap();
        b.step(&[8]).unwrap();
        assert_eq!(a.peek_scores(16).unwrap(), b.peek_scores(16).unwrap());
    }

    #[test]
    fn test_import_rejects_bad_input_without_mutation() {
        let mut src = session();
        src.step(&[1, 2, 3, 4]).unwrap();
        let blob = src.export_to_vec(DEFAULT_MAX_SNAPSHOT_BYTES).unwrap();

        let mut dst = session();
        dst.step(&[9, 9]).unwrap();

        let mut flipped = blob.clone();
        flipped[0] ^= 0xFF;
        assert!(matches!(
            dst.import(&flipped, DEFAULT_MAX_SNAPSHOT_BYTES),
            Err(SessionError::FormatMismatch(_))
        ));
        assert!(matches!(
            dst.import(&blob[..blob.len() - 1], DEFAULT_MAX_SNAPSHOT_BYTES),
            Err(SessionError::CorruptedSnapshot(_))
        ));
        assert!(matches!(
            dst.import(&blob[..8], DEFAULT_MAX_SNAPSHOT_BYTES),
            Err(SessionError::InvalidArgument(_))
        ));
        assert!(matches!(
            dst.import(&blob, blob.len() - 1),
            Err(SessionError::LimitExceeded { .. })
        ));

        assert_eq!(dst.position(), 2);
        assert_eq!(dst.committed_history(), &[9, 9]);
    }

    #[test]
    fn test_import_position_disagreeing_with_payload_is_corrupt() {
        let mut src = session();
        src.step(&[1, 2, 3]).unwrap();
        let mut blob = src.export_to_vec(DEFAULT_MAX_SNAPSHOT_BYTES).unwrap();
        blob[8..12].copy_from_slice(&7u32.to_le_bytes());

        let mut dst = session();
        dst.step(&[4]).unwrap();
        assert!(matches!(
            dst.import(&blob, DEFAULT_MAX_SNAPSHOT_BYTES),
            Err(SessionError::CorruptedSnapshot(_))
        ));
        assert_eq!(dst.committed_history(), &[4]);
        assert!(dst.fault().is_none());
        assert_eq!(dst.step(&[5]).unwrap(), 1);
    }

    #[test]
    fn test_import_out_of_vocab_payload_is_rejected() {
        let mut src = session();
        src.step(&[100, 200]).unwrap();
        let blob = src.export_to_vec(DEFAULT_MAX_SNAPSHOT_BYTES).unwrap();

        let mut cfg = BackendConfig::new("test");
        cfg.vocab_size = 8;
        let mut dst = Session::new(Box::new(FixedDistributionBackend::new(&cfg)));
        dst.step(&[1, 2, 3]).unwrap();
        assert!(matches!(
            dst.import(&blob, DEFAULT_MAX_SNAPSHOT_BYTES),
            Err(SessionError::CorruptedSnapshot(_))
        ));
        assert_eq!(dst.position(), 3);
        assert_eq!(dst.committed_history(), &[1, 2, 3]);
        assert!(dst.fault().is_none());
    }

    #[test]
    fn test_export_capacity_checked_before_serializing() {
        let mut s = Brittle::session(true, None);
        s.step(&[1, 2, 3]).unwrap();
        let size = s.snapshot_size().unwrap();

        let mut small = vec![0u8; size - 1];
        assert!(matches!(
            s.export(&mut small, DEFAULT_MAX_SNAPSHOT_BYTES),
            Err(SessionError::BufferTooSmall { needed, capacity }) if needed == size && capacity == size - 1
        ));
        let mut exact = vec![0u8; size];
        assert!(matches!(
            s.export(&mut exact, DEFAULT_MAX_SNAPSHOT_BYTES),
            Err(SessionError::Internal(_))
        ));
        assert!(exact.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_failed_restore_after_bad_import_faults_session() {
        let mut src = session();
        src.step(&[1, 2, 3]).unwrap();
        let good = src.export_to_vec(DEFAULT_MAX_SNAPSHOT_BYTES).unwrap();
        // Payload decodes fine but holds 3 positions, not 7.
        let mut bad = good.clone();
        bad[8..12].copy_from_slice(&7u32.to_le_bytes());

        let mut dst = Brittle::session(false, Some(2));
        dst.step(&[9]).unwrap();
        assert!(matches!(
            dst.import(&bad, DEFAULT_MAX_SNAPSHOT_BYTES),
            Err(SessionError::CorruptedSnapshot(_))
        ));
        assert!(dst.fault().is_some());
        assert!(matches!(dst.step(&[4]), Err(SessionError::Faulted(_))));
        assert!(matches!(
            dst.export_to_vec(DEFAULT_MAX_SNAPSHOT_BYTES),
            Err(SessionError::Faulted(_))
        ));

        // A clean import rebuilds the backend and lifts the fault.
        dst.import(&good, DEFAULT_MAX_SNAPSHOT_BYTES).unwrap();
        assert!(dst.fault().is_none());
        assert_eq!(dst.position(), 3);
        assert_eq!(dst.committed_history(), &[1, 2, 3]);
        assert_eq!(dst.step(&[4]).unwrap(), 1);
    }
}
