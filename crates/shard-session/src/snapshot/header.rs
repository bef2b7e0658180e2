use std::io::Read;

use crate::error::{Result, SessionError};

/// The four-byte magic number identifying a session snapshot: ASCII "SHKV".
pub const SNAPSHOT_MAGIC: [u8; 4] = [0x53, 0x48, 0x4B, 0x56];

/// Snapshot layout version written by this release. Any other value is rejected.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Size of the fixed header that precedes the backend payload.
pub const SNAPSHOT_HEADER_SIZE: usize = 16;

/// Ceiling callers can pass when they have no stricter limit of their own.
pub const DEFAULT_MAX_SNAPSHOT_BYTES: usize = 64 * 1024 * 1024;

/// Parsed snapshot header.
///
/// Layout (all integers u32 little-endian):
///   - 4 bytes: magic "SHKV"
///   - 4 bytes: format version
///   - 4 bytes: session position at capture time
///   - 4 bytes: payload size in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotHeader {
    pub version: u32,
    pub position: u32,
    pub payload_size: u32,
}

impl SnapshotHeader {
    /// Header for the current format version.
    pub fn new(position: u32, payload_size: u32) -> Self {
        Self {
            version: SNAPSHOT_FORMAT_VERSION,
            position,
            payload_size,
        }
    }

    /// Parse a header from the beginning of a reader.
    ///
    /// Reads and validates the magic and version before the remaining
    /// fields, so a foreign blob is reported as a format mismatch rather
    /// than as corruption.
    pub fn parse(reader: &mut impl Read) -> Result<SnapshotHeader> {
        let mut magic = [0u8; 4];
        read_exact(reader, &mut magic)?;
        if magic != SNAPSHOT_MAGIC {
            return Err(SessionError::FormatMismatch(format!(
                "expected magic {:?}, got {:?}",
                SNAPSHOT_MAGIC, magic
            )));
        }

        let mut buf4 = [0u8; 4];
        read_exact(reader, &mut buf4)?;
        let version = u32::from_le_bytes(buf4);
        if version != SNAPSHOT_FORMAT_VERSION {
            return Err(SessionError::FormatMismatch(format!(
                "unsupported snapshot version {} (expected {})",
                version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        read_exact(reader, &mut buf4)?;
        let position = u32::from_le_bytes(buf4);

        read_exact(reader, &mut buf4)?;
        let payload_size = u32::from_le_bytes(buf4);

        Ok(SnapshotHeader {
            version,
            position,
            payload_size,
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&SNAPSHOT_MAGIC);
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.position.to_le_bytes());
        out.extend_from_slice(&self.payload_size.to_le_bytes());
    }

    /// Header plus payload.
    pub fn total_size(&self) -> usize {
        SNAPSHOT_HEADER_SIZE + self.payload_size as usize
    }
}

fn read_exact(reader: &mut impl Read, buf: &mut [u8]) -> Result<()> {
    reader
        .read_exact(buf)
        .map_err(|e| SessionError::CorruptedSnapshot(format!("short header: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_bytes(magic: [u8; 4], version: u32, position: u32, payload: u32) -> Vec<u8> {
        let mut out = magic.to_vec();
        out.extend_from_slice(&version.to_le_bytes());
        out.extend_from_slice(&position.to_le_bytes());
        out.extend_from_slice(&payload.to_le_bytes());
        out
    }

    #[test]
    fn test_write_matches_layout() {
        let mut out = Vec::new();
        SnapshotHeader::new(2, 12).write(&mut out);
        assert_eq!(out, header_bytes(SNAPSHOT_MAGIC, 1, 2, 12));
        assert_eq!(out.len(), SNAPSHOT_HEADER_SIZE);
    }

    #[test]
    fn test_parse() {
        let bytes = header_bytes(SNAPSHOT_MAGIC, 1, 7, 40);
        let h = SnapshotHeader::parse(&mut &bytes[..]).unwrap();
        assert_eq!(h, SnapshotHeader::new(7, 40));
        assert_eq!(h.total_size(), 56);
    }

    #[test]
    fn test_bad_magic() {
        let bytes = header_bytes(*b"GGUF", 1, 0, 0);
        assert!(matches!(
            SnapshotHeader::parse(&mut &bytes[..]),
            Err(SessionError::FormatMismatch(_))
        ));
    }

    #[test]
    fn test_bad_version() {
        let bytes = header_bytes(SNAPSHOT_MAGIC, 2, 0, 0);
        assert!(matches!(
            SnapshotHeader::parse(&mut &bytes[..]),
            Err(SessionError::FormatMismatch(_))
        ));
    }

    #[test]
    fn test_short_header() {
        let bytes = header_bytes(SNAPSHOT_MAGIC, 1, 0, 0);
        assert!(matches!(
            SnapshotHeader::parse(&mut &bytes[..10]),
            Err(SessionError::CorruptedSnapshot(_))
        ));
    }
}
