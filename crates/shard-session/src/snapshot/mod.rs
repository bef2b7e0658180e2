pub mod codec;
pub mod header;

pub use header::{
    SnapshotHeader, DEFAULT_MAX_SNAPSHOT_BYTES, SNAPSHOT_FORMAT_VERSION, SNAPSHOT_HEADER_SIZE,
    SNAPSHOT_MAGIC,
};
