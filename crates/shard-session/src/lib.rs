//! `shard-session` - incremental decode sessions for shard-engine.
//!
//! A `Session` wraps one backend and keeps the logical token history in step
//! with the backend's physical context across `step`, `rollback` and
//! snapshot `export`/`import`. A `Runtime` owns sessions behind opaque ids
//! and the bootstrap/teardown of each backend family.

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod rollback;
pub mod session;
pub mod snapshot;

pub use config::{ModelReference, DEFAULT_SCHEME, KNOWN_SCHEMES};
pub use error::{Result, SessionError};
pub use lifecycle::{Runtime, SessionId};
pub use session::Session;
pub use snapshot::{
    SnapshotHeader, DEFAULT_MAX_SNAPSHOT_BYTES, SNAPSHOT_FORMAT_VERSION, SNAPSHOT_HEADER_SIZE,
    SNAPSHOT_MAGIC,
};
