use std::sync::OnceLock;

use shard_backend::{EngineFactory, EngineFamily};
use shard_session::{Runtime, Session, SessionError, SessionId};

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// The process-wide runtime behind every `shard_*` handle.
///
/// Created on first use with the `deterministic` and `fixed` families.
pub fn runtime() -> &'static Runtime {
    RUNTIME.get_or_init(Runtime::with_default_families)
}

/// Make bare model paths and `engine:` references load through `factory`.
///
/// For Rust code that links this crate and owns a real engine binding.
/// Fails if engine sessions are still alive.
pub fn register_engine_factory<F: EngineFactory + 'static>(
    factory: F,
) -> Result<(), SessionError> {
    runtime().register_family(EngineFamily::new(factory))
}

/// Resolve a raw handle and run `f` on its session.
pub(crate) fn with_handle<R>(
    handle: u64,
    f: impl FnOnce(&mut Session) -> Result<R, SessionError>,
) -> Result<R, SessionError> {
    let id = SessionId::from_raw(handle)
        .ok_or_else(|| SessionError::InvalidArgument("null session handle".to_string()))?;
    runtime().with_session(id, f)
}
