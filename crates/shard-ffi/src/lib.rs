mod context;
mod error;
mod types;

pub use context::{register_engine_factory, runtime};
pub use error::*;
pub use types::*;

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int};
use std::slice;

use shard_session::{SessionError, SessionId, SNAPSHOT_HEADER_SIZE};
use tracing::warn;

use context::with_handle;

type FfiResult = Result<c_int, SessionError>;

/// Run an FFI body, converting errors and panics into negative status codes.
///
/// The error message is stored for `shard_last_error`.
fn ffi_call<F: FnOnce() -> FfiResult + std::panic::UnwindSafe>(f: F) -> c_int {
    match std::panic::catch_unwind(f) {
        Ok(Ok(value)) => value,
        Ok(Err(e)) => {
            let status = ShardStatus::from(&e);
            set_last_error(e.to_string());
            status.code()
        }
        Err(_) => {
            tracing::error!("panic caught at FFI boundary");
            set_last_error("internal panic");
            ShardStatus::ShardErrorInternal.code()
        }
    }
}

fn invalid(msg: &str) -> SessionError {
    SessionError::InvalidArgument(msg.to_string())
}

fn to_c_int(n: usize) -> FfiResult {
    c_int::try_from(n).map_err(|_| SessionError::LimitExceeded {
        size: n,
        limit: c_int::MAX as usize,
    })
}

/// Non-negative `c_int` to `usize`, rejecting negatives as invalid arguments.
fn non_negative(value: c_int, what: &str) -> Result<usize, SessionError> {
    usize::try_from(value).map_err(|_| invalid(&format!("{} must not be negative", what)))
}

/// Create a decode session from a model reference.
///
/// Returns a non-zero handle, or 0 on failure (see `shard_last_error`).
/// The handle must be released with `shard_free`.
#[no_mangle]
pub unsafe extern "C" fn shard_init(model_ref: *const c_char) -> u64 {
    let result = std::panic::catch_unwind(|| {
        if model_ref.is_null() {
            return Err(invalid("model reference is null"));
        }
        let reference = unsafe { CStr::from_ptr(model_ref) }
            .to_str()
            .map_err(|e| invalid(&format!("model reference is not UTF-8: {}", e)))?;
        runtime().create(reference)
    });
    match result {
        Ok(Ok(id)) => id.to_raw(),
        Ok(Err(e)) => {
            warn!(error = %e, "shard_init failed");
            set_last_error(e.to_string());
            0
        }
        Err(_) => {
            tracing::error!("panic caught in shard_init");
            set_last_error("internal panic");
            0
        }
    }
}

/// Destroy a session. Unknown, stale and zero handles are ignored, so a
/// second free of the same handle is a no-op.
#[no_mangle]
pub extern "C" fn shard_free(handle: u64) {
    let result = std::panic::catch_unwind(|| {
        if let Some(id) = SessionId::from_raw(handle) {
            runtime().destroy(id);
        }
    });
    if result.is_err() {
        tracing::error!("panic caught in shard_free");
        set_last_error("internal panic");
    }
}

/// Advance the session by `num_tokens` tokens.
///
/// Returns the number of tokens consumed; 0 for an empty batch, which
/// leaves the session untouched. `tokens` must be non-null even then.
#[no_mangle]
pub unsafe extern "C" fn shard_eval(handle: u64, tokens: *const c_int, num_tokens: c_int) -> c_int {
    ffi_call(|| {
        if tokens.is_null() {
            return Err(invalid("tokens is null"));
        }
        let n = non_negative(num_tokens, "num_tokens")?;
        let raw: &[c_int] = if n == 0 {
            &[]
        } else {
            unsafe { slice::from_raw_parts(tokens, n) }
        };
        let ids = raw
            .iter()
            .map(|&t| u32::try_from(t).map_err(|_| invalid(&format!("negative token id {}", t))))
            .collect::<Result<Vec<u32>, _>>()?;
        let advanced = with_handle(handle, |s| s.step(&ids))?;
        to_c_int(advanced)
    })
}

/// Copy the current scores into `out_buffer`, zero-padding past the
/// backend's score width. Returns `top_k_size`.
#[no_mangle]
pub unsafe extern "C" fn shard_get_logits(
    handle: u64,
    out_buffer: *mut f32,
    top_k_size: c_int,
) -> c_int {
    ffi_call(|| {
        if out_buffer.is_null() || top_k_size <= 0 {
            return Err(invalid("out_buffer must be non-null and top_k_size positive"));
        }
        let out = unsafe { slice::from_raw_parts_mut(out_buffer, top_k_size as usize) };
        let written = with_handle(handle, |s| s.peek_scores_into(out))?;
        to_c_int(written)
    })
}

/// Undo up to `steps` committed tokens. Returns how many were undone.
#[no_mangle]
pub extern "C" fn shard_rollback(handle: u64, steps: c_int) -> c_int {
    ffi_call(|| {
        let steps = non_negative(steps, "steps")?;
        let undone = with_handle(handle, |s| s.rollback(steps))?;
        to_c_int(undone)
    })
}

/// Exact size in bytes `shard_kv_snapshot_export` would write now.
#[no_mangle]
pub extern "C" fn shard_kv_snapshot_size(handle: u64) -> c_int {
    ffi_call(|| {
        let size = with_handle(handle, |s| s.snapshot_size())?;
        to_c_int(size)
    })
}

/// Serialize the session into `out_buffer`.
///
/// Returns bytes written, -2 if the snapshot exceeds `max_snapshot_bytes`,
/// -3 if it exceeds `out_buffer_size`. Nothing is written on failure.
#[no_mangle]
pub unsafe extern "C" fn shard_kv_snapshot_export(
    handle: u64,
    out_buffer: *mut u8,
    out_buffer_size: c_int,
    max_snapshot_bytes: c_int,
) -> c_int {
    ffi_call(|| {
        if out_buffer.is_null() {
            return Err(invalid("out_buffer is null"));
        }
        let capacity = non_negative(out_buffer_size, "out_buffer_size")?;
        let max = non_negative(max_snapshot_bytes, "max_snapshot_bytes")?;
        let out = unsafe { slice::from_raw_parts_mut(out_buffer, capacity) };
        let written = with_handle(handle, |s| s.export(out, max))?;
        to_c_int(written)
    })
}

/// Restore a snapshot produced by `shard_kv_snapshot_export`.
///
/// Returns 0 on success. On failure the session is unchanged.
#[no_mangle]
pub unsafe extern "C" fn shard_kv_snapshot_import(
    handle: u64,
    snapshot_data: *const u8,
    snapshot_size: c_int,
    max_snapshot_bytes: c_int,
) -> c_int {
    ffi_call(|| {
        if snapshot_data.is_null() {
            return Err(invalid("snapshot_data is null"));
        }
        let size = non_negative(snapshot_size, "snapshot_size")?;
        let max = non_negative(max_snapshot_bytes, "max_snapshot_bytes")?;
        let bytes = unsafe { slice::from_raw_parts(snapshot_data, size) };
        with_handle(handle, |s| s.import(bytes, max))?;
        Ok(ShardStatus::ShardOk.code())
    })
}

/// Tokenize NUL-terminated UTF-8 `text` into `out_tokens`.
///
/// Returns the token count, or -3 if more than `max_tokens` are produced.
#[no_mangle]
pub unsafe extern "C" fn shard_tokenize(
    handle: u64,
    text: *const c_char,
    out_tokens: *mut c_int,
    max_tokens: c_int,
) -> c_int {
    ffi_call(|| {
        if text.is_null() || out_tokens.is_null() {
            return Err(invalid("text and out_tokens must be non-null"));
        }
        let max = non_negative(max_tokens, "max_tokens")?;
        let text = unsafe { CStr::from_ptr(text) }
            .to_str()
            .map_err(|e| invalid(&format!("text is not UTF-8: {}", e)))?;

        let ids = with_handle(handle, |s| s.tokenize(text))?;
        if ids.len() > max {
            return Err(SessionError::BufferTooSmall {
                needed: ids.len(),
                capacity: max,
            });
        }
        let out = unsafe { slice::from_raw_parts_mut(out_tokens, ids.len()) };
        for (slot, &id) in out.iter_mut().zip(&ids) {
            *slot = c_int::try_from(id)
                .map_err(|_| SessionError::Internal(format!("token id {} overflows int", id)))?;
        }
        to_c_int(ids.len())
    })
}

/// Write the text bytes of `token_id` into `out_buffer`.
///
/// No NUL terminator is written. Returns the byte count, or -3 if the
/// piece is longer than `buffer_size`.
#[no_mangle]
pub unsafe extern "C" fn shard_token_to_piece(
    handle: u64,
    token_id: c_int,
    out_buffer: *mut c_char,
    buffer_size: c_int,
) -> c_int {
    ffi_call(|| {
        if out_buffer.is_null() {
            return Err(invalid("out_buffer is null"));
        }
        let token = u32::try_from(token_id)
            .map_err(|_| invalid(&format!("negative token id {}", token_id)))?;
        let capacity = non_negative(buffer_size, "buffer_size")?;

        let piece = with_handle(handle, |s| s.token_to_piece(token))?;
        if piece.len() > capacity {
            return Err(SessionError::BufferTooSmall {
                needed: piece.len(),
                capacity,
            });
        }
        let out = unsafe { slice::from_raw_parts_mut(out_buffer.cast::<u8>(), piece.len()) };
        out.copy_from_slice(&piece);
        to_c_int(piece.len())
    })
}

/// Approximate device memory held by the session's backend, in MiB.
#[no_mangle]
pub extern "C" fn shard_get_vram_usage(handle: u64) -> c_int {
    ffi_call(|| {
        let mib = with_handle(handle, |s| Ok(s.memory_usage_mib()))?;
        to_c_int(mib)
    })
}

/// Size of the fixed snapshot header, in bytes.
#[no_mangle]
pub extern "C" fn shard_snapshot_header_size() -> c_int {
    SNAPSHOT_HEADER_SIZE as c_int
}

/// Retrieve the last error message on this thread.
///
/// Returns null if no error has occurred since the last call. The caller
/// must free the returned string with `shard_free_string`.
#[no_mangle]
pub extern "C" fn shard_last_error() -> *mut c_char {
    match take_last_error() {
        Some(e) => e.into_raw(),
        None => std::ptr::null_mut(),
    }
}

/// Free a string previously returned by `shard_last_error`.
#[no_mangle]
pub unsafe extern "C" fn shard_free_string(s: *mut c_char) {
    if !s.is_null() {
        drop(CString::from_raw(s));
    }
}
