//! Guest memory access and status codes shared by every import.
//!
//! Imports receive `(ptr, len)` pairs pointing into the guest's exported
//! `memory` and report failures as negative status codes.

use wasmtime::{Caller, Extern, Memory};

use worker_bridge_common::HostFunctionError;

/// Import succeeded.
pub const OK: i32 = 0;
/// An argument was out of bounds or malformed.
pub const INVALID: i32 = -1;
/// The requested item does not exist.
pub const NOT_FOUND: i32 = -2;
/// The capability is not offered on this deployment target.
pub const UNSUPPORTED: i32 = -3;
/// The permission system refused the operation.
pub const DENIED: i32 = -4;
/// Network or mail I/O failed.
pub const IO: i32 = -5;
/// The host refused the request in its current state.
pub const REJECTED: i32 = -6;

/// Map a capability error to the status returned to the guest.
pub fn status_of(err: &HostFunctionError) -> i32 {
    match err {
        HostFunctionError::Unsupported { .. } => UNSUPPORTED,
        HostFunctionError::PermissionDenied { .. } | HostFunctionError::RateLimitExceeded { .. } => {
            DENIED
        }
        HostFunctionError::InvalidArgument { .. } => INVALID,
        HostFunctionError::Io { .. } => IO,
    }
}

/// The guest's exported linear memory.
pub fn memory<T>(caller: &mut Caller<'_, T>) -> Result<Memory, HostFunctionError> {
    caller
        .get_export("memory")
        .and_then(Extern::into_memory)
        .ok_or_else(|| HostFunctionError::invalid_argument("guest does not export 'memory'"))
}

/// Validate a `(ptr, len)` pair against a memory of `size` bytes.
#[allow(clippy::cast_sign_loss)]
fn span(ptr: i32, len: i32, size: usize) -> Result<std::ops::Range<usize>, HostFunctionError> {
    if ptr < 0 || len < 0 {
        return Err(HostFunctionError::invalid_argument(format!(
            "negative pointer or length ({ptr}, {len})"
        )));
    }

    let start = ptr as usize;
    let end = start
        .checked_add(len as usize)
        .ok_or_else(|| HostFunctionError::invalid_argument("pointer + length overflow"))?;

    if end > size {
        return Err(HostFunctionError::invalid_argument(format!(
            "memory access {start}..{end} out of bounds (size {size})"
        )));
    }

    Ok(start..end)
}

/// Copy `len` bytes at `ptr` out of guest memory.
pub fn read_bytes<T>(
    caller: &mut Caller<'_, T>,
    ptr: i32,
    len: i32,
) -> Result<Vec<u8>, HostFunctionError> {
    let memory = memory(caller)?;
    let data = memory.data(&*caller);
    let range = span(ptr, len, data.len())?;
    Ok(data[range].to_vec())
}

/// Read a UTF-8 string out of guest memory.
pub fn read_str<T>(
    caller: &mut Caller<'_, T>,
    ptr: i32,
    len: i32,
) -> Result<String, HostFunctionError> {
    let bytes = read_bytes(caller, ptr, len)?;
    String::from_utf8(bytes).map_err(|_| HostFunctionError::invalid_argument("invalid utf-8"))
}

/// Write `bytes` into guest memory at `ptr`.
pub fn write_bytes<T>(
    caller: &mut Caller<'_, T>,
    ptr: i32,
    bytes: &[u8],
) -> Result<(), HostFunctionError> {
    let memory = memory(caller)?;
    let len = i32::try_from(bytes.len())
        .map_err(|_| HostFunctionError::invalid_argument("value larger than guest memory"))?;
    let range = span(ptr, len, memory.data_size(&*caller))?;
    memory.data_mut(&mut *caller)[range].copy_from_slice(bytes);
    Ok(())
}

/// Copy `value` into a guest buffer of `out_cap` bytes.
///
/// Writes at most `out_cap` bytes and returns the full length of `value`, so
/// the guest can retry with a larger buffer when the result exceeds `out_cap`.
pub fn copy_out<T>(caller: &mut Caller<'_, T>, value: &[u8], out_ptr: i32, out_cap: i32) -> i32 {
    let Ok(full_len) = i32::try_from(value.len()) else {
        return INVALID;
    };
    if out_cap < 0 {
        return INVALID;
    }

    #[allow(clippy::cast_sign_loss)]
    let n = value.len().min(out_cap as usize);
    match write_bytes(caller, out_ptr, &value[..n]) {
        Ok(()) => full_len,
        Err(e) => status_of(&e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_bounds() {
        assert_eq!(span(0, 4, 16).unwrap(), 0..4);
        assert_eq!(span(12, 4, 16).unwrap(), 12..16);
        assert!(span(13, 4, 16).is_err());
        assert!(span(-1, 4, 16).is_err());
        assert!(span(0, -4, 16).is_err());
        assert!(span(i32::MAX, i32::MAX, usize::MAX).is_ok());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_of(&HostFunctionError::Unsupported { capability: "net" }),
            UNSUPPORTED
        );
        assert_eq!(
            status_of(&HostFunctionError::RateLimitExceeded {
                operation: "connect".into()
            }),
            DENIED
        );
        assert_eq!(status_of(&HostFunctionError::io("read", "reset")), IO);
        assert_eq!(
            status_of(&HostFunctionError::invalid_argument("bad")),
            INVALID
        );
    }
}
