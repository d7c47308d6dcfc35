//! Host function registration for Wasmtime linkers.
//!
//! Every import reads its arguments out of guest memory with the bounds
//! checks in [`worker_bridge_core::abi`] and reports failures as negative
//! status codes. Imports behind an optional capability return
//! [`abi::UNSUPPORTED`] when the current context does not carry it.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};
use wasmtime::{Caller, Extern, Linker};

use worker_bridge_common::{HostFunctionError, RuntimeError};
use worker_bridge_core::{EmailMessage, EventKind, GuestState, abi};

use crate::logging::{LoggingHost, level_from_i32};

/// Largest chunk a single `net.read` copies into the guest.
const MAX_READ_CHUNK: usize = 64 * 1024;

/// Register all host capability imports on a linker.
///
/// This registers:
/// - `env`: logging and environment bindings
/// - `http`: request metadata and response writer
/// - `ctx`: deferred work
/// - `net`: raw TCP sockets
/// - `email`: outgoing messages
/// - `queue`: per-message acknowledgements
///
/// # Errors
///
/// Returns an error if function registration fails.
pub fn register_all(linker: &mut Linker<GuestState>) -> Result<(), RuntimeError> {
    register_env(linker)?;
    register_http(linker)?;
    register_ctx(linker)?;
    register_net(linker)?;
    register_email(linker)?;
    register_queue(linker)?;
    Ok(())
}

fn registration_failed(name: &str, e: &wasmtime::Error) -> RuntimeError {
    RuntimeError::invalid_config(format!("Failed to register {name}: {e}"))
}

/// Log a failed import call and return its status.
fn fail(import: &str, err: &HostFunctionError) -> i32 {
    warn!(import, error = %err, "Host call failed");
    abi::status_of(err)
}

/// Register `env.log` and `env.get`.
///
/// # Memory Protocol
///
/// `env.log(level, ptr, len)`: level 0=debug, 1=info, 2=warn, 3=error.
///
/// `env.get(key_ptr, key_len, out_ptr, out_cap) -> i32`: writes at most
/// `out_cap` bytes of the value and returns its full length, or
/// [`abi::NOT_FOUND`].
pub fn register_env(linker: &mut Linker<GuestState>) -> Result<(), RuntimeError> {
    linker
        .func_wrap(
            "env",
            "log",
            |mut caller: Caller<'_, GuestState>, level: i32, ptr: i32, len: i32| {
                let message = match abi::read_bytes(&mut caller, ptr, len) {
                    Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                    Err(e) => {
                        warn!(error = %e, "Invalid log message");
                        return;
                    }
                };
                LoggingHost::log(caller.data_mut(), level_from_i32(level), &message);
            },
        )
        .map_err(|e| registration_failed("env.log", &e))?;

    linker
        .func_wrap(
            "env",
            "get",
            |mut caller: Caller<'_, GuestState>,
             key_ptr: i32,
             key_len: i32,
             out_ptr: i32,
             out_cap: i32|
             -> i32 {
                let key = match abi::read_str(&mut caller, key_ptr, key_len) {
                    Ok(key) => key,
                    Err(e) => return fail("env.get", &e),
                };
                let Some(value) = caller
                    .data()
                    .context()
                    .env()
                    .get(&key)
                    .map(|v| v.as_bytes().to_vec())
                else {
                    return abi::NOT_FOUND;
                };
                abi::copy_out(&mut caller, &value, out_ptr, out_cap)
            },
        )
        .map_err(|e| registration_failed("env.get", &e))?;

    Ok(())
}

/// Register the `http` request reader and response writer.
///
/// Readers return [`abi::NOT_FOUND`] outside a `fetch` invocation; writers
/// return [`abi::REJECTED`].
pub fn register_http(linker: &mut Linker<GuestState>) -> Result<(), RuntimeError> {
    linker
        .func_wrap(
            "http",
            "request_method",
            |mut caller: Caller<'_, GuestState>, out_ptr: i32, out_cap: i32| -> i32 {
                let Some(method) = caller
                    .data()
                    .invocation
                    .request
                    .as_ref()
                    .map(|r| r.method.clone().into_bytes())
                else {
                    return abi::NOT_FOUND;
                };
                abi::copy_out(&mut caller, &method, out_ptr, out_cap)
            },
        )
        .map_err(|e| registration_failed("http.request_method", &e))?;

    linker
        .func_wrap(
            "http",
            "request_url",
            |mut caller: Caller<'_, GuestState>, out_ptr: i32, out_cap: i32| -> i32 {
                let Some(url) = caller
                    .data()
                    .invocation
                    .request
                    .as_ref()
                    .map(|r| r.url.clone().into_bytes())
                else {
                    return abi::NOT_FOUND;
                };
                abi::copy_out(&mut caller, &url, out_ptr, out_cap)
            },
        )
        .map_err(|e| registration_failed("http.request_url", &e))?;

    linker
        .func_wrap(
            "http",
            "request_header",
            |mut caller: Caller<'_, GuestState>,
             name_ptr: i32,
             name_len: i32,
             out_ptr: i32,
             out_cap: i32|
             -> i32 {
                let name = match abi::read_str(&mut caller, name_ptr, name_len) {
                    Ok(name) => name,
                    Err(e) => return fail("http.request_header", &e),
                };
                let Some(value) = caller
                    .data()
                    .invocation
                    .request
                    .as_ref()
                    .and_then(|r| r.header(&name))
                    .map(|v| v.as_bytes().to_vec())
                else {
                    return abi::NOT_FOUND;
                };
                abi::copy_out(&mut caller, &value, out_ptr, out_cap)
            },
        )
        .map_err(|e| registration_failed("http.request_header", &e))?;

    linker
        .func_wrap(
            "http",
            "set_status",
            |mut caller: Caller<'_, GuestState>, status: i32| -> i32 {
                if !is_fetch(&caller) {
                    return abi::REJECTED;
                }
                let Ok(status) = u16::try_from(status) else {
                    return abi::INVALID;
                };
                if !(100..=599).contains(&status) {
                    return abi::INVALID;
                }
                caller.data_mut().invocation.response.status = status;
                abi::OK
            },
        )
        .map_err(|e| registration_failed("http.set_status", &e))?;

    linker
        .func_wrap(
            "http",
            "set_header",
            |mut caller: Caller<'_, GuestState>,
             name_ptr: i32,
             name_len: i32,
             value_ptr: i32,
             value_len: i32|
             -> i32 {
                if !is_fetch(&caller) {
                    return abi::REJECTED;
                }
                let name = match abi::read_str(&mut caller, name_ptr, name_len) {
                    Ok(name) if !name.is_empty() => name,
                    Ok(_) => return abi::INVALID,
                    Err(e) => return fail("http.set_header", &e),
                };
                let value = match abi::read_str(&mut caller, value_ptr, value_len) {
                    Ok(value) => value,
                    Err(e) => return fail("http.set_header", &e),
                };

                let headers = &mut caller.data_mut().invocation.response.headers;
                headers.retain(|(k, _)| !k.eq_ignore_ascii_case(&name));
                headers.push((name, value));
                abi::OK
            },
        )
        .map_err(|e| registration_failed("http.set_header", &e))?;

    linker
        .func_wrap(
            "http",
            "write_body",
            |mut caller: Caller<'_, GuestState>, ptr: i32, len: i32| -> i32 {
                if !is_fetch(&caller) {
                    return abi::REJECTED;
                }
                match abi::read_bytes(&mut caller, ptr, len) {
                    Ok(bytes) => {
                        caller
                            .data_mut()
                            .invocation
                            .response
                            .body
                            .extend_from_slice(&bytes);
                        len
                    }
                    Err(e) => fail("http.write_body", &e),
                }
            },
        )
        .map_err(|e| registration_failed("http.write_body", &e))?;

    Ok(())
}

fn is_fetch(caller: &Caller<'_, GuestState>) -> bool {
    caller.data().invocation.kind == Some(EventKind::Fetch)
}

/// Register `ctx.wait_until(name_ptr, name_len) -> i32`.
///
/// The named export must have the signature `() -> ()`. It runs after the
/// handler's result has been returned to the host.
pub fn register_ctx(linker: &mut Linker<GuestState>) -> Result<(), RuntimeError> {
    linker
        .func_wrap(
            "ctx",
            "wait_until",
            |mut caller: Caller<'_, GuestState>, ptr: i32, len: i32| -> i32 {
                if caller.data().invocation.kind.is_none() {
                    return abi::REJECTED;
                }
                let name = match abi::read_str(&mut caller, ptr, len) {
                    Ok(name) => name,
                    Err(e) => return fail("ctx.wait_until", &e),
                };
                if !matches!(caller.get_export(&name), Some(Extern::Func(_))) {
                    warn!(export = %name, "Deferred export not found");
                    return abi::NOT_FOUND;
                }

                debug!(export = %name, "Deferred work scheduled");
                caller.data_mut().invocation.deferred.push(name);
                abi::OK
            },
        )
        .map_err(|e| registration_failed("ctx.wait_until", &e))?;

    Ok(())
}

/// Register the `net` socket imports.
///
/// - `net.connect(host_ptr, host_len, port) -> handle`
/// - `net.write(handle, ptr, len) -> written`
/// - `net.read(handle, ptr, cap) -> read` (0 at end of stream)
/// - `net.close(handle) -> i32`
pub fn register_net(linker: &mut Linker<GuestState>) -> Result<(), RuntimeError> {
    linker
        .func_wrap_async(
            "net",
            "connect",
            |mut caller: Caller<'_, GuestState>, (host_ptr, host_len, port): (i32, i32, i32)| {
                Box::new(async move {
                    let Some(connector) = caller.data().context().connector().cloned() else {
                        return abi::UNSUPPORTED;
                    };
                    let host = match abi::read_str(&mut caller, host_ptr, host_len) {
                        Ok(host) => host,
                        Err(e) => return fail("net.connect", &e),
                    };
                    let Ok(port) = u16::try_from(port) else {
                        return abi::INVALID;
                    };

                    if caller.data().invocation.connections_opened >= connector.max_connections() {
                        return fail(
                            "net.connect",
                            &HostFunctionError::RateLimitExceeded {
                                operation: "connect".to_string(),
                            },
                        );
                    }
                    caller.data_mut().invocation.connections_opened += 1;

                    match connector.connect(&host, port).await {
                        Ok(stream) => caller
                            .data_mut()
                            .sockets
                            .insert(stream)
                            .unwrap_or(abi::REJECTED),
                        Err(e) => fail("net.connect", &e),
                    }
                })
            },
        )
        .map_err(|e| registration_failed("net.connect", &e))?;

    linker
        .func_wrap_async(
            "net",
            "write",
            |mut caller: Caller<'_, GuestState>, (handle, ptr, len): (i32, i32, i32)| {
                Box::new(async move {
                    let bytes = match abi::read_bytes(&mut caller, ptr, len) {
                        Ok(bytes) => bytes,
                        Err(e) => return fail("net.write", &e),
                    };
                    let Some(stream) = caller.data_mut().sockets.get_mut(handle) else {
                        return abi::NOT_FOUND;
                    };
                    match stream.write_all(&bytes).await {
                        Ok(()) => len,
                        Err(e) => fail("net.write", &HostFunctionError::io("write", e.to_string())),
                    }
                })
            },
        )
        .map_err(|e| registration_failed("net.write", &e))?;

    linker
        .func_wrap_async(
            "net",
            "read",
            |mut caller: Caller<'_, GuestState>, (handle, ptr, cap): (i32, i32, i32)| {
                Box::new(async move {
                    let Ok(cap) = usize::try_from(cap) else {
                        return abi::INVALID;
                    };
                    let mut buf = vec![0u8; cap.min(MAX_READ_CHUNK)];

                    let n = {
                        let Some(stream) = caller.data_mut().sockets.get_mut(handle) else {
                            return abi::NOT_FOUND;
                        };
                        match stream.read(&mut buf).await {
                            Ok(n) => n,
                            Err(e) => {
                                return fail("net.read", &HostFunctionError::io("read", e.to_string()));
                            }
                        }
                    };

                    match abi::write_bytes(&mut caller, ptr, &buf[..n]) {
                        Ok(()) => i32::try_from(n).unwrap_or(abi::INVALID),
                        Err(e) => fail("net.read", &e),
                    }
                })
            },
        )
        .map_err(|e| registration_failed("net.read", &e))?;

    linker
        .func_wrap(
            "net",
            "close",
            |mut caller: Caller<'_, GuestState>, handle: i32| -> i32 {
                match caller.data_mut().sockets.remove(handle) {
                    Some(_) => abi::OK,
                    None => abi::NOT_FOUND,
                }
            },
        )
        .map_err(|e| registration_failed("net.close", &e))?;

    Ok(())
}

/// Register the outgoing email imports.
///
/// - `email.message(from_ptr, from_len, to_ptr, to_len, raw_ptr, raw_len) -> handle`
/// - `email.send(handle) -> i32`
pub fn register_email(linker: &mut Linker<GuestState>) -> Result<(), RuntimeError> {
    linker
        .func_wrap(
            "email",
            "message",
            |mut caller: Caller<'_, GuestState>,
             from_ptr: i32,
             from_len: i32,
             to_ptr: i32,
             to_len: i32,
             raw_ptr: i32,
             raw_len: i32|
             -> i32 {
                if caller.data().context().mail().is_none() {
                    return abi::UNSUPPORTED;
                }
                let fields = abi::read_str(&mut caller, from_ptr, from_len).and_then(|from| {
                    let to = abi::read_str(&mut caller, to_ptr, to_len)?;
                    let raw = abi::read_str(&mut caller, raw_ptr, raw_len)?;
                    Ok(EmailMessage { from, to, raw })
                });

                match fields {
                    Ok(message) => caller
                        .data_mut()
                        .outbox
                        .insert(message)
                        .unwrap_or(abi::REJECTED),
                    Err(e) => fail("email.message", &e),
                }
            },
        )
        .map_err(|e| registration_failed("email.message", &e))?;

    linker
        .func_wrap_async(
            "email",
            "send",
            |mut caller: Caller<'_, GuestState>, (handle,): (i32,)| {
                Box::new(async move {
                    let Some(transport) = caller.data().context().mail().cloned() else {
                        return abi::UNSUPPORTED;
                    };
                    let Some(message) = caller.data_mut().outbox.remove(handle) else {
                        return abi::NOT_FOUND;
                    };
                    match transport.send(message).await {
                        Ok(()) => abi::OK,
                        Err(e) => fail("email.send", &e),
                    }
                })
            },
        )
        .map_err(|e| registration_failed("email.send", &e))?;

    Ok(())
}

/// Register the queue acknowledgement imports.
///
/// All return [`abi::REJECTED`] outside a `queue` invocation.
pub fn register_queue(linker: &mut Linker<GuestState>) -> Result<(), RuntimeError> {
    linker
        .func_wrap(
            "queue",
            "ack",
            |mut caller: Caller<'_, GuestState>, ptr: i32, len: i32| -> i32 {
                queue_decision(&mut caller, ptr, len, true)
            },
        )
        .map_err(|e| registration_failed("queue.ack", &e))?;

    linker
        .func_wrap(
            "queue",
            "retry",
            |mut caller: Caller<'_, GuestState>, ptr: i32, len: i32| -> i32 {
                queue_decision(&mut caller, ptr, len, false)
            },
        )
        .map_err(|e| registration_failed("queue.retry", &e))?;

    linker
        .func_wrap(
            "queue",
            "ack_all",
            |mut caller: Caller<'_, GuestState>| -> i32 {
                if !is_queue(&caller) {
                    return abi::REJECTED;
                }
                caller.data_mut().invocation.queue.ack_all = true;
                abi::OK
            },
        )
        .map_err(|e| registration_failed("queue.ack_all", &e))?;

    linker
        .func_wrap(
            "queue",
            "retry_all",
            |mut caller: Caller<'_, GuestState>| -> i32 {
                if !is_queue(&caller) {
                    return abi::REJECTED;
                }
                caller.data_mut().invocation.queue.retry_all = true;
                abi::OK
            },
        )
        .map_err(|e| registration_failed("queue.retry_all", &e))?;

    Ok(())
}

fn is_queue(caller: &Caller<'_, GuestState>) -> bool {
    caller.data().invocation.kind == Some(EventKind::Queue)
}

fn queue_decision(caller: &mut Caller<'_, GuestState>, ptr: i32, len: i32, ack: bool) -> i32 {
    if !is_queue(caller) {
        return abi::REJECTED;
    }
    let id = match abi::read_str(caller, ptr, len) {
        Ok(id) if !id.is_empty() => id,
        Ok(_) => return abi::INVALID,
        Err(e) => return fail("queue", &e),
    };

    let outcome = &mut caller.data_mut().invocation.queue;
    if ack {
        outcome.ack(id);
    } else {
        outcome.retry(id);
    }
    abi::OK
}

#[cfg(test)]
mod tests {
    use super::*;
    use worker_bridge_common::EngineConfig;
    use worker_bridge_core::WasmEngine;

    fn linker() -> Linker<GuestState> {
        let engine = WasmEngine::new(&EngineConfig {
            pooling_allocator: false,
            ..Default::default()
        })
        .unwrap();
        Linker::new(engine.inner())
    }

    #[test]
    fn test_register_env() {
        assert!(register_env(&mut linker()).is_ok());
    }

    #[test]
    fn test_register_all() {
        assert!(register_all(&mut linker()).is_ok());
    }

    #[test]
    fn test_register_twice_fails() {
        let mut linker = linker();
        register_queue(&mut linker).unwrap();
        assert!(matches!(
            register_queue(&mut linker),
            Err(RuntimeError::InvalidConfig { .. })
        ));
    }
}
