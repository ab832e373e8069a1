//! Host imports exposed to WASM guests.
//!
//! Everything crosses the boundary as bytes in the guest's own linear memory:
//! the guest passes `(offset, length)` pairs, the host copies them out, and
//! responses are copied back in only when the guest asks for them.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde_json::Value;
use wasmtime::{Caller, Linker, Memory, StoreLimits};

use xcapsule_types::{GuestContext, SandboxError};

/// Host module name
pub const HOST_MODULE: &str = "env";

/// Imports a guest module may declare. Anything else fails validation.
pub const HOST_IMPORTS: &[&str] = &["dispatch", "response_len", "response_read", "print"];

/// Dispatch status codes returned to the guest
pub const STATUS_OK: i32 = 0;
pub const STATUS_INVALID_ARGUMENTS: i32 = 3;

/// Per-execution store state
pub struct GuestState {
    pub guest: Arc<GuestContext>,
    pub limits: StoreLimits,
    /// Result JSON or error text from the most recent dispatch
    pub last_response: Vec<u8>,
}

impl GuestState {
    pub fn new(guest: Arc<GuestContext>, limits: StoreLimits) -> Self {
        Self {
            guest,
            limits,
            last_response: Vec::new(),
        }
    }
}

/// Register host functions into linker
pub fn register_host_functions(linker: &mut Linker<GuestState>) -> Result<(), SandboxError> {
    linker
        .func_wrap(HOST_MODULE, "dispatch", dispatch_impl)
        .map_err(SandboxError::internal)?;
    linker
        .func_wrap(HOST_MODULE, "response_len", response_len_impl)
        .map_err(SandboxError::internal)?;
    linker
        .func_wrap(HOST_MODULE, "response_read", response_read_impl)
        .map_err(SandboxError::internal)?;
    linker
        .func_wrap(HOST_MODULE, "print", print_impl)
        .map_err(SandboxError::internal)?;
    Ok(())
}

fn get_memory(caller: &mut Caller<'_, GuestState>) -> Result<Memory> {
    caller
        .get_export("memory")
        .and_then(|e| e.into_memory())
        .ok_or_else(|| anyhow!("Missing export: memory"))
}

fn guest_span(ptr: i32, len: i32) -> Result<(usize, usize)> {
    if ptr < 0 || len < 0 {
        return Err(anyhow!("invalid guest span ({}, {})", ptr, len));
    }
    let start = ptr as usize;
    let end = start
        .checked_add(len as usize)
        .ok_or_else(|| anyhow!("guest span overflows"))?;
    Ok((start, end))
}

fn read_bytes(caller: &mut Caller<'_, GuestState>, ptr: i32, len: i32) -> Result<Vec<u8>> {
    let memory = get_memory(caller)?;
    let (start, end) = guest_span(ptr, len)?;
    memory
        .data(&*caller)
        .get(start..end)
        .map(|bytes| bytes.to_vec())
        .ok_or_else(|| anyhow!("out-of-bounds guest memory read at {}..{}", start, end))
}

fn write_bytes(caller: &mut Caller<'_, GuestState>, ptr: i32, bytes: &[u8]) -> Result<()> {
    let memory = get_memory(caller)?;
    let (start, _) = guest_span(ptr, bytes.len() as i32)?;
    memory
        .write(caller, start, bytes)
        .map_err(|e| anyhow!(e.to_string()))
}

fn dispatch_impl(
    mut caller: Caller<'_, GuestState>,
    name_ptr: i32,
    name_len: i32,
    args_ptr: i32,
    args_len: i32,
) -> Result<i32> {
    let name_bytes = read_bytes(&mut caller, name_ptr, name_len)?;
    let args_bytes = read_bytes(&mut caller, args_ptr, args_len)?;

    let decoded = String::from_utf8(name_bytes)
        .map_err(|e| format!("capability name is not UTF-8: {}", e))
        .and_then(|name| {
            let args = if args_bytes.is_empty() {
                Value::Object(Default::default())
            } else {
                serde_json::from_slice(&args_bytes)
                    .map_err(|e| format!("arguments are not JSON: {}", e))?
            };
            Ok((name, args))
        });
    let (name, args) = match decoded {
        Ok(pair) => pair,
        Err(message) => {
            caller.data_mut().last_response = message.into_bytes();
            return Ok(STATUS_INVALID_ARGUMENTS);
        }
    };

    let guest = caller.data().guest.clone();
    let (status, response) = match guest.dispatch(&name, args) {
        Ok(value) => (STATUS_OK, serde_json::to_vec(&value)?),
        Err(err) => (err.status_code(), err.to_string().into_bytes()),
    };
    caller.data_mut().last_response = response;
    Ok(status)
}

fn response_len_impl(caller: Caller<'_, GuestState>) -> i32 {
    caller.data().last_response.len() as i32
}

fn response_read_impl(mut caller: Caller<'_, GuestState>, dst_ptr: i32, dst_len: i32) -> Result<i32> {
    if dst_len < 0 {
        return Err(anyhow!("invalid destination length {}", dst_len));
    }
    let response = caller.data().last_response.clone();
    let n = response.len().min(dst_len as usize);
    write_bytes(&mut caller, dst_ptr, &response[..n])?;
    Ok(n as i32)
}

fn print_impl(mut caller: Caller<'_, GuestState>, ptr: i32, len: i32) -> Result<()> {
    let bytes = read_bytes(&mut caller, ptr, len)?;
    caller
        .data()
        .guest
        .write_stdout(&String::from_utf8_lossy(&bytes));
    Ok(())
}
