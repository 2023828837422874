//! `extern "C"` surface (`capi` feature): every function returns an `i32` status code (`0`
//! success, negative on error) over an opaque-handle registry, mirroring Fortran/C client
//! bindings. The handle-registry idiom (`u64` id → boxed value behind a `Mutex<HashMap<..>>`)
//! stands in for raw `Box::into_raw` pointer round-tripping, which is harder to keep panic-safe
//! across an FFI boundary.

use crate::client::FieldmuxClient;
use crate::config::Config;
use crate::metadata::Metadata;
use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_double, c_int};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

const STATUS_OK: c_int = 0;
const STATUS_INVALID_HANDLE: c_int = -1;
const STATUS_INVALID_ARGUMENT: c_int = -2;
const STATUS_RUNTIME_ERROR: c_int = -3;

struct Registry<T> {
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, T>>,
}

impl<T> Registry<T> {
    fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn insert(&self, value: T) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().unwrap().insert(id, value);
        id
    }

    fn remove(&self, id: u64) -> bool {
        self.entries.lock().unwrap().remove(&id).is_some()
    }
}

fn clients() -> &'static Registry<std::sync::Arc<FieldmuxClient>> {
    static CLIENTS: OnceLock<Registry<std::sync::Arc<FieldmuxClient>>> = OnceLock::new();
    CLIENTS.get_or_init(Registry::new)
}

fn metadata_registry() -> &'static Registry<Metadata> {
    static METADATA: OnceLock<Registry<Metadata>> = OnceLock::new();
    METADATA.get_or_init(Registry::new)
}

fn runtime() -> &'static tokio::runtime::Runtime {
    static RUNTIME: OnceLock<tokio::runtime::Runtime> = OnceLock::new();
    RUNTIME.get_or_init(|| tokio::runtime::Runtime::new().expect("failed to start FFI runtime"))
}

thread_local! {
    static LAST_ERROR: std::cell::RefCell<String> = std::cell::RefCell::new(String::new());
}

fn set_last_error(msg: impl Into<String>) {
    LAST_ERROR.with(|cell| *cell.borrow_mut() = msg.into());
}

/// Returns a thread-local human-readable detail for the last non-zero status this thread saw.
#[no_mangle]
pub extern "C" fn fieldmux_error_string() -> *mut c_char {
    LAST_ERROR.with(|cell| {
        CString::new(cell.borrow().clone())
            .unwrap_or_default()
            .into_raw()
    })
}

#[no_mangle]
pub extern "C" fn fieldmux_free_string(s: *mut c_char) {
    if s.is_null() {
        return;
    }
    unsafe {
        drop(CString::from_raw(s));
    }
}

/// Creates a client context from a YAML configuration document; writes the new handle into
/// `out_handle` and returns `0` on success.
///
/// # Safety
/// `config_yaml` must be a valid, NUL-terminated C string; `out_handle` must point to writable
/// memory for one `u64`.
#[no_mangle]
pub unsafe extern "C" fn fieldmux_new_context(
    config_yaml: *const c_char,
    bind_host: *const c_char,
    bind_port: u16,
    out_handle: *mut u64,
) -> c_int {
    if config_yaml.is_null() || bind_host.is_null() || out_handle.is_null() {
        set_last_error("null pointer argument");
        return STATUS_INVALID_ARGUMENT;
    }
    let yaml = match CStr::from_ptr(config_yaml).to_str() {
        Ok(s) => s,
        Err(e) => {
            set_last_error(e.to_string());
            return STATUS_INVALID_ARGUMENT;
        }
    };
    let host = match CStr::from_ptr(bind_host).to_str() {
        Ok(s) => s,
        Err(e) => {
            set_last_error(e.to_string());
            return STATUS_INVALID_ARGUMENT;
        }
    };

    let config = match Config::from_yaml(yaml) {
        Ok(c) => c,
        Err(e) => {
            set_last_error(e.to_string());
            return STATUS_INVALID_ARGUMENT;
        }
    };

    let client = runtime().block_on(FieldmuxClient::new(&config, host, bind_port, 0));
    match client {
        Ok(client) => {
            *out_handle = clients().insert(std::sync::Arc::new(client));
            STATUS_OK
        }
        Err(e) => {
            set_last_error(e.to_string());
            STATUS_RUNTIME_ERROR
        }
    }
}

#[no_mangle]
pub extern "C" fn fieldmux_delete_context(handle: u64) -> c_int {
    if clients().remove(handle) {
        STATUS_OK
    } else {
        STATUS_INVALID_HANDLE
    }
}

#[no_mangle]
pub extern "C" fn fieldmux_new_metadata() -> u64 {
    metadata_registry().insert(Metadata::new())
}

#[no_mangle]
pub extern "C" fn fieldmux_delete_metadata(handle: u64) -> c_int {
    if metadata_registry().remove(handle) {
        STATUS_OK
    } else {
        STATUS_INVALID_HANDLE
    }
}

/// # Safety
/// `key` must be a valid, NUL-terminated C string.
#[no_mangle]
pub unsafe extern "C" fn fieldmux_metadata_set_double(
    metadata_handle: u64,
    key: *const c_char,
    value: c_double,
) -> c_int {
    let Some(key) = c_str_to_owned(key) else {
        return STATUS_INVALID_ARGUMENT;
    };
    with_metadata_mut(metadata_handle, |m| m.set(key, value))
}

/// # Safety
/// `key` must be a valid, NUL-terminated C string.
#[no_mangle]
pub unsafe extern "C" fn fieldmux_metadata_set_int(
    metadata_handle: u64,
    key: *const c_char,
    value: i64,
) -> c_int {
    let Some(key) = c_str_to_owned(key) else {
        return STATUS_INVALID_ARGUMENT;
    };
    with_metadata_mut(metadata_handle, |m| m.set(key, value))
}

/// # Safety
/// `key` and `value` must be valid, NUL-terminated C strings.
#[no_mangle]
pub unsafe extern "C" fn fieldmux_metadata_set_string(
    metadata_handle: u64,
    key: *const c_char,
    value: *const c_char,
) -> c_int {
    let Some(key) = c_str_to_owned(key) else {
        return STATUS_INVALID_ARGUMENT;
    };
    let Some(value) = c_str_to_owned(value) else {
        return STATUS_INVALID_ARGUMENT;
    };
    with_metadata_mut(metadata_handle, |m| m.set(key, value))
}

unsafe fn c_str_to_owned(s: *const c_char) -> Option<String> {
    if s.is_null() {
        return None;
    }
    CStr::from_ptr(s).to_str().ok().map(|s| s.to_string())
}

fn with_metadata_mut(handle: u64, f: impl FnOnce(&mut Metadata)) -> c_int {
    let mut entries = metadata_registry().entries.lock().unwrap();
    match entries.get_mut(&handle) {
        Some(m) => {
            f(m);
            STATUS_OK
        }
        None => {
            set_last_error("unknown metadata handle");
            STATUS_INVALID_HANDLE
        }
    }
}

/// # Safety
/// `data` must point to at least `len` contiguous `f64`s.
#[no_mangle]
pub unsafe extern "C" fn fieldmux_write_field(
    context_handle: u64,
    metadata_handle: u64,
    data: *const c_double,
    len: usize,
) -> c_int {
    if data.is_null() {
        set_last_error("null data pointer");
        return STATUS_INVALID_ARGUMENT;
    }
    let slice = std::slice::from_raw_parts(data, len);
    let Some(client) = clients().entries.lock().unwrap().get(&context_handle).cloned() else {
        set_last_error("unknown context handle");
        return STATUS_INVALID_HANDLE;
    };
    let Some(metadata) = metadata_registry().entries.lock().unwrap().get(&metadata_handle).cloned() else {
        set_last_error("unknown metadata handle");
        return STATUS_INVALID_HANDLE;
    };

    match runtime().block_on(client.write_field(metadata, slice)) {
        Ok(()) => STATUS_OK,
        Err(e) => {
            set_last_error(e.to_string());
            STATUS_RUNTIME_ERROR
        }
    }
}

#[no_mangle]
pub extern "C" fn fieldmux_flush(context_handle: u64, metadata_handle: u64) -> c_int {
    let Some(client) = clients().entries.lock().unwrap().get(&context_handle).cloned() else {
        set_last_error("unknown context handle");
        return STATUS_INVALID_HANDLE;
    };
    let Some(metadata) = metadata_registry().entries.lock().unwrap().get(&metadata_handle).cloned() else {
        set_last_error("unknown metadata handle");
        return STATUS_INVALID_HANDLE;
    };

    match runtime().block_on(client.flush(metadata)) {
        Ok(()) => STATUS_OK,
        Err(e) => {
            set_last_error(e.to_string());
            STATUS_RUNTIME_ERROR
        }
    }
}

#[no_mangle]
pub extern "C" fn fieldmux_version() -> *const c_char {
    static VERSION: OnceLock<CString> = OnceLock::new();
    VERSION
        .get_or_init(|| CString::new(FieldmuxClient::version()).unwrap())
        .as_ptr()
}
