//! C ABI entry points called by the host.
//!
//! Every entry point catches errors and panics, writes them to the log and
//! returns its failure value (`false` or null). Nothing unwinds into the
//! host.
//!
//! The host is expected to call in one at a time. The bridge state is only
//! ever `try_lock`ed, so an overlapping call fails with
//! [`BridgeError::Busy`] instead of blocking.

use std::any::Any;
use std::ffi::{CStr, CString, c_char, c_void};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};

use plughost_core::HostHandle;
use tracing_subscriber::EnvFilter;

use crate::bridge::NativeBridge;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::services::{BridgeServices, HostCallbacks, ManagedCallbacks};

/// Environment variable holding the log filter.
pub const LOG_ENV: &str = "PLUGHOST_LOG";

/// Table of bridge entry points written out at initialize.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PluginsCallbacks {
    pub load_project_module: unsafe extern "C" fn(*const c_char, *mut *mut c_char) -> bool,
    pub load_tooling_module: unsafe extern "C" fn(*const c_char, *const c_void, i32) -> *mut c_void,
    pub unload_project_module: extern "C" fn() -> bool,
}

impl PluginsCallbacks {
    pub fn new() -> Self {
        Self {
            load_project_module: plughost_load_project_module,
            load_tooling_module: plughost_load_tooling_module,
            unload_project_module: plughost_unload_project_module,
        }
    }
}

impl Default for PluginsCallbacks {
    fn default() -> Self {
        Self::new()
    }
}

static BRIDGE: Mutex<Option<NativeBridge>> = Mutex::new(None);
static SERVICES: Mutex<Option<BridgeServices>> = Mutex::new(None);

/// Provide the collaborators initialize will use.
///
/// Must run before the host calls [`plughost_initialize_from_host`].
/// Without it, initialize reads the configuration from `PLUGHOST_CONFIG`
/// and uses the default services.
pub fn install_services(services: BridgeServices) -> Result<()> {
    let bridge = lock_bridge("install_services")?;
    if bridge.is_some() {
        return Err(BridgeError::AlreadyInitialized);
    }
    *SERVICES.lock().unwrap_or_else(PoisonError::into_inner) = Some(services);
    Ok(())
}

fn lock_bridge(entry: &'static str) -> Result<MutexGuard<'static, Option<NativeBridge>>> {
    match BRIDGE.try_lock() {
        Ok(bridge) => Ok(bridge),
        // A panic caught at the boundary poisons the lock; the state itself
        // is still consistent.
        Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
        Err(TryLockError::WouldBlock) => Err(BridgeError::Busy(entry)),
    }
}

fn with_bridge<T>(
    entry: &'static str,
    f: impl FnOnce(&mut NativeBridge) -> Result<T>,
) -> Result<T> {
    let mut bridge = lock_bridge(entry)?;
    let bridge = bridge.as_mut().ok_or(BridgeError::NotInitialized)?;
    f(bridge)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Run `f`, turning errors and panics into `failure`.
fn guarded<T>(entry: &'static str, failure: T, f: impl FnOnce() -> Result<T>) -> T {
    let error = match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => return value,
        Ok(Err(e)) => e,
        Err(payload) => BridgeError::Panic {
            entry,
            message: panic_message(payload.as_ref()),
        },
    };
    tracing::error!(entry, "{}", error);
    failure
}

fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    // A subscriber installed by the embedder wins.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Read a path argument.
///
/// # Safety
/// `ptr` must be null or point to a NUL-terminated string.
unsafe fn path_arg(ptr: *const c_char) -> Result<PathBuf> {
    if ptr.is_null() {
        return Err(BridgeError::InvalidArgument("path is null".to_string()));
    }
    // SAFETY: non-null and NUL-terminated per the contract above.
    let path = unsafe { CStr::from_ptr(ptr) };
    let path = path
        .to_str()
        .map_err(|e| BridgeError::InvalidArgument(format!("path is not UTF-8: {}", e)))?;
    Ok(PathBuf::from(path))
}

fn string_out(value: &str) -> Result<*mut c_char> {
    CString::new(value)
        .map(CString::into_raw)
        .map_err(|e| BridgeError::InvalidArgument(format!("path contains NUL: {}", e)))
}

/// Initialize the bridge.
///
/// Registers the host's core module as shared, loads and shares the
/// tooling API module when `editor_hint` is set, then fills in
/// `plugins_callbacks` and `managed_callbacks`.
///
/// # Safety
/// `plugins_callbacks` and `managed_callbacks` must be valid for writes.
/// `unmanaged_callbacks` must point to `unmanaged_callbacks_size` entries
/// that outlive the process's use of the bridge.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn plughost_initialize_from_host(
    core_handle: *mut c_void,
    editor_hint: bool,
    plugins_callbacks: *mut PluginsCallbacks,
    managed_callbacks: *mut ManagedCallbacks,
    unmanaged_callbacks: *const c_void,
    unmanaged_callbacks_size: i32,
) -> bool {
    init_logging();

    guarded("plughost_initialize_from_host", false, || {
        if plugins_callbacks.is_null() || managed_callbacks.is_null() {
            return Err(BridgeError::InvalidArgument(
                "callback tables must not be null".to_string(),
            ));
        }

        let mut slot = lock_bridge("plughost_initialize_from_host")?;
        if slot.is_some() {
            return Err(BridgeError::AlreadyInitialized);
        }

        let installed = SERVICES
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let services = match installed {
            Some(services) => services,
            None => BridgeServices::new(BridgeConfig::from_env()?),
        };

        let bridge = NativeBridge::initialize(HostHandle::from_ptr(core_handle), editor_hint, services)?
            .with_host_callbacks(HostCallbacks {
                table: unmanaged_callbacks,
                size: unmanaged_callbacks_size,
            })?;

        // SAFETY: both checked non-null above and valid for writes per the
        // contract.
        unsafe {
            plugins_callbacks.write(PluginsCallbacks::new());
            managed_callbacks.write(bridge.managed_callbacks());
        }

        *slot = Some(bridge);
        Ok(true)
    })
}

/// Load the project module.
///
/// On success `out_loaded_path` receives the path the module was loaded
/// from, to be freed with [`plughost_free_string`]. Succeeds without
/// loading anything while a project module is active.
///
/// # Safety
/// `path` must be a NUL-terminated string and `out_loaded_path` valid for
/// writes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn plughost_load_project_module(
    path: *const c_char,
    out_loaded_path: *mut *mut c_char,
) -> bool {
    guarded("plughost_load_project_module", false, || {
        if out_loaded_path.is_null() {
            return Err(BridgeError::InvalidArgument(
                "output path must not be null".to_string(),
            ));
        }
        // SAFETY: forwarded from the caller.
        let path = unsafe { path_arg(path)? };

        with_bridge("plughost_load_project_module", |bridge| {
            let resolved = bridge.load_project_module(&path)?;
            let resolved = string_out(&resolved.to_string_lossy())?;
            // SAFETY: checked non-null above.
            unsafe { out_loaded_path.write(resolved) };
            Ok(true)
        })
    })
}

/// Load a tooling module and return the instance its entry point creates,
/// or null on failure.
///
/// # Safety
/// `path` must be a NUL-terminated string. `unmanaged_callbacks` is passed
/// to the module's entry point untouched.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn plughost_load_tooling_module(
    path: *const c_char,
    unmanaged_callbacks: *const c_void,
    unmanaged_callbacks_size: i32,
) -> *mut c_void {
    guarded(
        "plughost_load_tooling_module",
        std::ptr::null_mut(),
        || {
            // SAFETY: forwarded from the caller.
            let path = unsafe { path_arg(path)? };
            with_bridge("plughost_load_tooling_module", |bridge| {
                bridge.load_tooling_module(&path, unmanaged_callbacks, unmanaged_callbacks_size)
            })
        },
    )
}

/// Unload the project module, blocking until it is reclaimed or the
/// timeout expires. Succeeds when nothing is loaded.
#[unsafe(no_mangle)]
pub extern "C" fn plughost_unload_project_module() -> bool {
    guarded("plughost_unload_project_module", false, || {
        with_bridge("plughost_unload_project_module", |bridge| {
            Ok(bridge.unload_project_module().is_success())
        })
    })
}

/// Free a string returned by the bridge.
///
/// # Safety
/// `ptr` must be null or a string returned by this library that was not
/// freed yet.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn plughost_free_string(ptr: *mut c_char) {
    if ptr.is_null() {
        return;
    }
    // SAFETY: produced by `CString::into_raw` in `string_out`.
    drop(unsafe { CString::from_raw(ptr) });
}
