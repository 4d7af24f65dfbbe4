//! FFI bindings for Heartsync
//!
//! This module provides C-compatible functions for driving an orchestrator
//! from the presentation layer. All functions use C strings (null-terminated)
//! and return allocated memory that must be freed by the caller using
//! `heartsync_free_string`.
//!
//! The handle owns its own tokio runtime, the UDP transport and the driver
//! tasks. Bluetooth stays on the host side: it polls link requests, reports
//! events back, and writes queued actuator payloads to the haptic device.

use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::ptr;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::decoder::HEART_RATE_MEASUREMENT;
use crate::driver::DriverHandles;
use crate::error::SyncError;
use crate::orchestrator::SessionOrchestrator;
use crate::sensor::{QueuedSensorLink, SensorEvent};
use crate::transport::{MemoryTransport, Outbound, UdpTransport};
use crate::types::{OrchestratorEvent, SessionId};

// Thread-local storage for the last error message
thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

/// Set the last error message
fn set_last_error(msg: &str) {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = CString::new(msg).ok();
    });
}

/// Clear the last error message
fn clear_last_error() {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = None;
    });
}

/// Helper to convert C string to Rust string
unsafe fn cstr_to_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok().map(|s| s.to_string())
}

/// Helper to convert Rust string to C string (caller must free)
fn string_to_cstr(s: &str) -> *mut c_char {
    match CString::new(s) {
        Ok(cstr) => cstr.into_raw(),
        Err(_) => ptr::null_mut(),
    }
}

/// Map a result onto the 0 / -1 status convention
fn status(result: Result<(), SyncError>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => {
            set_last_error(&e.to_string());
            -1
        }
    }
}

/// Serialize a value and hand it out as a C string
fn json_to_cstr<T: serde::Serialize>(value: &T) -> *mut c_char {
    match serde_json::to_string(value) {
        Ok(json) => string_to_cstr(&json),
        Err(e) => {
            set_last_error(&e.to_string());
            ptr::null_mut()
        }
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Opaque handle to a running orchestrator
pub struct HeartsyncHandle {
    // Declared first so the tasks are aborted before the runtime goes away
    drivers: DriverHandles,
    orchestrator: Arc<SessionOrchestrator>,
    transport: Arc<UdpTransport>,
    actuator: Option<Arc<MemoryTransport>>,
    link: Arc<QueuedSensorLink>,
    events: Mutex<broadcast::Receiver<OrchestratorEvent>>,
    runtime: tokio::runtime::Runtime,
}

impl HeartsyncHandle {
    fn create(config: &OrchestratorConfig) -> Result<Self, String> {
        config.validate().map_err(|e| e.to_string())?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("heartsync")
            .enable_all()
            .build()
            .map_err(|e| format!("Failed to start runtime: {e}"))?;

        let transport = Arc::new(UdpTransport::spawn_on(
            runtime.handle(),
            config.destination.clone(),
        ));
        let actuator = config
            .actuator
            .then(|| Arc::new(MemoryTransport::new("actuator")));
        let link = Arc::new(QueuedSensorLink::new());

        let orchestrator = Arc::new(
            SessionOrchestrator::new(
                config,
                transport.clone(),
                actuator.clone().map(|a| a as Arc<dyn Outbound>),
                link.clone(),
            )
            .map_err(|e| e.to_string())?,
        );
        let events = Mutex::new(orchestrator.subscribe());

        let drivers = {
            let _guard = runtime.enter();
            DriverHandles::spawn(&orchestrator, config.tick_interval())
        };

        Ok(Self {
            drivers,
            orchestrator,
            transport,
            actuator,
            link,
            events,
            runtime,
        })
    }

    fn drain_events(&self) -> Vec<OrchestratorEvent> {
        let mut receiver = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        let mut drained = Vec::new();
        loop {
            match receiver.try_recv() {
                Ok(event) => drained.push(event),
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    log::warn!("ffi: {missed} events dropped before polling");
                }
                Err(_) => break,
            }
        }
        drained
    }
}

/// Create an orchestrator from a JSON configuration.
///
/// Pass NULL to use the default configuration (three players with random
/// sensor identifiers, destination 127.0.0.1:8000).
///
/// # Safety
/// - `config_json` must be a valid null-terminated C string, or NULL.
/// - Returns a pointer that must be freed with `heartsync_free`.
/// - Returns NULL on error; call `heartsync_last_error` to get the error message.
#[no_mangle]
pub unsafe extern "C" fn heartsync_new(config_json: *const c_char) -> *mut HeartsyncHandle {
    clear_last_error();

    let config = if config_json.is_null() {
        OrchestratorConfig::default()
    } else {
        let json = match cstr_to_string(config_json) {
            Some(s) => s,
            None => {
                set_last_error("Invalid config string pointer");
                return ptr::null_mut();
            }
        };
        match OrchestratorConfig::from_json(&json) {
            Ok(config) => config,
            Err(e) => {
                set_last_error(&e.to_string());
                return ptr::null_mut();
            }
        }
    };

    match HeartsyncHandle::create(&config) {
        Ok(handle) => Box::into_raw(Box::new(handle)),
        Err(msg) => {
            set_last_error(&msg);
            ptr::null_mut()
        }
    }
}

/// Stop all tasks and free the orchestrator.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `heartsync_new`, or NULL.
/// - After calling this function, the pointer is invalid.
#[no_mangle]
pub unsafe extern "C" fn heartsync_free(handle: *mut HeartsyncHandle) {
    if !handle.is_null() {
        let handle = Box::from_raw(handle);
        let HeartsyncHandle {
            drivers, runtime, ..
        } = *handle;
        drop(drivers);
        runtime.shutdown_background();
    }
}

// ============================================================================
// Sessions
// ============================================================================

/// Request a connection for a player. Returns 0 on success, -1 on error.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `heartsync_new`.
#[no_mangle]
pub unsafe extern "C" fn heartsync_connect(handle: *mut HeartsyncHandle, player_id: SessionId) -> i32 {
    clear_last_error();
    let Some(handle) = handle.as_ref() else {
        set_last_error("Null handle");
        return -1;
    };
    status(handle.orchestrator.connect(player_id))
}

/// Disconnect a player immediately. Returns 0 on success, -1 on error.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `heartsync_new`.
#[no_mangle]
pub unsafe extern "C" fn heartsync_disconnect(handle: *mut HeartsyncHandle, player_id: SessionId) -> i32 {
    clear_last_error();
    let Some(handle) = handle.as_ref() else {
        set_last_error("Null handle");
        return -1;
    };
    status(handle.orchestrator.disconnect(player_id))
}

/// Report a Bluetooth event as JSON, e.g.
/// `{"type":"connected","device":"<uuid>"}`.
///
/// Returns 0 on success, -1 on error (including rejected notifications).
///
/// # Safety
/// - `handle` must be a valid pointer returned by `heartsync_new`.
/// - `event_json` must be a valid null-terminated C string.
#[no_mangle]
pub unsafe extern "C" fn heartsync_sensor_event(
    handle: *mut HeartsyncHandle,
    event_json: *const c_char,
) -> i32 {
    clear_last_error();
    let Some(handle) = handle.as_ref() else {
        set_last_error("Null handle");
        return -1;
    };
    let Some(json) = cstr_to_string(event_json) else {
        set_last_error("Invalid event string pointer");
        return -1;
    };

    let result = serde_json::from_str::<SensorEvent>(&json)
        .map_err(SyncError::from)
        .and_then(|event| handle.orchestrator.handle_sensor_event(event));
    status(result)
}

/// Report a raw Heart Rate Measurement notification.
///
/// Returns 0 on success, -1 on error.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `heartsync_new`.
/// - `device` must be a valid null-terminated C string holding a UUID.
/// - `payload` must point to `len` readable bytes (may be NULL when `len` is 0).
#[no_mangle]
pub unsafe extern "C" fn heartsync_notification(
    handle: *mut HeartsyncHandle,
    device: *const c_char,
    payload: *const u8,
    len: usize,
) -> i32 {
    heartsync_characteristic_value(handle, device, HEART_RATE_MEASUREMENT, payload, len)
}

/// Report a value read or notified on a 16-bit characteristic: Heart Rate
/// Measurement (0x2A37), Body Sensor Location (0x2A38) or Manufacturer Name
/// String (0x2A29). An empty metadata read means the value is unavailable.
///
/// Returns 0 on success, -1 on error.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `heartsync_new`.
/// - `device` must be a valid null-terminated C string holding a UUID.
/// - `payload` must point to `len` readable bytes (may be NULL when `len` is 0).
#[no_mangle]
pub unsafe extern "C" fn heartsync_characteristic_value(
    handle: *mut HeartsyncHandle,
    device: *const c_char,
    characteristic: u16,
    payload: *const u8,
    len: usize,
) -> i32 {
    clear_last_error();
    let Some(handle) = handle.as_ref() else {
        set_last_error("Null handle");
        return -1;
    };
    let device = match cstr_to_string(device).map(|s| Uuid::parse_str(&s)) {
        Some(Ok(device)) => device,
        _ => {
            set_last_error("Invalid device identifier");
            return -1;
        }
    };
    let payload = if payload.is_null() || len == 0 {
        Vec::new()
    } else {
        std::slice::from_raw_parts(payload, len).to_vec()
    };

    status(
        SensorEvent::from_characteristic(device, characteristic, payload)
            .and_then(|event| handle.orchestrator.handle_sensor_event(event)),
    )
}

// ============================================================================
// Experience control
// ============================================================================

macro_rules! experience_call {
    ($(#[$doc:meta])* $name:ident, |$orchestrator:ident| $body:expr) => {
        $(#[$doc])*
        ///
        /// # Safety
        /// - `handle` must be a valid pointer returned by `heartsync_new`.
        #[no_mangle]
        pub unsafe extern "C" fn $name(handle: *mut HeartsyncHandle) -> i32 {
            clear_last_error();
            let Some(handle) = handle.as_ref() else {
                set_last_error("Null handle");
                return -1;
            };
            let $orchestrator = &handle.orchestrator;
            status($body)
        }
    };
}

experience_call!(
    /// Start the experience (Ready only). Returns 0 on success, -1 on error.
    heartsync_start,
    |orchestrator| orchestrator.start()
);

experience_call!(
    /// Pause the experience (Playing only). Returns 0 on success, -1 on error.
    heartsync_pause,
    |orchestrator| orchestrator.pause()
);

experience_call!(
    /// Resume the experience (Paused only). Returns 0 on success, -1 on error.
    heartsync_resume,
    |orchestrator| orchestrator.resume()
);

experience_call!(
    /// End the experience from any state. Returns 0.
    heartsync_end,
    |orchestrator| {
        orchestrator.end();
        Ok(())
    }
);

experience_call!(
    /// Disconnect everything and return to Setup. Returns 0.
    heartsync_reset,
    |orchestrator| {
        orchestrator.reset();
        Ok(())
    }
);

/// Point the OSC channel at a new host and port.
///
/// Returns 0 on success, -1 on error.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `heartsync_new`.
/// - `host` must be a valid null-terminated C string.
#[no_mangle]
pub unsafe extern "C" fn heartsync_set_destination(
    handle: *mut HeartsyncHandle,
    host: *const c_char,
    port: u16,
) -> i32 {
    clear_last_error();
    let Some(handle) = handle.as_ref() else {
        set_last_error("Null handle");
        return -1;
    };
    let host = match cstr_to_string(host) {
        Some(host) if !host.is_empty() => host,
        _ => {
            set_last_error("Invalid host string");
            return -1;
        }
    };

    let _guard = handle.runtime.enter();
    status(handle.transport.reconfigure(host, port))
}

// ============================================================================
// Queries
// ============================================================================

/// Current experience snapshot as JSON.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `heartsync_new`.
/// - Returns a newly allocated string that must be freed with `heartsync_free_string`.
/// - Returns NULL on error; call `heartsync_last_error` to get the error message.
#[no_mangle]
pub unsafe extern "C" fn heartsync_snapshot_json(handle: *mut HeartsyncHandle) -> *mut c_char {
    clear_last_error();
    let Some(handle) = handle.as_ref() else {
        set_last_error("Null handle");
        return ptr::null_mut();
    };
    json_to_cstr(&handle.orchestrator.snapshot())
}

/// Change events published since the previous call, as a JSON array.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `heartsync_new`.
/// - Returns a newly allocated string that must be freed with `heartsync_free_string`.
#[no_mangle]
pub unsafe extern "C" fn heartsync_poll_events_json(handle: *mut HeartsyncHandle) -> *mut c_char {
    clear_last_error();
    let Some(handle) = handle.as_ref() else {
        set_last_error("Null handle");
        return ptr::null_mut();
    };
    json_to_cstr(&handle.drain_events())
}

/// Pending connect/cancel requests for the Bluetooth stack, as a JSON array.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `heartsync_new`.
/// - Returns a newly allocated string that must be freed with `heartsync_free_string`.
#[no_mangle]
pub unsafe extern "C" fn heartsync_poll_link_requests_json(
    handle: *mut HeartsyncHandle,
) -> *mut c_char {
    clear_last_error();
    let Some(handle) = handle.as_ref() else {
        set_last_error("Null handle");
        return ptr::null_mut();
    };
    json_to_cstr(&handle.link.drain())
}

/// Text payloads queued for the haptic actuator, as a JSON array of strings.
///
/// Always `[]` when the configuration disables the actuator.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `heartsync_new`.
/// - Returns a newly allocated string that must be freed with `heartsync_free_string`.
#[no_mangle]
pub unsafe extern "C" fn heartsync_poll_actuator_json(handle: *mut HeartsyncHandle) -> *mut c_char {
    clear_last_error();
    let Some(handle) = handle.as_ref() else {
        set_last_error("Null handle");
        return ptr::null_mut();
    };
    let payloads: Vec<String> = handle
        .actuator
        .as_ref()
        .map(|actuator| actuator.take())
        .unwrap_or_default()
        .into_iter()
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .collect();
    json_to_cstr(&payloads)
}

// ============================================================================
// Memory Management
// ============================================================================

/// Free a string returned by Heartsync functions.
///
/// # Safety
/// - `ptr` must be a valid pointer returned by a Heartsync function, or NULL.
/// - After calling this function, the pointer is invalid.
#[no_mangle]
pub unsafe extern "C" fn heartsync_free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(CString::from_raw(ptr));
    }
}

// ============================================================================
// Error Handling
// ============================================================================

/// Get the last error message.
///
/// # Safety
/// - Returns a pointer to a thread-local error string.
/// - The returned pointer is valid until the next Heartsync function call on this thread.
/// - Do NOT free the returned pointer.
/// - Returns NULL if no error occurred.
#[no_mangle]
pub unsafe extern "C" fn heartsync_last_error() -> *const c_char {
    LAST_ERROR.with(|e| match &*e.borrow() {
        Some(cstr) => cstr.as_ptr(),
        None => ptr::null(),
    })
}

/// Get the Heartsync library version.
///
/// # Safety
/// - Returns a pointer to a static string. Do NOT free.
#[no_mangle]
pub unsafe extern "C" fn heartsync_version() -> *const c_char {
    static VERSION: &[u8] = concat!(env!("CARGO_PKG_VERSION"), "\0").as_bytes();
    VERSION.as_ptr() as *const c_char
}
