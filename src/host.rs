//! Host-side callback surface handed to every plugin.
//!
//! The `log` and `thread-check` extensions are real; the rest are no-op
//! stubs. Plugins routinely query optional host extensions during `init`
//! and a fair number of them follow degraded paths or assert when
//! `get_extension` returns null, so each extension they commonly probe for
//! gets a table that simply does nothing.

use clap_sys::ext::audio_ports_config::{clap_host_audio_ports_config, CLAP_EXT_AUDIO_PORTS_CONFIG};
use clap_sys::ext::gui::{clap_host_gui, CLAP_EXT_GUI};
use clap_sys::ext::latency::{clap_host_latency, CLAP_EXT_LATENCY};
use clap_sys::ext::log::{clap_host_log, clap_log_severity, CLAP_EXT_LOG};
use clap_sys::ext::note_name::{clap_host_note_name, CLAP_EXT_NOTE_NAME};
use clap_sys::ext::params::{
    clap_host_params, clap_param_clear_flags, clap_param_rescan_flags, CLAP_EXT_PARAMS,
};
use clap_sys::ext::state::{clap_host_state, CLAP_EXT_STATE};
use clap_sys::ext::tail::{clap_host_tail, CLAP_EXT_TAIL};
use clap_sys::ext::thread_check::{clap_host_thread_check, CLAP_EXT_THREAD_CHECK};
use clap_sys::ext::track_info::{
    clap_host_track_info, clap_track_info, CLAP_EXT_TRACK_INFO, CLAP_EXT_TRACK_INFO_COMPAT,
    CLAP_TRACK_INFO_HAS_TRACK_NAME,
};
use clap_sys::host::clap_host;
use clap_sys::id::clap_id;
use clap_sys::version::CLAP_VERSION;
use std::ffi::CStr;
use std::os::raw::{c_char, c_void};
use std::ptr;
use std::sync::OnceLock;
use std::thread::{self, ThreadId};

/// Thread that performed the first scan. Plugins are only ever called from
/// that thread, which doubles as the audio thread.
static MAIN_THREAD: OnceLock<ThreadId> = OnceLock::new();

pub(crate) fn record_main_thread() {
    let _ = MAIN_THREAD.set(thread::current().id());
}

struct HostTable(clap_host);

// The table is immutable and every callback in it is thread-safe.
unsafe impl Sync for HostTable {}

static HOST: HostTable = HostTable(clap_host {
    clap_version: CLAP_VERSION,
    host_data: ptr::null_mut(),
    name: c"Move Anything CLAP Host".as_ptr(),
    vendor: c"Move Anything".as_ptr(),
    url: c"".as_ptr(),
    version: c"1.0.0".as_ptr(),
    get_extension: Some(host_get_extension),
    request_restart: Some(host_request_restart),
    request_process: Some(host_request_process),
    request_callback: Some(host_request_callback),
});

pub(crate) fn host_ptr() -> *const clap_host {
    &HOST.0
}

unsafe extern "C" fn host_request_restart(_host: *const clap_host) {}
unsafe extern "C" fn host_request_process(_host: *const clap_host) {}
unsafe extern "C" fn host_request_callback(_host: *const clap_host) {}

unsafe extern "C" fn host_get_extension(
    _host: *const clap_host,
    extension_id: *const c_char,
) -> *const c_void {
    if extension_id.is_null() {
        return ptr::null();
    }
    let id = CStr::from_ptr(extension_id);

    if id == CLAP_EXT_LOG {
        &HOST_LOG as *const _ as *const c_void
    } else if id == CLAP_EXT_THREAD_CHECK {
        &HOST_THREAD_CHECK as *const _ as *const c_void
    } else if id == CLAP_EXT_PARAMS {
        &HOST_PARAMS as *const _ as *const c_void
    } else if id == CLAP_EXT_STATE {
        &HOST_STATE as *const _ as *const c_void
    } else if id == CLAP_EXT_LATENCY {
        &HOST_LATENCY as *const _ as *const c_void
    } else if id == CLAP_EXT_TAIL {
        &HOST_TAIL as *const _ as *const c_void
    } else if id == CLAP_EXT_NOTE_NAME {
        &HOST_NOTE_NAME as *const _ as *const c_void
    } else if id == CLAP_EXT_AUDIO_PORTS_CONFIG {
        &HOST_AUDIO_PORTS_CONFIG as *const _ as *const c_void
    } else if id == CLAP_EXT_TRACK_INFO || id == CLAP_EXT_TRACK_INFO_COMPAT {
        &HOST_TRACK_INFO as *const _ as *const c_void
    } else if id == CLAP_EXT_GUI {
        &HOST_GUI as *const _ as *const c_void
    } else {
        ptr::null()
    }
}

// --- log ---

unsafe extern "C" fn host_log(
    _host: *const clap_host,
    _severity: clap_log_severity,
    msg: *const c_char,
) {
    if msg.is_null() {
        return;
    }
    let msg = CStr::from_ptr(msg).to_string_lossy();
    eprintln!("[CLAP] {msg}");
    tracing::debug!(target: "clap_host", "{msg}");
}

static HOST_LOG: clap_host_log = clap_host_log {
    log: Some(host_log),
};

// --- thread-check ---

unsafe extern "C" fn host_is_main_thread(_host: *const clap_host) -> bool {
    MAIN_THREAD
        .get()
        .is_some_and(|id| *id == thread::current().id())
}

unsafe extern "C" fn host_is_audio_thread(_host: *const clap_host) -> bool {
    // One audio thread, same as the main thread.
    true
}

static HOST_THREAD_CHECK: clap_host_thread_check = clap_host_thread_check {
    is_main_thread: Some(host_is_main_thread),
    is_audio_thread: Some(host_is_audio_thread),
};

// --- no-op stubs ---

unsafe extern "C" fn host_params_rescan(_host: *const clap_host, _flags: clap_param_rescan_flags) {}
unsafe extern "C" fn host_params_clear(
    _host: *const clap_host,
    _param_id: clap_id,
    _flags: clap_param_clear_flags,
) {
}
unsafe extern "C" fn host_params_request_flush(_host: *const clap_host) {}

static HOST_PARAMS: clap_host_params = clap_host_params {
    rescan: Some(host_params_rescan),
    clear: Some(host_params_clear),
    request_flush: Some(host_params_request_flush),
};

unsafe extern "C" fn host_state_mark_dirty(_host: *const clap_host) {}

static HOST_STATE: clap_host_state = clap_host_state {
    mark_dirty: Some(host_state_mark_dirty),
};

unsafe extern "C" fn host_latency_changed(_host: *const clap_host) {}

static HOST_LATENCY: clap_host_latency = clap_host_latency {
    changed: Some(host_latency_changed),
};

unsafe extern "C" fn host_tail_changed(_host: *const clap_host) {}

static HOST_TAIL: clap_host_tail = clap_host_tail {
    changed: Some(host_tail_changed),
};

unsafe extern "C" fn host_note_name_changed(_host: *const clap_host) {}

static HOST_NOTE_NAME: clap_host_note_name = clap_host_note_name {
    changed: Some(host_note_name_changed),
};

unsafe extern "C" fn host_audio_ports_config_rescan(_host: *const clap_host) {}

static HOST_AUDIO_PORTS_CONFIG: clap_host_audio_ports_config = clap_host_audio_ports_config {
    rescan: Some(host_audio_ports_config_rescan),
};

// --- track-info ---

unsafe extern "C" fn host_track_info_get(
    _host: *const clap_host,
    info: *mut clap_track_info,
) -> bool {
    if info.is_null() {
        return false;
    }
    let info = &mut *info;
    *info = std::mem::zeroed();
    info.flags = CLAP_TRACK_INFO_HAS_TRACK_NAME as u64;
    for (dst, src) in info.name.iter_mut().zip(b"Move\0") {
        *dst = *src as c_char;
    }
    true
}

static HOST_TRACK_INFO: clap_host_track_info = clap_host_track_info {
    get: Some(host_track_info_get),
};

// --- gui ---

unsafe extern "C" fn host_gui_resize_hints_changed(_host: *const clap_host) {}
unsafe extern "C" fn host_gui_request_resize(
    _host: *const clap_host,
    _width: u32,
    _height: u32,
) -> bool {
    false
}
unsafe extern "C" fn host_gui_request_show(_host: *const clap_host) -> bool {
    false
}
unsafe extern "C" fn host_gui_request_hide(_host: *const clap_host) -> bool {
    false
}
unsafe extern "C" fn host_gui_closed(_host: *const clap_host, _was_destroyed: bool) {}

static HOST_GUI: clap_host_gui = clap_host_gui {
    resize_hints_changed: Some(host_gui_resize_hints_changed),
    request_resize: Some(host_gui_request_resize),
    request_show: Some(host_gui_request_show),
    request_hide: Some(host_gui_request_hide),
    closed: Some(host_gui_closed),
};
