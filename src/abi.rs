//! C ABI shared with the outer signal chain.
//!
//! These tables mirror the chain's module headers byte for byte. The chain
//! dlopens this library, resolves one of the `move_*_init_*` symbols and
//! calls through the returned vtable; everything crossing this boundary is
//! `#[repr(C)]` with integer return codes.

use std::os::raw::{c_char, c_int, c_void};

pub const MOVE_PLUGIN_API_VERSION: u32 = 1;
pub const AUDIO_FX_API_VERSION: u32 = 1;
pub const AUDIO_FX_API_VERSION_2: u32 = 2;

pub const MOVE_MIDI_SOURCE_INTERNAL: c_int = 0;
pub const MOVE_MIDI_SOURCE_EXTERNAL: c_int = 2;

/// Function table the outer chain hands to every module at init.
#[repr(C)]
pub struct HostApiV1 {
    pub api_version: u32,
    pub sample_rate: c_int,
    pub frames_per_block: c_int,
    pub mapped_memory: *mut u8,
    pub audio_out_offset: c_int,
    pub audio_in_offset: c_int,
    pub log: Option<unsafe extern "C" fn(msg: *const c_char)>,
    pub midi_send_internal: Option<unsafe extern "C" fn(msg: *const u8, len: c_int) -> c_int>,
    pub midi_send_external: Option<unsafe extern "C" fn(msg: *const u8, len: c_int) -> c_int>,
}

/// Sound generator module vtable, returned by `move_plugin_init_v1`.
#[repr(C)]
pub struct PluginApiV1 {
    pub api_version: u32,
    pub on_load:
        Option<unsafe extern "C" fn(module_dir: *const c_char, json_defaults: *const c_char) -> c_int>,
    pub on_unload: Option<unsafe extern "C" fn()>,
    pub on_midi: Option<unsafe extern "C" fn(msg: *const u8, len: c_int, source: c_int)>,
    pub set_param: Option<unsafe extern "C" fn(key: *const c_char, val: *const c_char)>,
    pub get_param:
        Option<unsafe extern "C" fn(key: *const c_char, buf: *mut c_char, buf_len: c_int) -> c_int>,
    pub render_block: Option<unsafe extern "C" fn(out_interleaved_lr: *mut i16, frames: c_int)>,
}

/// Audio FX module vtable, v1 (one implicit instance per process).
#[repr(C)]
pub struct AudioFxApiV1 {
    pub api_version: u32,
    pub on_load:
        Option<unsafe extern "C" fn(module_dir: *const c_char, config_json: *const c_char) -> c_int>,
    pub on_unload: Option<unsafe extern "C" fn()>,
    pub process_block: Option<unsafe extern "C" fn(audio_inout: *mut i16, frames: c_int)>,
    pub set_param: Option<unsafe extern "C" fn(key: *const c_char, val: *const c_char)>,
    pub get_param:
        Option<unsafe extern "C" fn(key: *const c_char, buf: *mut c_char, buf_len: c_int) -> c_int>,
}

/// Audio FX module vtable, v2 (explicit instances).
#[repr(C)]
pub struct AudioFxApiV2 {
    pub api_version: u32,
    pub create_instance: Option<
        unsafe extern "C" fn(module_dir: *const c_char, config_json: *const c_char) -> *mut c_void,
    >,
    pub destroy_instance: Option<unsafe extern "C" fn(instance: *mut c_void)>,
    pub process_block:
        Option<unsafe extern "C" fn(instance: *mut c_void, audio_inout: *mut i16, frames: c_int)>,
    pub set_param: Option<
        unsafe extern "C" fn(instance: *mut c_void, key: *const c_char, val: *const c_char),
    >,
    pub get_param: Option<
        unsafe extern "C" fn(
            instance: *mut c_void,
            key: *const c_char,
            buf: *mut c_char,
            buf_len: c_int,
        ) -> c_int,
    >,
}

/// Borrow a NUL-terminated C string argument as `&str`, rejecting null
/// pointers and non-UTF-8 bytes.
///
/// # Safety
/// `ptr` must be null or point to a NUL-terminated string that outlives the
/// returned reference.
pub(crate) unsafe fn cstr_arg<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    std::ffi::CStr::from_ptr(ptr).to_str().ok()
}

/// Copy `s` into a caller-supplied buffer, NUL-terminated and truncated to
/// fit. Returns the number of bytes written (excluding the NUL), or -1 when
/// the buffer is unusable. Mirrors the `snprintf` contract the chain's
/// modules follow.
///
/// # Safety
/// `buf` must be valid for writes of `buf_len` bytes.
pub(crate) unsafe fn write_c_out(buf: *mut c_char, buf_len: c_int, s: &str) -> c_int {
    if buf.is_null() || buf_len <= 0 {
        return -1;
    }
    let capacity = (buf_len - 1) as usize;
    let bytes = s.as_bytes();
    let n = bytes.len().min(capacity);
    std::ptr::copy_nonoverlapping(bytes.as_ptr(), buf as *mut u8, n);
    *buf.add(n) = 0;
    n as c_int
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CStr;

    #[test]
    fn test_write_c_out_truncates() {
        let mut buf = [0 as c_char; 8];
        let n = unsafe { write_c_out(buf.as_mut_ptr(), buf.len() as c_int, "hello world") };
        assert_eq!(n, 7);
        let s = unsafe { CStr::from_ptr(buf.as_ptr()) };
        assert_eq!(s.to_str().unwrap(), "hello w");
    }

    #[test]
    fn test_write_c_out_exact_fit() {
        let mut buf = [0 as c_char; 6];
        let n = unsafe { write_c_out(buf.as_mut_ptr(), buf.len() as c_int, "hello") };
        assert_eq!(n, 5);
        let s = unsafe { CStr::from_ptr(buf.as_ptr()) };
        assert_eq!(s.to_str().unwrap(), "hello");
    }

    #[test]
    fn test_write_c_out_rejects_empty_buffer() {
        let mut buf = [0 as c_char; 1];
        assert_eq!(unsafe { write_c_out(buf.as_mut_ptr(), 0, "x") }, -1);
        assert_eq!(unsafe { write_c_out(std::ptr::null_mut(), 4, "x") }, -1);
    }

    #[test]
    fn test_cstr_arg_null() {
        assert_eq!(unsafe { cstr_arg(std::ptr::null()) }, None);
    }
}
