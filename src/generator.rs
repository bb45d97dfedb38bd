//! Sound generator facade.
//!
//! Hosts one CLAP plugin as the chain's sound generator: scans the
//! module's `plugins` subdirectory at load, auto-selects the first result,
//! routes incoming MIDI (with octave transpose on note messages) and
//! renders a block of audio on every tick. The chain talks to it through
//! the string key/value surface.
//!
//! All state lives in [`Generator`]; the process-wide singleton exists
//! only behind the `move_plugin_init_v1` ABI boundary.

use crate::abi::{cstr_arg, write_c_out, HostApiV1, PluginApiV1, MOVE_PLUGIN_API_VERSION};
use crate::config::{parse_float, parse_int};
use crate::events;
use crate::instance::Instance;
use crate::scan::{scan, PluginList};
use parking_lot::Mutex;
use std::os::raw::{c_char, c_int};
use std::path::PathBuf;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

const PLUGINS_SUBDIR: &str = "plugins";
const OCTAVE_RANGE: i32 = 2;

/// Outer-chain host table, shared by every facade in this library.
pub(crate) static HOST_API: AtomicPtr<HostApiV1> = AtomicPtr::new(ptr::null_mut());

/// Forward a line to the outer chain's log sink, if we have one.
pub(crate) fn chain_log(msg: &str) {
    let host = HOST_API.load(Ordering::Acquire);
    if host.is_null() {
        return;
    }
    if let Some(log) = unsafe { (*host).log } {
        if let Ok(msg) = std::ffi::CString::new(msg) {
            unsafe { log(msg.as_ptr()) };
        }
    }
}

static GENERATOR: Mutex<Option<Generator>> = Mutex::new(None);

pub struct Generator {
    module_dir: PathBuf,
    plugins: PluginList,
    current: Option<Instance>,
    selected: i32,
    octave_transpose: i32,
    param_bank: i32,
}

/// Shift a note by whole octaves, clipped to the MIDI key range.
pub(crate) fn transposed_note(note: u8, octaves: i32) -> u8 {
    (i32::from(note) + octaves * 12).clamp(0, 127) as u8
}

impl Generator {
    pub fn new(module_dir: impl Into<PathBuf>) -> Self {
        Self {
            module_dir: module_dir.into(),
            plugins: PluginList::new(),
            current: None,
            selected: -1,
            octave_transpose: 0,
            param_bank: 0,
        }
    }

    fn log(&self, msg: &str) {
        chain_log(msg);
        eprintln!("[CLAP] {msg}");
    }

    fn scan_plugins(&mut self) {
        self.log("Scanning for CLAP plugins...");
        match scan(self.module_dir.join(PLUGINS_SUBDIR)) {
            Ok(list) => {
                self.log(&format!("Found {} plugins", list.len()));
                self.plugins = list;
            }
            Err(_) => {
                self.log("Failed to scan plugins directory");
                self.plugins = PluginList::new();
            }
        }
    }

    fn load_selected(&mut self) {
        self.current = None;
        let Some(info) = usize::try_from(self.selected)
            .ok()
            .and_then(|i| self.plugins.get(i))
        else {
            return;
        };
        self.log(&format!("Loading plugin: {}", info.name));
        match Instance::load(&info.path, info.plugin_index) {
            Ok(instance) => self.current = Some(instance),
            Err(e) => {
                self.log("Failed to load plugin");
                tracing::warn!("{e}");
                self.selected = -1;
            }
        }
    }

    pub fn on_midi(&mut self, msg: &[u8]) {
        if self.current.is_none() || msg.len() < 3 {
            return;
        }
        let status = msg[0] & 0xF0;
        if status == 0x90 || status == 0x80 {
            let note = transposed_note(msg[1], self.octave_transpose);
            events::enqueue_midi(&[msg[0], note, msg[2]]);
        } else {
            events::enqueue_midi(msg);
        }
    }

    pub fn set_param(&mut self, key: &str, val: &str) {
        match key {
            "selected_plugin" => {
                let index = parse_int(val);
                if index >= 0 && (index as usize) < self.plugins.len() && index != self.selected {
                    self.selected = index;
                    self.load_selected();
                }
            }
            "refresh" => self.scan_plugins(),
            "octave_transpose" => {
                self.octave_transpose = parse_int(val).clamp(-OCTAVE_RANGE, OCTAVE_RANGE);
            }
            "param_bank" => self.param_bank = parse_int(val),
            _ => {
                if let Some(index) = index_suffix(key, "param_") {
                    if let Some(instance) = self.current.as_mut() {
                        instance.param_set(index as u32, parse_float(val));
                    }
                }
            }
        }
    }

    pub fn get_param(&self, key: &str) -> Option<String> {
        match key {
            "plugin_count" => return Some(self.plugins.len().to_string()),
            "selected_plugin" => return Some(self.selected.to_string()),
            "current_plugin_name" => {
                let name = usize::try_from(self.selected)
                    .ok()
                    .and_then(|i| self.plugins.get(i))
                    .map(|info| info.name.clone());
                return Some(name.unwrap_or_else(|| "None".into()));
            }
            "octave_transpose" => return Some(self.octave_transpose.to_string()),
            "param_bank" => return Some(self.param_bank.to_string()),
            "param_count" => {
                let count = self.current.as_ref().map_or(0, Instance::param_count);
                return Some(count.to_string());
            }
            _ => {}
        }

        if let Some(index) = index_suffix(key, "plugin_name_") {
            return self.plugins.get(index).map(|info| info.name.clone());
        }
        if let Some(index) = index_suffix(key, "plugin_id_") {
            return self.plugins.get(index).map(|info| info.id.clone());
        }
        if let Some(index) = index_suffix(key, "param_name_") {
            return self
                .current
                .as_ref()
                .and_then(|c| c.param_info(index as u32))
                .map(|info| info.name);
        }
        if let Some(index) = index_suffix(key, "param_value_") {
            let value = self
                .current
                .as_ref()
                .map_or(0.0, |c| c.param_get(index as u32));
            return Some(format!("{value:.3}"));
        }

        None
    }

    pub fn render(&mut self, out: &mut [i16], frames: usize) {
        match self.current.as_mut() {
            Some(instance) => {
                if instance.process_block(None, out, frames).is_err() {
                    out[..frames * 2].fill(0);
                }
            }
            None => out[..frames * 2].fill(0),
        }
    }
}

fn index_suffix(key: &str, prefix: &str) -> Option<usize> {
    key.strip_prefix(prefix)?.parse().ok()
}

// --- C ABI ---

unsafe extern "C" fn gen_on_load(module_dir: *const c_char, _json_defaults: *const c_char) -> c_int {
    let Some(dir) = cstr_arg(module_dir) else {
        return -1;
    };
    let mut generator = Generator::new(dir);
    generator.log("CLAP Host module loading");
    generator.scan_plugins();
    if !generator.plugins.is_empty() {
        generator.selected = 0;
        generator.load_selected();
    }
    *GENERATOR.lock() = Some(generator);
    0
}

unsafe extern "C" fn gen_on_unload() {
    if let Some(generator) = GENERATOR.lock().take() {
        generator.log("CLAP Host module unloading");
    }
}

unsafe extern "C" fn gen_on_midi(msg: *const u8, len: c_int, _source: c_int) {
    if msg.is_null() || len <= 0 {
        return;
    }
    let bytes = std::slice::from_raw_parts(msg, len as usize);
    if let Some(generator) = GENERATOR.lock().as_mut() {
        generator.on_midi(bytes);
    }
}

unsafe extern "C" fn gen_set_param(key: *const c_char, val: *const c_char) {
    let (Some(key), Some(val)) = (cstr_arg(key), cstr_arg(val)) else {
        return;
    };
    if let Some(generator) = GENERATOR.lock().as_mut() {
        generator.set_param(key, val);
    }
}

unsafe extern "C" fn gen_get_param(key: *const c_char, buf: *mut c_char, buf_len: c_int) -> c_int {
    let Some(key) = cstr_arg(key) else {
        return -1;
    };
    let guard = GENERATOR.lock();
    let Some(generator) = guard.as_ref() else {
        return -1;
    };
    match generator.get_param(key) {
        Some(value) => write_c_out(buf, buf_len, &value),
        None => -1,
    }
}

unsafe extern "C" fn gen_render_block(out: *mut i16, frames: c_int) {
    if out.is_null() || frames <= 0 {
        return;
    }
    let out = std::slice::from_raw_parts_mut(out, frames as usize * 2);
    match GENERATOR.lock().as_mut() {
        Some(generator) => generator.render(out, frames as usize),
        None => out.fill(0),
    }
}

static GENERATOR_API: PluginApiV1 = PluginApiV1 {
    api_version: MOVE_PLUGIN_API_VERSION,
    on_load: Some(gen_on_load),
    on_unload: Some(gen_on_unload),
    on_midi: Some(gen_on_midi),
    set_param: Some(gen_set_param),
    get_param: Some(gen_get_param),
    render_block: Some(gen_render_block),
};

/// Entry point the outer chain resolves for the sound generator module.
///
/// # Safety
/// `host` must be null or point to a host table that outlives the module.
#[no_mangle]
pub unsafe extern "C" fn move_plugin_init_v1(host: *const HostApiV1) -> *const PluginApiV1 {
    HOST_API.store(host as *mut HostApiV1, Ordering::Release);
    &GENERATOR_API
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transpose_clips_to_midi_range() {
        assert_eq!(transposed_note(60, 0), 60);
        assert_eq!(transposed_note(60, 1), 72);
        assert_eq!(transposed_note(60, -2), 36);
        assert_eq!(transposed_note(120, 2), 127);
        assert_eq!(transposed_note(5, -2), 0);
    }

    #[test]
    fn test_octave_transpose_is_clamped() {
        let mut generator = Generator::new("/tmp/does-not-matter");
        generator.set_param("octave_transpose", "5");
        assert_eq!(generator.get_param("octave_transpose").unwrap(), "2");
        generator.set_param("octave_transpose", "-7");
        assert_eq!(generator.get_param("octave_transpose").unwrap(), "-2");
        generator.set_param("octave_transpose", "1");
        assert_eq!(generator.get_param("octave_transpose").unwrap(), "1");
    }

    #[test]
    fn test_reads_with_no_plugins() {
        let generator = Generator::new("/tmp/does-not-matter");
        assert_eq!(generator.get_param("plugin_count").unwrap(), "0");
        assert_eq!(generator.get_param("selected_plugin").unwrap(), "-1");
        assert_eq!(generator.get_param("current_plugin_name").unwrap(), "None");
        assert_eq!(generator.get_param("param_count").unwrap(), "0");
        assert_eq!(generator.get_param("param_value_0").unwrap(), "0.000");
        assert!(generator.get_param("plugin_name_0").is_none());
        assert!(generator.get_param("param_name_0").is_none());
        assert!(generator.get_param("bogus_key").is_none());
    }

    #[test]
    fn test_selected_plugin_write_out_of_range_is_ignored() {
        let mut generator = Generator::new("/tmp/does-not-matter");
        generator.set_param("selected_plugin", "3");
        assert_eq!(generator.get_param("selected_plugin").unwrap(), "-1");
    }

    #[test]
    fn test_render_without_plugin_is_silence() {
        let mut generator = Generator::new("/tmp/does-not-matter");
        let mut out = [0x11i16; 256];
        generator.render(&mut out, 128);
        assert!(out.iter().all(|&s| s == 0));
    }

    #[test]
    fn test_param_bank_is_unbounded() {
        let mut generator = Generator::new("/tmp/does-not-matter");
        generator.set_param("param_bank", "42");
        assert_eq!(generator.get_param("param_bank").unwrap(), "42");
    }
}
