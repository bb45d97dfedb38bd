//! Plugin instance lifecycle.
//!
//! `load` walks the full activation sequence: open the library, resolve
//! `clap_entry`, init the entry, pull the factory, read the descriptor,
//! create the plugin, init, activate, start processing. Every acquisition
//! is held by a guard until the whole chain has succeeded, so a failure at
//! any step releases everything acquired so far in reverse order. `unload`
//! runs the same ladder backwards and leaves the instance empty; unloading
//! an empty instance is a no-op.

use crate::error::{load_failed, LoadStage, Result};
use crate::events::{ParamChange, MAX_PARAM_EVENTS};
use crate::host::host_ptr;
use crate::process::Scratch;
use crate::{MAX_FRAMES, MIN_FRAMES, SAMPLE_RATE};
use clap_sys::entry::clap_plugin_entry;
use clap_sys::ext::audio_ports::{clap_plugin_audio_ports, CLAP_EXT_AUDIO_PORTS};
use clap_sys::ext::note_ports::{clap_plugin_note_ports, CLAP_EXT_NOTE_PORTS};
use clap_sys::factory::plugin_factory::{clap_plugin_factory, CLAP_PLUGIN_FACTORY_ID};
use clap_sys::plugin::{clap_plugin, clap_plugin_descriptor};
use libloading::Library;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

/// A loaded, activated plugin plus everything needed to tear it down.
///
/// Field order matters: `Drop` runs the plugin/entry teardown in its body,
/// then `_library` closes the bundle last.
#[derive(Debug)]
struct LoadedPlugin {
    plugin: *const clap_plugin,
    entry: *const clap_plugin_entry,
    path: PathBuf,
    has_audio_in: bool,
    has_audio_out: bool,
    activated: bool,
    processing: bool,
    scratch: Scratch,
    _library: Library,
}

// Plugin pointers are only ever touched from the chain's audio thread; the
// facades that own instances sit behind that single thread.
unsafe impl Send for LoadedPlugin {}

impl Drop for LoadedPlugin {
    fn drop(&mut self) {
        unsafe {
            let plugin = &*self.plugin;
            if self.processing {
                if let Some(stop) = plugin.stop_processing {
                    stop(self.plugin);
                }
                self.processing = false;
            }
            if self.activated {
                if let Some(deactivate) = plugin.deactivate {
                    deactivate(self.plugin);
                }
                self.activated = false;
            }
            if let Some(destroy) = plugin.destroy {
                destroy(self.plugin);
            }
            if let Some(deinit) = (*self.entry).deinit {
                deinit();
            }
        }
        tracing::debug!(path = %self.path.display(), "unloaded plugin");
    }
}

/// A plugin instance slot. Starts empty; `load` fills it, `unload` (or
/// drop) clears it.
#[derive(Default, Debug)]
pub struct Instance {
    state: Option<LoadedPlugin>,
    pub(crate) param_queue: Vec<ParamChange>,
}

impl Instance {
    /// Load and fully activate the plugin at `plugin_index` inside the
    /// bundle at `path`.
    pub fn load(path: &Path, plugin_index: u32) -> Result<Self> {
        let library = open_library(path, false)?;
        let entry_ptr = resolve_entry(&library, path)?;
        let entry = EntryGuard::init(entry_ptr, path)?;
        let factory = entry.factory(path)?;
        let descriptor = plugin_descriptor(factory, plugin_index, path)?;
        let mut plugin = PluginGuard::create(factory, descriptor, path)?;
        plugin.init(path)?;
        let (has_audio_in, has_audio_out) = unsafe { query_audio_port_flags(plugin.raw()) };
        plugin.activate(SAMPLE_RATE, MIN_FRAMES, MAX_FRAMES, path)?;
        plugin.start_processing(path)?;

        tracing::info!(path = %path.display(), plugin_index, "loaded plugin");

        Ok(Self {
            state: Some(LoadedPlugin {
                plugin: plugin.into_raw(),
                entry: entry.into_raw(),
                path: path.to_path_buf(),
                has_audio_in,
                has_audio_out,
                activated: true,
                processing: true,
                scratch: Scratch::default(),
                _library: library,
            }),
            param_queue: Vec::new(),
        })
    }

    /// Tear the plugin down and leave the slot empty. Safe to call on an
    /// empty instance.
    pub fn unload(&mut self) {
        self.state = None;
        self.param_queue.clear();
    }

    pub fn is_loaded(&self) -> bool {
        self.state.is_some()
    }

    pub fn path(&self) -> Option<&Path> {
        self.state.as_ref().map(|s| s.path.as_path())
    }

    pub fn has_audio_in(&self) -> bool {
        self.state.as_ref().is_some_and(|s| s.has_audio_in)
    }

    pub fn has_audio_out(&self) -> bool {
        self.state.as_ref().is_some_and(|s| s.has_audio_out)
    }

    pub(crate) fn plugin_ptr(&self) -> Option<*const clap_plugin> {
        self.state.as_ref().map(|s| s.plugin)
    }

    /// Append a resolved parameter write. Drops silently when the queue is
    /// full; losing a write beats blocking the audio thread.
    pub(crate) fn push_param_change(&mut self, change: ParamChange) {
        if self.param_queue.len() < MAX_PARAM_EVENTS {
            self.param_queue.push(change);
        }
    }

    /// Split borrow used by the process path: plugin pointer, scratch
    /// buffers, port flags and the parameter queue, all at once.
    pub(crate) fn process_parts(
        &mut self,
    ) -> Option<(
        *const clap_plugin,
        &mut Scratch,
        &mut Vec<ParamChange>,
        bool,
        bool,
    )> {
        let state = self.state.as_mut()?;
        Some((
            state.plugin,
            &mut state.scratch,
            &mut self.param_queue,
            state.has_audio_in,
            state.has_audio_out,
        ))
    }
}

// --- shared low-level loading helpers (also used by the scanner) ---

/// Open a bundle. Scanning uses lazy binding so broken bundles surface
/// cheaply; loading binds eagerly so missing symbols fail here and not in
/// the middle of a process call.
pub(crate) fn open_library(path: &Path, lazy: bool) -> Result<Library> {
    use libloading::os::unix;
    let flags = if lazy {
        unix::RTLD_LAZY | unix::RTLD_LOCAL
    } else {
        unix::RTLD_NOW | unix::RTLD_LOCAL
    };
    unsafe {
        unix::Library::open(Some(path), flags)
            .map(Library::from)
            .map_err(|e| load_failed(path, LoadStage::Opening, format!("dlopen failed: {e}")))
    }
}

/// Resolve the `clap_entry` symbol. The symbol is the entry struct itself,
/// not a function returning it.
pub(crate) fn resolve_entry(library: &Library, path: &Path) -> Result<*const clap_plugin_entry> {
    let entry: *const clap_plugin_entry = unsafe {
        *library
            .get::<*const clap_plugin_entry>(b"clap_entry\0")
            .map_err(|e| load_failed(path, LoadStage::Opening, format!("no clap_entry: {e}")))?
    };
    if entry.is_null() {
        return Err(load_failed(path, LoadStage::Opening, "clap_entry is null"));
    }
    Ok(entry)
}

/// Entry kept initialized until dropped (or disarmed with `into_raw`).
pub(crate) struct EntryGuard {
    entry: *const clap_plugin_entry,
}

impl EntryGuard {
    pub(crate) fn init(entry: *const clap_plugin_entry, path: &Path) -> Result<Self> {
        let path_c = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| load_failed(path, LoadStage::Entry, "path contains a NUL byte"))?;
        let init = unsafe { (*entry).init }
            .ok_or_else(|| load_failed(path, LoadStage::Entry, "entry has no init"))?;
        if !unsafe { init(path_c.as_ptr()) } {
            return Err(load_failed(path, LoadStage::Entry, "entry init failed"));
        }
        Ok(Self { entry })
    }

    pub(crate) fn factory(&self, path: &Path) -> Result<*const clap_plugin_factory> {
        let get_factory = unsafe { (*self.entry).get_factory }
            .ok_or_else(|| load_failed(path, LoadStage::Factory, "entry has no get_factory"))?;
        let factory =
            unsafe { get_factory(CLAP_PLUGIN_FACTORY_ID.as_ptr()) } as *const clap_plugin_factory;
        if factory.is_null() {
            return Err(load_failed(path, LoadStage::Factory, "no plugin factory"));
        }
        Ok(factory)
    }

    fn into_raw(self) -> *const clap_plugin_entry {
        let entry = self.entry;
        std::mem::forget(self);
        entry
    }
}

impl Drop for EntryGuard {
    fn drop(&mut self) {
        unsafe {
            if let Some(deinit) = (*self.entry).deinit {
                deinit();
            }
        }
    }
}

pub(crate) fn plugin_descriptor(
    factory: *const clap_plugin_factory,
    plugin_index: u32,
    path: &Path,
) -> Result<*const clap_plugin_descriptor> {
    let get_descriptor = unsafe { (*factory).get_plugin_descriptor }.ok_or_else(|| {
        load_failed(path, LoadStage::Descriptor, "factory has no get_plugin_descriptor")
    })?;
    let descriptor = unsafe { get_descriptor(factory, plugin_index) };
    if descriptor.is_null() {
        return Err(load_failed(
            path,
            LoadStage::Descriptor,
            format!("no descriptor at index {plugin_index}"),
        ));
    }
    Ok(descriptor)
}

/// Created plugin, destroyed on drop unless disarmed. Tracks how far the
/// activation ladder got so a later failure unwinds only what happened.
struct PluginGuard {
    plugin: *const clap_plugin,
    activated: bool,
    processing: bool,
}

impl PluginGuard {
    fn create(
        factory: *const clap_plugin_factory,
        descriptor: *const clap_plugin_descriptor,
        path: &Path,
    ) -> Result<Self> {
        let create = unsafe { (*factory).create_plugin }.ok_or_else(|| {
            load_failed(path, LoadStage::Instantiation, "factory has no create_plugin")
        })?;
        let id = unsafe { (*descriptor).id };
        if id.is_null() {
            return Err(load_failed(path, LoadStage::Instantiation, "descriptor has no id"));
        }
        let plugin = unsafe { create(factory, host_ptr(), id) };
        if plugin.is_null() {
            return Err(load_failed(path, LoadStage::Instantiation, "create_plugin failed"));
        }
        Ok(Self {
            plugin,
            activated: false,
            processing: false,
        })
    }

    fn raw(&self) -> *const clap_plugin {
        self.plugin
    }

    fn init(&self, path: &Path) -> Result<()> {
        let init = unsafe { (*self.plugin).init }
            .ok_or_else(|| load_failed(path, LoadStage::Initialization, "plugin has no init"))?;
        if !unsafe { init(self.plugin) } {
            return Err(load_failed(path, LoadStage::Initialization, "plugin init failed"));
        }
        Ok(())
    }

    fn activate(&mut self, sample_rate: f64, min_frames: u32, max_frames: u32, path: &Path) -> Result<()> {
        let activate = unsafe { (*self.plugin).activate }
            .ok_or_else(|| load_failed(path, LoadStage::Activation, "plugin has no activate"))?;
        if !unsafe { activate(self.plugin, sample_rate, min_frames, max_frames) } {
            return Err(load_failed(path, LoadStage::Activation, "activate failed"));
        }
        self.activated = true;
        Ok(())
    }

    fn start_processing(&mut self, path: &Path) -> Result<()> {
        let start = unsafe { (*self.plugin).start_processing }.ok_or_else(|| {
            load_failed(path, LoadStage::Activation, "plugin has no start_processing")
        })?;
        if !unsafe { start(self.plugin) } {
            return Err(load_failed(path, LoadStage::Activation, "start_processing failed"));
        }
        self.processing = true;
        Ok(())
    }

    fn into_raw(self) -> *const clap_plugin {
        let plugin = self.plugin;
        std::mem::forget(self);
        plugin
    }
}

impl Drop for PluginGuard {
    fn drop(&mut self) {
        unsafe {
            let plugin = &*self.plugin;
            if self.processing {
                if let Some(stop) = plugin.stop_processing {
                    stop(self.plugin);
                }
            }
            if self.activated {
                if let Some(deactivate) = plugin.deactivate {
                    deactivate(self.plugin);
                }
            }
            if let Some(destroy) = plugin.destroy {
                destroy(self.plugin);
            }
        }
    }
}

/// Ask an initialized plugin about its audio ports.
pub(crate) unsafe fn query_audio_port_flags(plugin: *const clap_plugin) -> (bool, bool) {
    let Some(get_extension) = (*plugin).get_extension else {
        return (false, false);
    };
    let ext = get_extension(plugin, CLAP_EXT_AUDIO_PORTS.as_ptr());
    if ext.is_null() {
        return (false, false);
    }
    let ports = &*(ext as *const clap_plugin_audio_ports);
    match ports.count {
        Some(count) => (count(plugin, true) > 0, count(plugin, false) > 0),
        None => (false, false),
    }
}

/// Ask an initialized plugin about its note ports.
pub(crate) unsafe fn query_note_port_flags(plugin: *const clap_plugin) -> (bool, bool) {
    let Some(get_extension) = (*plugin).get_extension else {
        return (false, false);
    };
    let ext = get_extension(plugin, CLAP_EXT_NOTE_PORTS.as_ptr());
    if ext.is_null() {
        return (false, false);
    }
    let ports = &*(ext as *const clap_plugin_note_ports);
    match ports.count {
        Some(count) => (count(plugin, true) > 0, count(plugin, false) > 0),
        None => (false, false),
    }
}

pub(crate) fn cstr_to_string(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HostError;

    #[test]
    fn test_load_missing_bundle_fails_at_opening() {
        let err = Instance::load(Path::new("/nonexistent/missing.clap"), 0).unwrap_err();
        match err {
            HostError::LoadFailed { stage, .. } => assert_eq!(stage, LoadStage::Opening),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_load_non_plugin_library_fails() {
        // libc is a perfectly good shared object with no clap_entry in it.
        let candidates = ["/lib/x86_64-linux-gnu/libc.so.6", "/usr/lib/libc.so.6"];
        let Some(path) = candidates.iter().map(Path::new).find(|p| p.exists()) else {
            return;
        };
        let err = Instance::load(path, 0).unwrap_err();
        match err {
            HostError::LoadFailed { stage, .. } => assert_eq!(stage, LoadStage::Opening),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unload_is_idempotent() {
        let mut instance = Instance::default();
        assert!(!instance.is_loaded());
        instance.unload();
        instance.unload();
        assert!(!instance.is_loaded());
        assert!(instance.plugin_ptr().is_none());
        assert!(instance.path().is_none());
    }

    #[test]
    fn test_param_queue_is_bounded() {
        let mut instance = Instance::default();
        for i in 0..MAX_PARAM_EVENTS + 10 {
            instance.push_param_change(ParamChange {
                param_id: i as u32,
                value: 0.0,
            });
        }
        assert_eq!(instance.param_queue.len(), MAX_PARAM_EVENTS);
    }

    #[test]
    fn test_cstr_to_string_null() {
        assert_eq!(cstr_to_string(std::ptr::null()), "");
    }
}
