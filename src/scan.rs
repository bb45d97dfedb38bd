//! Plugin discovery.
//!
//! Scanning enumerates `.clap` bundles in a directory, opens each one,
//! walks its factory descriptors and instantiates every plugin transiently
//! to ask about its audio and note ports. Bundles that fail to open, init
//! or expose a factory are logged and skipped; the scan itself only fails
//! when the directory cannot be read.

use crate::error::{load_failed, LoadStage, Result};
use crate::host::{host_ptr, record_main_thread};
use crate::instance::{
    cstr_to_string, open_library, query_audio_port_flags, query_note_port_flags, resolve_entry,
    EntryGuard,
};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

/// Hard cap on discovered plugins per directory.
pub const MAX_PLUGINS: usize = 64;

/// Immutable descriptor produced by scanning. `(path, plugin_index)`
/// identifies a plugin uniquely; `id` is the lookup key the control plane
/// uses and is not deduplicated across bundles.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PluginInfo {
    pub id: String,
    pub name: String,
    pub vendor: String,
    pub path: PathBuf,
    pub plugin_index: u32,
    pub has_audio_in: bool,
    pub has_audio_out: bool,
    pub has_midi_in: bool,
    pub has_midi_out: bool,
}

/// Ordered, bounded collection of scan results.
#[derive(Debug, Default)]
pub struct PluginList {
    items: Vec<PluginInfo>,
}

impl PluginList {
    pub fn new() -> Self {
        Self {
            items: Vec::with_capacity(16),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&PluginInfo> {
        self.items.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PluginInfo> {
        self.items.iter()
    }

    pub fn find_by_id(&self, id: &str) -> Option<usize> {
        self.items.iter().position(|p| p.id == id)
    }

    /// Append, respecting the cap. Returns false once the list is full.
    pub(crate) fn push(&mut self, info: PluginInfo) -> bool {
        if self.items.len() >= MAX_PLUGINS {
            return false;
        }
        self.items.push(info);
        true
    }
}

impl<'a> IntoIterator for &'a PluginList {
    type Item = &'a PluginInfo;
    type IntoIter = std::slice::Iter<'a, PluginInfo>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Scan a directory for `.clap` bundles.
///
/// Results come back in directory-iteration order, which the filesystem
/// does not promise to keep stable. Also prepends the directory to
/// `LD_LIBRARY_PATH` so bundles that ship sibling shared libraries
/// resolve, and records the calling thread as the main thread on the first
/// call.
pub fn scan<P: AsRef<Path>>(dir: P) -> Result<PluginList> {
    let dir = dir.as_ref();
    record_main_thread();
    extend_library_path(dir);

    let entries = std::fs::read_dir(dir).map_err(|e| {
        load_failed(
            dir,
            LoadStage::Scanning,
            format!("cannot open directory: {e}"),
        )
    })?;

    let mut list = PluginList::new();
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(dir = %dir.display(), "failed to read directory entry: {e}");
                continue;
            }
        };
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) != Some("clap") {
            continue;
        }
        if let Err(e) = scan_bundle(&path, &mut list) {
            tracing::warn!(path = %path.display(), "skipping bundle: {e}");
        }
    }

    tracing::info!(dir = %dir.display(), count = list.len(), "scanned plugin directory");
    Ok(list)
}

/// Open one bundle and append every plugin it exports.
fn scan_bundle(path: &Path, list: &mut PluginList) -> Result<()> {
    let library = open_library(path, true)?;
    let entry_ptr = resolve_entry(&library, path)?;
    let entry = EntryGuard::init(entry_ptr, path)?;
    let factory = entry.factory(path)?;

    let count = unsafe {
        match (*factory).get_plugin_count {
            Some(get_count) => get_count(factory),
            None => 0,
        }
    };

    for index in 0..count {
        let descriptor = unsafe {
            match (*factory).get_plugin_descriptor {
                Some(get_descriptor) => get_descriptor(factory, index),
                None => break,
            }
        };
        if descriptor.is_null() {
            continue;
        }

        let mut info = unsafe {
            PluginInfo {
                id: cstr_to_string((*descriptor).id),
                name: cstr_to_string((*descriptor).name),
                vendor: cstr_to_string((*descriptor).vendor),
                path: path.to_path_buf(),
                plugin_index: index,
                ..PluginInfo::default()
            }
        };

        // Transient instance just to ask about ports. Plugins that refuse
        // to init still get a record, with every flag false.
        unsafe {
            if let Some(create) = (*factory).create_plugin {
                let id = (*descriptor).id;
                if !id.is_null() {
                    let plugin = create(factory, host_ptr(), id);
                    if !plugin.is_null() {
                        let initialized = match (*plugin).init {
                            Some(init) => init(plugin),
                            None => false,
                        };
                        if initialized {
                            let (audio_in, audio_out) = query_audio_port_flags(plugin);
                            let (midi_in, midi_out) = query_note_port_flags(plugin);
                            info.has_audio_in = audio_in;
                            info.has_audio_out = audio_out;
                            info.has_midi_in = midi_in;
                            info.has_midi_out = midi_out;
                        }
                        if let Some(destroy) = (*plugin).destroy {
                            destroy(plugin);
                        }
                    }
                }
            }
        }

        if !list.push(info) {
            tracing::warn!(path = %path.display(), "plugin list full, ignoring the rest");
            break;
        }
    }

    Ok(())
}

/// Prepend `dir` to `LD_LIBRARY_PATH` so a bundle's sibling libraries
/// resolve. Repeated scans prepend again; the variable is not deduplicated.
fn extend_library_path(dir: &Path) {
    let dir = dir.display().to_string();
    let merged = match env::var("LD_LIBRARY_PATH") {
        Ok(current) if !current.is_empty() => format!("{dir}:{current}"),
        _ => dir,
    };
    env::set_var("LD_LIBRARY_PATH", merged);
}
