//! Audio FX facade.
//!
//! Hosts a CLAP effect inside the chain's audio path. Each instance owns
//! its own scan list, loaded plugin and parameter cache; the v2 ABI passes
//! instances around as opaque pointers, while the v1 ABI drives a single
//! process-wide instance for older chains.
//!
//! Effects are picked out of the sound generator's plugin directory
//! (`{module_dir}/../../sound_generators/clap/plugins` by convention, or an
//! explicit `plugin_dir` from the config JSON) and must declare an audio
//! input. On load the facade caches up to 32 parameter descriptors with
//! sanitized key names so the UI can address them as `cutoff_freq` rather
//! than "Cutoff Freq".

use crate::abi::{
    cstr_arg, write_c_out, AudioFxApiV1, AudioFxApiV2, HostApiV1, AUDIO_FX_API_VERSION,
    AUDIO_FX_API_VERSION_2,
};
use crate::config::{extract_string_value, parse_float, parse_int};
use crate::error::{HostError, Result};
use crate::generator::{chain_log, HOST_API};
use crate::instance::Instance;
use crate::scan::{scan, PluginList};
use crate::FRAMES_PER_BLOCK;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::io::Write;
use std::os::raw::{c_char, c_int, c_void};
use std::path::PathBuf;
use std::sync::atomic::Ordering;

const MAX_CACHED_PARAMS: usize = 32;
const CHAIN_PARAM_KNOBS: usize = 8;
const DEFAULT_PLUGIN_DIR: &str = "../../sound_generators/clap/plugins";
const DEBUG_LOG_PATH: &str = "/tmp/clap_fx_debug.txt";

fn fx_log(msg: &str) {
    chain_log(msg);
    eprintln!("[CLAP FX] {msg}");
    tracing::debug!(target: "clap_fx", "{msg}");
    if let Ok(mut file) = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(DEBUG_LOG_PATH)
    {
        let _ = writeln!(file, "[CLAP FX] {msg}");
    }
}

struct CachedParam {
    name: String,
    key: String,
    min: f64,
    max: f64,
}

/// One effect slot in the chain.
pub struct FxInstance {
    module_dir: PathBuf,
    plugin_dir: Option<PathBuf>,
    selected_id: String,
    selected_index: i32,
    plugins_scanned: bool,
    plugins: PluginList,
    current: Option<Instance>,
    cached: Vec<CachedParam>,
}

/// Turn a display name into a stable wire key: letters lowercased, digits
/// kept, any run of anything else collapses to one `_`, never at the
/// start. An empty result becomes `"param"`.
pub(crate) fn sanitize_param_key(name: &str) -> String {
    let mut key = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            key.push(c.to_ascii_lowercase());
        } else if !key.is_empty() && !key.ends_with('_') {
            key.push('_');
        }
    }
    if key.is_empty() {
        key.push_str("param");
    }
    key
}

impl FxInstance {
    pub fn new(module_dir: impl Into<PathBuf>, config_json: &str) -> Self {
        let mut instance = Self {
            module_dir: module_dir.into(),
            plugin_dir: extract_string_value(config_json, "plugin_dir")
                .filter(|d| !d.is_empty())
                .map(PathBuf::from),
            selected_id: String::new(),
            selected_index: -1,
            plugins_scanned: false,
            plugins: PluginList::new(),
            current: None,
            cached: Vec::new(),
        };

        if let Some(id) = extract_string_value(config_json, "plugin_id") {
            if !id.is_empty() {
                instance.selected_id = id.to_string();
                if instance.load_by_id(id).is_ok() {
                    fx_log("FX plugin loaded successfully");
                }
            }
        }

        instance
    }

    fn plugins_dir(&self) -> PathBuf {
        match &self.plugin_dir {
            Some(dir) => dir.clone(),
            None => self.module_dir.join(DEFAULT_PLUGIN_DIR),
        }
    }

    /// One-shot scan of the plugin directory.
    fn ensure_scanned(&mut self) {
        if self.plugins_scanned {
            return;
        }
        let dir = self.plugins_dir();
        fx_log(&format!("Scanning plugins at: {}", dir.display()));
        match scan(&dir) {
            Ok(list) => {
                fx_log(&format!("Found {} plugins", list.len()));
                self.plugins = list;
            }
            Err(_) => fx_log("Failed to scan plugins directory"),
        }
        self.plugins_scanned = true;
    }

    fn load_by_index(&mut self, index: i32) -> Result<()> {
        self.ensure_scanned();

        let Some(info) = usize::try_from(index)
            .ok()
            .and_then(|i| self.plugins.get(i))
        else {
            fx_log("Plugin index out of range");
            return Err(HostError::OutOfRange {
                index,
                count: self.plugins.len(),
            });
        };

        if !info.has_audio_in {
            fx_log("Plugin is not an audio effect (no audio input)");
            return Err(HostError::NotAnEffect {
                id: info.id.clone(),
            });
        }

        let info = info.clone();
        self.current = None;

        fx_log(&format!("Loading FX plugin [{index}]: {}", info.name));
        match Instance::load(&info.path, info.plugin_index) {
            Ok(instance) => {
                self.current = Some(instance);
                self.selected_index = index;
                self.selected_id = info.id;
                self.cache_params();
                Ok(())
            }
            Err(e) => {
                fx_log("Failed to load plugin");
                tracing::warn!("{e}");
                self.selected_index = -1;
                self.selected_id.clear();
                self.cached.clear();
                Err(e)
            }
        }
    }

    fn load_by_id(&mut self, plugin_id: &str) -> Result<()> {
        self.ensure_scanned();
        fx_log(&format!("Searching for plugin: {plugin_id}"));
        match self.plugins.find_by_id(plugin_id) {
            Some(index) => self.load_by_index(index as i32),
            None => {
                fx_log(&format!("Plugin not found: {plugin_id}"));
                Err(HostError::NotFound {
                    id: plugin_id.to_string(),
                })
            }
        }
    }

    fn cache_params(&mut self) {
        self.cached.clear();
        let Some(instance) = self.current.as_ref() else {
            return;
        };
        let count = (instance.param_count() as usize).min(MAX_CACHED_PARAMS);
        for index in 0..count {
            let (name, min, max) = match instance.param_info(index as u32) {
                Some(info) if !info.name.is_empty() => (info.name, info.min, info.max),
                _ => (format!("Param {index}"), 0.0, 1.0),
            };
            self.cached.push(CachedParam {
                key: sanitize_param_key(&name),
                name,
                min,
                max,
            });
        }
        fx_log(&format!("Cached {} param names", self.cached.len()));
    }

    fn find_param_by_key(&self, key: &str) -> Option<usize> {
        self.cached.iter().position(|p| p.key == key)
    }

    fn selected_name(&self) -> Option<&str> {
        usize::try_from(self.selected_index)
            .ok()
            .and_then(|i| self.plugins.get(i))
            .map(|info| info.name.as_str())
    }

    /// Process one block in place. With no plugin loaded (or a failing
    /// plugin) the block passes through untouched.
    pub fn process(&mut self, block: &mut [i16], frames: usize) {
        let Some(instance) = self.current.as_mut() else {
            return;
        };
        let input: SmallVec<[i16; 2 * FRAMES_PER_BLOCK]> =
            SmallVec::from_slice(&block[..frames * 2]);
        // On error the output was never written; the input stays in place.
        let _ = instance.process_block(Some(input.as_slice()), block, frames);
    }

    pub fn set_param(&mut self, key: &str, val: &str) {
        fx_log(&format!("set_param: key='{key}' val='{val}'"));

        if key == "plugin_id" {
            if val != self.selected_id {
                let _ = self.load_by_id(val);
            }
        } else if key == "plugin_index" {
            let index = parse_int(val);
            if index != self.selected_index {
                let _ = self.load_by_index(index);
            }
        } else if let Some(index) = numeric_suffix(key, "param_") {
            if let Some(instance) = self.current.as_mut() {
                let value = parse_float(val);
                instance.param_set(index as u32, value);
                fx_log(&format!("Set param[{index}] = {value:.3}"));
            }
        } else if let Some(index) = self.find_param_by_key(key) {
            if let Some(instance) = self.current.as_mut() {
                let value = parse_float(val);
                instance.param_set(index as u32, value);
                fx_log(&format!("Set param '{key}' [{index}] = {value:.3}"));
            }
        }
    }

    pub fn get_param(&mut self, key: &str, buf_len: usize) -> Option<String> {
        // List queries force the one-shot scan first.
        if key.starts_with("plugin") {
            self.ensure_scanned();
        }

        match key {
            "plugin_id" => return Some(self.selected_id.clone()),
            "plugin_name" | "preset_name" => {
                return Some(self.selected_name().unwrap_or("None").to_string());
            }
            "plugin_count" => return Some(self.plugins.len().to_string()),
            "plugin_index" => return Some(self.selected_index.max(0).to_string()),
            "param_count" => {
                let count = self.current.as_ref().map_or(0, Instance::param_count);
                return Some(count.to_string());
            }
            "chain_params" => return Some(self.chain_params(buf_len)),
            "name" => return Some(self.selected_name().unwrap_or("CLAP FX").to_string()),
            "ui_hierarchy" => return Some(UI_HIERARCHY.to_string()),
            _ => {}
        }

        if let Some(rest) = key.strip_prefix("plugin_") {
            if let Some(index) = rest.strip_suffix("_name").and_then(|s| s.parse::<usize>().ok())
            {
                let name = self.plugins.get(index).map(|info| info.name.as_str());
                return Some(name.unwrap_or("---").to_string());
            }
        }

        if let Some(index) = numeric_suffix(key, "param_name_") {
            let name = self
                .current
                .as_ref()
                .and_then(|c| c.param_info(index as u32))
                .map(|info| info.name);
            return Some(name.unwrap_or_else(|| format!("Param {index}")));
        }
        if let Some(index) = numeric_suffix(key, "param_value_") {
            let value = self
                .current
                .as_ref()
                .map_or(0.0, |c| c.param_get(index as u32));
            return Some(format!("{value:.3}"));
        }
        if let Some(rest) = key.strip_prefix("param_") {
            if let Some(index) = rest.strip_suffix("_label").and_then(|s| s.parse::<usize>().ok())
            {
                if let Some(param) = self.cached.get(index) {
                    return Some(param.name.clone());
                }
                let name = self
                    .current
                    .as_ref()
                    .and_then(|c| c.param_info(index as u32))
                    .map(|info| info.name)
                    .filter(|name| !name.is_empty());
                return Some(name.unwrap_or_else(|| format!("Param {index}")));
            }
        }
        if let Some(index) = numeric_suffix(key, "param_") {
            let Some(instance) = self.current.as_ref() else {
                return Some("0.0".to_string());
            };
            return Some(format!("{:.3}", instance.param_get(index as u32)));
        }

        // Last resort: the key may be a sanitized parameter name.
        let index = self.find_param_by_key(key)?;
        let instance = self.current.as_ref()?;
        Some(format!("{:.3}", instance.param_get(index as u32)))
    }

    /// Parameter metadata for the UI's knob row, as a JSON array of up to
    /// eight objects. Emission stops early when the caller's buffer is
    /// nearly full so the write never truncates mid-object.
    fn chain_params(&self, buf_len: usize) -> String {
        let count = self.cached.len().min(CHAIN_PARAM_KNOBS);
        if count == 0 {
            return "[]".to_string();
        }
        let mut out = String::from("[");
        for (index, param) in self.cached.iter().take(count).enumerate() {
            if buf_len.saturating_sub(out.len()) < 100 {
                break;
            }
            if index > 0 {
                out.push(',');
            }
            // serde_json handles whatever bytes the plugin put in the name.
            let name = serde_json::to_string(&param.name).unwrap_or_else(|_| "\"\"".into());
            out.push_str(&format!(
                "{{\"key\":\"param_{index}\",\"name\":{name},\"type\":\"float\",\"min\":{:.3},\"max\":{:.3}}}",
                param.min, param.max
            ));
        }
        out.push(']');
        out
    }
}

/// Fixed UI layout: one root level listing plugins, eight knob slots bound
/// to `param_0..param_7`.
const UI_HIERARCHY: &str = "{\
\"modes\":null,\
\"levels\":{\
\"root\":{\
\"list_param\":\"plugin_index\",\
\"count_param\":\"plugin_count\",\
\"name_param\":\"plugin_name\",\
\"children\":null,\
\"knobs\":[\"param_0\",\"param_1\",\"param_2\",\"param_3\",\"param_4\",\"param_5\",\"param_6\",\"param_7\"],\
\"params\":[\"param_0\",\"param_1\",\"param_2\",\"param_3\",\"param_4\",\"param_5\",\"param_6\",\"param_7\"]\
}\
}\
}";

fn numeric_suffix(key: &str, prefix: &str) -> Option<usize> {
    key.strip_prefix(prefix)?.parse().ok()
}

// --- C ABI, v2 (instance-based) ---

unsafe extern "C" fn fx2_create_instance(
    module_dir: *const c_char,
    config_json: *const c_char,
) -> *mut c_void {
    let Some(dir) = cstr_arg(module_dir) else {
        return std::ptr::null_mut();
    };
    fx_log("Creating CLAP FX instance");
    let config = cstr_arg(config_json).unwrap_or("");
    let instance = Box::new(FxInstance::new(dir, config));
    Box::into_raw(instance) as *mut c_void
}

unsafe extern "C" fn fx2_destroy_instance(instance: *mut c_void) {
    if instance.is_null() {
        return;
    }
    fx_log("Destroying CLAP FX instance");
    drop(Box::from_raw(instance as *mut FxInstance));
}

unsafe extern "C" fn fx2_process_block(instance: *mut c_void, audio_inout: *mut i16, frames: c_int) {
    if instance.is_null() || audio_inout.is_null() || frames <= 0 {
        return;
    }
    let instance = &mut *(instance as *mut FxInstance);
    let block = std::slice::from_raw_parts_mut(audio_inout, frames as usize * 2);
    instance.process(block, frames as usize);
}

unsafe extern "C" fn fx2_set_param(instance: *mut c_void, key: *const c_char, val: *const c_char) {
    if instance.is_null() {
        return;
    }
    let (Some(key), Some(val)) = (cstr_arg(key), cstr_arg(val)) else {
        return;
    };
    let instance = &mut *(instance as *mut FxInstance);
    instance.set_param(key, val);
}

unsafe extern "C" fn fx2_get_param(
    instance: *mut c_void,
    key: *const c_char,
    buf: *mut c_char,
    buf_len: c_int,
) -> c_int {
    if instance.is_null() || buf_len <= 0 {
        return -1;
    }
    let Some(key) = cstr_arg(key) else {
        return -1;
    };
    let instance = &mut *(instance as *mut FxInstance);
    match instance.get_param(key, buf_len as usize) {
        Some(value) => write_c_out(buf, buf_len, &value),
        None => -1,
    }
}

static FX_API_V2: AudioFxApiV2 = AudioFxApiV2 {
    api_version: AUDIO_FX_API_VERSION_2,
    create_instance: Some(fx2_create_instance),
    destroy_instance: Some(fx2_destroy_instance),
    process_block: Some(fx2_process_block),
    set_param: Some(fx2_set_param),
    get_param: Some(fx2_get_param),
};

/// Entry point the outer chain resolves for instance-based audio FX.
///
/// # Safety
/// `host` must be null or point to a host table that outlives the module.
#[no_mangle]
pub unsafe extern "C" fn move_audio_fx_init_v2(host: *const HostApiV1) -> *const AudioFxApiV2 {
    HOST_API.store(host as *mut HostApiV1, Ordering::Release);
    fx_log("CLAP FX V2 API initialized");
    &FX_API_V2
}

// --- C ABI, v1 (one process-wide instance) ---

static FX_V1: Mutex<Option<FxInstance>> = Mutex::new(None);

unsafe extern "C" fn fx1_on_load(module_dir: *const c_char, config_json: *const c_char) -> c_int {
    let Some(dir) = cstr_arg(module_dir) else {
        return -1;
    };
    fx_log("CLAP FX loading");
    let config = cstr_arg(config_json).unwrap_or("");
    *FX_V1.lock() = Some(FxInstance::new(dir, config));
    0
}

unsafe extern "C" fn fx1_on_unload() {
    fx_log("CLAP FX unloading");
    *FX_V1.lock() = None;
}

unsafe extern "C" fn fx1_process_block(audio_inout: *mut i16, frames: c_int) {
    if audio_inout.is_null() || frames <= 0 {
        return;
    }
    if let Some(instance) = FX_V1.lock().as_mut() {
        let block = std::slice::from_raw_parts_mut(audio_inout, frames as usize * 2);
        instance.process(block, frames as usize);
    }
}

unsafe extern "C" fn fx1_set_param(key: *const c_char, val: *const c_char) {
    let (Some(key), Some(val)) = (cstr_arg(key), cstr_arg(val)) else {
        return;
    };
    if let Some(instance) = FX_V1.lock().as_mut() {
        instance.set_param(key, val);
    }
}

unsafe extern "C" fn fx1_get_param(key: *const c_char, buf: *mut c_char, buf_len: c_int) -> c_int {
    if buf_len <= 0 {
        return -1;
    }
    let Some(key) = cstr_arg(key) else {
        return -1;
    };
    let mut guard = FX_V1.lock();
    let Some(instance) = guard.as_mut() else {
        return -1;
    };
    match instance.get_param(key, buf_len as usize) {
        Some(value) => write_c_out(buf, buf_len, &value),
        None => -1,
    }
}

static FX_API_V1: AudioFxApiV1 = AudioFxApiV1 {
    api_version: AUDIO_FX_API_VERSION,
    on_load: Some(fx1_on_load),
    on_unload: Some(fx1_on_unload),
    process_block: Some(fx1_process_block),
    set_param: Some(fx1_set_param),
    get_param: Some(fx1_get_param),
};

/// Single-instance entry point kept for older chains.
///
/// # Safety
/// `host` must be null or point to a host table that outlives the module.
#[no_mangle]
pub unsafe extern "C" fn move_audio_fx_init_v1(host: *const HostApiV1) -> *const AudioFxApiV1 {
    HOST_API.store(host as *mut HostApiV1, Ordering::Release);
    &FX_API_V1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_param_key() {
        assert_eq!(sanitize_param_key("Cutoff Freq"), "cutoff_freq");
        assert_eq!(sanitize_param_key("A/B  C"), "a_b_c");
        assert_eq!(sanitize_param_key("!!!"), "param");
        assert_eq!(sanitize_param_key("123abc"), "123abc");
        assert_eq!(sanitize_param_key(""), "param");
        assert_eq!(sanitize_param_key("Dry/Wet"), "dry_wet");
        assert_eq!(sanitize_param_key("  Feedback  "), "feedback_");
        assert_eq!(sanitize_param_key("LFO-Rate_2"), "lfo_rate_2");
    }

    fn bare_instance() -> FxInstance {
        // Missing plugin directory: the scan fails and is logged, leaving
        // an empty list, which is exactly the state under test.
        let mut instance = FxInstance::new("/nonexistent/fx-module", "");
        instance.plugins_scanned = true;
        instance
    }

    #[test]
    fn test_reads_with_no_plugin() {
        let mut fx = bare_instance();
        assert_eq!(fx.get_param("plugin_id", 256).unwrap(), "");
        assert_eq!(fx.get_param("plugin_name", 256).unwrap(), "None");
        assert_eq!(fx.get_param("preset_name", 256).unwrap(), "None");
        assert_eq!(fx.get_param("name", 256).unwrap(), "CLAP FX");
        assert_eq!(fx.get_param("plugin_count", 256).unwrap(), "0");
        assert_eq!(fx.get_param("plugin_index", 256).unwrap(), "0");
        assert_eq!(fx.get_param("param_count", 256).unwrap(), "0");
        assert_eq!(fx.get_param("plugin_0_name", 256).unwrap(), "---");
        assert_eq!(fx.get_param("param_0", 256).unwrap(), "0.0");
        assert_eq!(fx.get_param("param_value_0", 256).unwrap(), "0.000");
        assert_eq!(fx.get_param("param_name_0", 256).unwrap(), "Param 0");
        assert_eq!(fx.get_param("param_3_label", 256).unwrap(), "Param 3");
        assert!(fx.get_param("not_a_key", 256).is_none());
    }

    #[test]
    fn test_chain_params_empty() {
        let mut fx = bare_instance();
        assert_eq!(fx.get_param("chain_params", 1024).unwrap(), "[]");
    }

    #[test]
    fn test_chain_params_shape() {
        let mut fx = bare_instance();
        for (name, min, max) in [
            ("Cutoff", 20.0, 20000.0),
            ("Resonance", 0.0, 1.0),
            ("Volume", 0.0, 1.0),
        ] {
            fx.cached.push(CachedParam {
                name: name.to_string(),
                key: sanitize_param_key(name),
                min,
                max,
            });
        }
        let json = fx.get_param("chain_params", 4096).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        let array = parsed.as_array().unwrap();
        assert_eq!(array.len(), 3);
        for (index, object) in array.iter().enumerate() {
            assert_eq!(object["key"], format!("param_{index}"));
            assert_eq!(object["type"], "float");
            assert!(object["min"].is_number());
            assert!(object["max"].is_number());
        }
        assert_eq!(array[0]["name"], "Cutoff");
        assert_eq!(array[0]["min"], 20.0);
        assert_eq!(array[0]["max"], 20000.0);
    }

    #[test]
    fn test_chain_params_respects_buffer_budget() {
        let mut fx = bare_instance();
        for index in 0..8 {
            fx.cached.push(CachedParam {
                name: format!("Parameter Number {index}"),
                key: format!("parameter_number_{index}"),
                min: 0.0,
                max: 1.0,
            });
        }
        let json = fx.get_param("chain_params", 256).unwrap();
        assert!(json.len() < 256);
        // Still valid JSON after truncation.
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(parsed.as_array().unwrap().len() < 8);
    }

    #[test]
    fn test_ui_hierarchy_is_valid_json() {
        let mut fx = bare_instance();
        let json = fx.get_param("ui_hierarchy", 4096).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        let root = &parsed["levels"]["root"];
        assert_eq!(root["list_param"], "plugin_index");
        assert_eq!(root["count_param"], "plugin_count");
        assert_eq!(root["name_param"], "plugin_name");
        assert_eq!(root["knobs"].as_array().unwrap().len(), 8);
        assert_eq!(root["params"].as_array().unwrap().len(), 8);
        assert_eq!(root["params"][0], "param_0");
        assert_eq!(root["params"][7], "param_7");
    }

    #[test]
    fn test_config_plugin_id_is_remembered_even_when_missing() {
        let fx = FxInstance::new("/nonexistent/fx-module", r#"{"plugin_id": "ghost.fx"}"#);
        assert_eq!(fx.selected_id, "ghost.fx");
        assert_eq!(fx.selected_index, -1);
        assert!(fx.current.is_none());
    }

    #[test]
    fn test_config_plugin_dir_override() {
        let fx = FxInstance::new(
            "/nonexistent/fx-module",
            r#"{"plugin_dir": "/opt/claps"}"#,
        );
        assert_eq!(fx.plugins_dir(), PathBuf::from("/opt/claps"));

        let fx = FxInstance::new("/nonexistent/fx-module", "{}");
        assert_eq!(
            fx.plugins_dir(),
            PathBuf::from("/nonexistent/fx-module").join(DEFAULT_PLUGIN_DIR)
        );
    }

    #[test]
    fn test_process_without_plugin_passes_through() {
        let mut fx = bare_instance();
        let original: Vec<i16> = (0..256).map(|i| (i * 101 % 1000) as i16).collect();
        let mut block = original.clone();
        fx.process(&mut block, 128);
        assert_eq!(block, original);
    }

    #[test]
    fn test_instances_are_isolated() {
        let mut a = bare_instance();
        let b = bare_instance();
        a.selected_id = "test.fx".into();
        assert_eq!(b.selected_id, "");
    }

    #[test]
    fn test_find_param_by_key() {
        let mut fx = bare_instance();
        fx.cached.push(CachedParam {
            name: "Cutoff Freq".into(),
            key: "cutoff_freq".into(),
            min: 0.0,
            max: 1.0,
        });
        assert_eq!(fx.find_param_by_key("cutoff_freq"), Some(0));
        assert_eq!(fx.find_param_by_key("resonance"), None);
    }
}
