//! Parameter proxy.
//!
//! CLAP parameters are addressed by a plugin-defined stable id; the chain's
//! control plane addresses them by position. The proxy converts between the
//! two through `params.get_info`. Reads go straight to the plugin; writes
//! are queued on the instance and delivered as `PARAM_VALUE` events on the
//! next process call.

use crate::events::ParamChange;
use crate::instance::{cstr_to_string, Instance};
use clap_sys::ext::params::{clap_param_info, clap_plugin_params, CLAP_EXT_PARAMS};
use clap_sys::plugin::clap_plugin;

/// Descriptor for one parameter, as the control plane sees it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParamInfo {
    pub name: String,
    pub min: f64,
    pub max: f64,
    pub default: f64,
}

impl Instance {
    /// Number of parameters, or 0 when nothing is loaded or the plugin has
    /// no params extension.
    pub fn param_count(&self) -> u32 {
        match self.plugin_ptr() {
            Some(plugin) => unsafe { param_count_raw(plugin) },
            None => 0,
        }
    }

    /// Parameter descriptor by index.
    pub fn param_info(&self, index: u32) -> Option<ParamInfo> {
        let plugin = self.plugin_ptr()?;
        unsafe { param_info_raw(plugin, index) }
    }

    /// Current value by index. Falls back to the declared default when the
    /// plugin does not report a value, and to 0.0 when it has no params
    /// extension at all.
    pub fn param_get(&self, index: u32) -> f64 {
        match self.plugin_ptr() {
            Some(plugin) => unsafe { param_get_raw(plugin, index) },
            None => 0.0,
        }
    }

    /// Queue a value change for the parameter at `index`. The write lands
    /// on the next process call; a full queue loses it by policy.
    pub fn param_set(&mut self, index: u32, value: f64) {
        let Some(plugin) = self.plugin_ptr() else {
            return;
        };
        let Some(param_id) = (unsafe { resolve_param_id(plugin, index) }) else {
            return;
        };
        self.push_param_change(ParamChange { param_id, value });
    }
}

unsafe fn params_extension<'a>(plugin: *const clap_plugin) -> Option<&'a clap_plugin_params> {
    let get_extension = (*plugin).get_extension?;
    let ext = get_extension(plugin, CLAP_EXT_PARAMS.as_ptr());
    if ext.is_null() {
        None
    } else {
        Some(&*(ext as *const clap_plugin_params))
    }
}

pub(crate) unsafe fn param_count_raw(plugin: *const clap_plugin) -> u32 {
    match params_extension(plugin).and_then(|p| p.count) {
        Some(count) => count(plugin),
        None => 0,
    }
}

unsafe fn get_info_raw(plugin: *const clap_plugin, index: u32) -> Option<clap_param_info> {
    let params = params_extension(plugin)?;
    let get_info = params.get_info?;
    let mut info: clap_param_info = std::mem::zeroed();
    if get_info(plugin, index, &mut info) {
        Some(info)
    } else {
        None
    }
}

pub(crate) unsafe fn param_info_raw(plugin: *const clap_plugin, index: u32) -> Option<ParamInfo> {
    let info = get_info_raw(plugin, index)?;
    Some(ParamInfo {
        name: cstr_to_string(info.name.as_ptr()),
        min: info.min_value,
        max: info.max_value,
        default: info.default_value,
    })
}

pub(crate) unsafe fn param_get_raw(plugin: *const clap_plugin, index: u32) -> f64 {
    let Some(info) = get_info_raw(plugin, index) else {
        return 0.0;
    };
    let Some(get_value) = params_extension(plugin).and_then(|p| p.get_value) else {
        return 0.0;
    };
    let mut value = 0.0f64;
    if get_value(plugin, info.id, &mut value) {
        value
    } else {
        info.default_value
    }
}

pub(crate) unsafe fn resolve_param_id(
    plugin: *const clap_plugin,
    index: u32,
) -> Option<clap_sys::id::clap_id> {
    get_info_raw(plugin, index).map(|info| info.id)
}
