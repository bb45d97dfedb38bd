//! Embeddable CLAP host for the Move Anything signal chain.
//!
//! This crate discovers `.clap` bundles on disk, drives plugin instances
//! through the full CLAP lifecycle, marshals MIDI and parameter events into
//! the realtime `process` call, and bridges the chain's interleaved int16
//! stereo blocks to CLAP's deinterleaved float buffers.
//!
//! Two module facades expose the host through the chain's C ABI:
//!
//! - a sound generator (`move_plugin_init_v1`): audio out only, MIDI in,
//!   one process-wide instance;
//! - an audio effect (`move_audio_fx_init_v2`, plus a single-instance
//!   `move_audio_fx_init_v1` for older chains): audio in to audio out,
//!   per-instance state, string-keyed parameter surface.
//!
//! All plugin calls run on the chain's audio thread; the host reports that
//! thread as both the main thread and the audio thread.

pub mod abi;
mod config;
pub mod error;
pub mod events;
mod host;
pub mod instance;
mod params;
mod process;
pub mod scan;

pub mod fx;
pub mod generator;

pub use error::{HostError, LoadStage, Result};
pub use instance::Instance;
pub use params::ParamInfo;
pub use scan::{scan, PluginInfo, PluginList};

/// Sample rate the outer chain runs at, used for plugin activation.
pub const SAMPLE_RATE: f64 = 44_100.0;

/// Fixed block size of the outer chain, in frames.
pub const FRAMES_PER_BLOCK: usize = 128;

/// Frame-count window passed to `clap_plugin.activate`.
pub const MIN_FRAMES: u32 = 1;
pub const MAX_FRAMES: u32 = 4096;
