//! Per-block audio processing.
//!
//! The outer chain speaks interleaved 16-bit stereo; CLAP plugins speak
//! per-channel 32-bit float. Each block: drain the event queues, convert
//! and deinterleave the input, run the plugin, interleave the output back
//! with hard clipping. Conversion is `1/32768` on the way in and
//! `round(x * 32767)` on the way out, matching CLAP's nominal `[-1, +1]`
//! range.

use crate::error::{HostError, Result};
use crate::events::{drain_events, EventBatch, InputEventList, OutputEventList};
use crate::instance::Instance;
use clap_sys::audio_buffer::clap_audio_buffer;
use clap_sys::plugin::clap_plugin;
use clap_sys::process::{clap_process, CLAP_PROCESS_ERROR};
use std::ptr;

/// Reusable deinterleaved float buffers, grown monotonically.
#[derive(Default, Debug)]
pub(crate) struct Scratch {
    ins: [Vec<f32>; 2],
    outs: [Vec<f32>; 2],
}

impl Scratch {
    fn ensure(&mut self, frames: usize) {
        for buf in self.ins.iter_mut().chain(self.outs.iter_mut()) {
            if buf.len() < frames {
                buf.resize(frames, 0.0);
            }
        }
    }
}

impl Instance {
    /// Run one block through the loaded plugin.
    ///
    /// `input` is interleaved int16 stereo or `None` for generators;
    /// `output` receives interleaved int16 stereo. Queued MIDI and
    /// parameter events are drained into this call. Fails when nothing is
    /// loaded or the plugin reports a process error; on failure `output`
    /// is left untouched (callers pass input through or emit silence).
    pub fn process_block(
        &mut self,
        input: Option<&[i16]>,
        output: &mut [i16],
        frames: usize,
    ) -> Result<()> {
        let Some((plugin, scratch, param_queue, has_audio_in, has_audio_out)) =
            self.process_parts()
        else {
            return Err(HostError::ProcessError);
        };
        let events = drain_events(param_queue);
        unsafe {
            process_raw(
                plugin,
                scratch,
                events,
                input,
                output,
                frames,
                has_audio_in,
                has_audio_out,
            )
        }
    }
}

/// The block pipeline against a raw plugin pointer.
///
/// # Safety
/// `plugin` must point to an initialized, activated, processing plugin and
/// all calls must happen on the audio thread.
#[allow(clippy::too_many_arguments)]
pub(crate) unsafe fn process_raw(
    plugin: *const clap_plugin,
    scratch: &mut Scratch,
    events: EventBatch,
    input: Option<&[i16]>,
    output: &mut [i16],
    frames: usize,
    has_audio_in: bool,
    has_audio_out: bool,
) -> Result<()> {
    if !has_audio_out {
        output[..frames * 2].fill(0);
        return Ok(());
    }

    scratch.ensure(frames);

    match input {
        Some(input) if has_audio_in => {
            for i in 0..frames {
                scratch.ins[0][i] = f32::from(input[i * 2]) / 32768.0;
                scratch.ins[1][i] = f32::from(input[i * 2 + 1]) / 32768.0;
            }
        }
        _ => {
            scratch.ins[0][..frames].fill(0.0);
            scratch.ins[1][..frames].fill(0.0);
        }
    }
    scratch.outs[0][..frames].fill(0.0);
    scratch.outs[1][..frames].fill(0.0);

    let mut in_ptrs = [scratch.ins[0].as_mut_ptr(), scratch.ins[1].as_mut_ptr()];
    let mut out_ptrs = [scratch.outs[0].as_mut_ptr(), scratch.outs[1].as_mut_ptr()];

    let audio_in = clap_audio_buffer {
        data32: in_ptrs.as_mut_ptr(),
        data64: ptr::null_mut(),
        channel_count: 2,
        latency: 0,
        constant_mask: 0,
    };
    let mut audio_out = clap_audio_buffer {
        data32: out_ptrs.as_mut_ptr(),
        data64: ptr::null_mut(),
        channel_count: 2,
        latency: 0,
        constant_mask: 0,
    };

    let in_events = InputEventList::new(events);
    let out_events = OutputEventList::new();

    let process = clap_process {
        steady_time: -1,
        frames_count: frames as u32,
        transport: ptr::null(),
        audio_inputs: &audio_in,
        audio_outputs: &mut audio_out,
        audio_inputs_count: if has_audio_in { 1 } else { 0 },
        audio_outputs_count: 1,
        in_events: in_events.as_ptr(),
        out_events: out_events.as_ptr(),
    };

    let process_fn = (*plugin).process.ok_or(HostError::ProcessError)?;
    let status = process_fn(plugin, &process);
    if status == CLAP_PROCESS_ERROR {
        return Err(HostError::ProcessError);
    }

    for i in 0..frames {
        output[i * 2] = clip_to_i16(scratch.outs[0][i]);
        output[i * 2 + 1] = clip_to_i16(scratch.outs[1][i]);
    }

    Ok(())
}

#[inline]
fn clip_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * 32767.0).round() as i16
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{enqueue_midi, ClapEvent, ParamChange, MIDI_QUEUE_TEST_LOCK};
    use clap_sys::events::{clap_event_param_value, CLAP_EVENT_PARAM_VALUE};
    use clap_sys::ext::params::{clap_param_info, clap_plugin_params, CLAP_EXT_PARAMS};
    use clap_sys::id::clap_id;
    use clap_sys::plugin::clap_plugin_descriptor;
    use clap_sys::process::{clap_process_status, CLAP_PROCESS_CONTINUE};
    use smallvec::SmallVec;
    use std::ffi::CStr;
    use std::os::raw::{c_char, c_void};

    // In-process plugin stand-ins: a real clap_plugin vtable without a
    // dynamic library behind it.

    fn stub_plugin(
        process: unsafe extern "C" fn(*const clap_plugin, *const clap_process) -> clap_process_status,
        plugin_data: *mut c_void,
        get_extension: Option<
            unsafe extern "C" fn(*const clap_plugin, *const c_char) -> *const c_void,
        >,
    ) -> clap_plugin {
        clap_plugin {
            desc: ptr::null::<clap_plugin_descriptor>(),
            plugin_data,
            init: None,
            destroy: None,
            activate: None,
            deactivate: None,
            start_processing: None,
            stop_processing: None,
            reset: None,
            process: Some(process),
            get_extension,
            on_main_thread: None,
        }
    }

    unsafe extern "C" fn silent_process(
        _plugin: *const clap_plugin,
        _process: *const clap_process,
    ) -> clap_process_status {
        // Output buffers arrive zeroed; leave them that way.
        CLAP_PROCESS_CONTINUE
    }

    unsafe extern "C" fn passthrough_process(
        _plugin: *const clap_plugin,
        process: *const clap_process,
    ) -> clap_process_status {
        let p = &*process;
        let inputs = &*p.audio_inputs;
        let outputs = &*p.audio_outputs;
        for c in 0..2 {
            let src = *inputs.data32.add(c);
            let dst = *outputs.data32.add(c);
            ptr::copy_nonoverlapping(src, dst, p.frames_count as usize);
        }
        CLAP_PROCESS_CONTINUE
    }

    unsafe extern "C" fn loud_process(
        _plugin: *const clap_plugin,
        process: *const clap_process,
    ) -> clap_process_status {
        let p = &*process;
        let outputs = &*p.audio_outputs;
        for i in 0..p.frames_count as usize {
            *(*outputs.data32.add(0)).add(i) = 2.0;
            *(*outputs.data32.add(1)).add(i) = -2.0;
        }
        CLAP_PROCESS_CONTINUE
    }

    unsafe extern "C" fn failing_process(
        _plugin: *const clap_plugin,
        _process: *const clap_process,
    ) -> clap_process_status {
        CLAP_PROCESS_ERROR
    }

    unsafe extern "C" fn event_count_process(
        _plugin: *const clap_plugin,
        process: *const clap_process,
    ) -> clap_process_status {
        let p = &*process;
        let in_events = &*p.in_events;
        let n = (in_events.size.unwrap())(p.in_events);
        let outputs = &*p.audio_outputs;
        **outputs.data32.add(0) = n as f32 / 128.0;
        CLAP_PROCESS_CONTINUE
    }

    fn run(
        plugin: &clap_plugin,
        events: EventBatch,
        input: Option<&[i16]>,
        frames: usize,
        has_audio_in: bool,
        has_audio_out: bool,
    ) -> (Result<()>, Vec<i16>) {
        let mut scratch = Scratch::default();
        let mut output = vec![0x55i16; frames * 2];
        let result = unsafe {
            process_raw(
                plugin,
                &mut scratch,
                events,
                input,
                &mut output,
                frames,
                has_audio_in,
                has_audio_out,
            )
        };
        (result, output)
    }

    #[test]
    fn test_silent_plugin_produces_zero_block() {
        let plugin = stub_plugin(silent_process, ptr::null_mut(), None);
        let (result, output) = run(&plugin, SmallVec::new(), None, 128, false, true);
        result.unwrap();
        assert!(output.iter().all(|&s| s == 0));
    }

    #[test]
    fn test_passthrough_round_trip_is_within_one() {
        let plugin = stub_plugin(passthrough_process, ptr::null_mut(), None);
        let frames = 64;
        let input: Vec<i16> = (0..frames * 2)
            .map(|i| ((i as i32 * 517 - 32000) % 32767) as i16)
            .collect();
        let (result, output) = run(&plugin, SmallVec::new(), Some(&input), frames, true, true);
        result.unwrap();
        for (a, b) in input.iter().zip(&output) {
            assert!((i32::from(*a) - i32::from(*b)).abs() <= 1, "{a} vs {b}");
        }
    }

    #[test]
    fn test_half_scale_survives_round_trip_exactly() {
        // 16384/32768 is exactly 0.5 in f32; 0.5 * 32767 rounds back to 16384.
        let plugin = stub_plugin(passthrough_process, ptr::null_mut(), None);
        let input = vec![16384i16; 16];
        let (result, output) = run(&plugin, SmallVec::new(), Some(&input), 8, true, true);
        result.unwrap();
        assert_eq!(output, input);
    }

    #[test]
    fn test_out_of_range_samples_clip_hard() {
        let plugin = stub_plugin(loud_process, ptr::null_mut(), None);
        let (result, output) = run(&plugin, SmallVec::new(), None, 32, false, true);
        result.unwrap();
        for frame in output.chunks(2) {
            assert_eq!(frame[0], 32767);
            assert_eq!(frame[1], -32767);
        }
    }

    #[test]
    fn test_process_error_leaves_output_untouched() {
        let plugin = stub_plugin(failing_process, ptr::null_mut(), None);
        let (result, output) = run(&plugin, SmallVec::new(), None, 16, false, true);
        assert!(matches!(result, Err(HostError::ProcessError)));
        assert!(output.iter().all(|&s| s == 0x55));
    }

    #[test]
    fn test_no_audio_out_zero_fills_without_calling_plugin() {
        let plugin = stub_plugin(failing_process, ptr::null_mut(), None);
        let (result, output) = run(&plugin, SmallVec::new(), None, 16, false, false);
        result.unwrap();
        assert!(output.iter().all(|&s| s == 0));
    }

    #[test]
    fn test_events_reach_the_plugin() {
        let _guard = MIDI_QUEUE_TEST_LOCK.lock();
        crate::events::drain_midi_queue_for_test();

        enqueue_midi(&[0x90, 60, 100]);
        enqueue_midi(&[0x80, 60, 0]);
        let mut params = vec![ParamChange {
            param_id: 0,
            value: 1.0,
        }];
        let events = drain_events(&mut params);
        assert_eq!(events.len(), 3);

        let plugin = stub_plugin(event_count_process, ptr::null_mut(), None);
        let (result, output) = run(&plugin, events, None, 8, false, true);
        result.unwrap();
        // 3 events / 128 scaled back out through the int16 conversion.
        let expected = (3.0f32 / 128.0 * 32767.0).round() as i16;
        assert_eq!(output[0], expected);
    }

    // Stateful synth with three parameters, the shape effect chains query:
    // Cutoff 20..20000 (default 1000), Resonance 0..1, Volume 0..1 (0.8).
    // PARAM_VALUE events in process update the state.

    struct ParamState {
        values: [f64; 3],
    }

    const PARAM_DEFAULTS: [f64; 3] = [1000.0, 0.0, 0.8];

    unsafe extern "C" fn params_count(_plugin: *const clap_plugin) -> u32 {
        3
    }

    unsafe extern "C" fn params_get_info(
        _plugin: *const clap_plugin,
        index: u32,
        info: *mut clap_param_info,
    ) -> bool {
        if index >= 3 {
            return false;
        }
        let info = &mut *info;
        *info = std::mem::zeroed();
        info.id = index;
        let (name, min, max) = match index {
            0 => (&b"Cutoff\0"[..], 20.0, 20000.0),
            1 => (&b"Resonance\0"[..], 0.0, 1.0),
            _ => (&b"Volume\0"[..], 0.0, 1.0),
        };
        for (dst, src) in info.name.iter_mut().zip(name) {
            *dst = *src as c_char;
        }
        info.min_value = min;
        info.max_value = max;
        info.default_value = PARAM_DEFAULTS[index as usize];
        true
    }

    unsafe extern "C" fn params_get_value(
        plugin: *const clap_plugin,
        param_id: clap_id,
        value: *mut f64,
    ) -> bool {
        if param_id >= 3 {
            return false;
        }
        let state = &*((*plugin).plugin_data as *const ParamState);
        *value = state.values[param_id as usize];
        true
    }

    static PARAMS_EXT: clap_plugin_params = clap_plugin_params {
        count: Some(params_count),
        get_info: Some(params_get_info),
        get_value: Some(params_get_value),
        value_to_text: None,
        text_to_value: None,
        flush: None,
    };

    unsafe extern "C" fn param_get_extension(
        _plugin: *const clap_plugin,
        id: *const c_char,
    ) -> *const c_void {
        if CStr::from_ptr(id) == CLAP_EXT_PARAMS {
            &PARAMS_EXT as *const _ as *const c_void
        } else {
            ptr::null()
        }
    }

    unsafe extern "C" fn param_process(
        plugin: *const clap_plugin,
        process: *const clap_process,
    ) -> clap_process_status {
        let p = &*process;
        let state = &mut *((*plugin).plugin_data as *mut ParamState);
        let in_events = &*p.in_events;
        let n = (in_events.size.unwrap())(p.in_events);
        for i in 0..n {
            let header = (in_events.get.unwrap())(p.in_events, i);
            if (*header).type_ == CLAP_EVENT_PARAM_VALUE {
                let event = &*(header as *const clap_event_param_value);
                if (event.param_id as usize) < 3 {
                    state.values[event.param_id as usize] = event.value;
                }
            }
        }
        CLAP_PROCESS_CONTINUE
    }

    #[test]
    fn test_param_value_events_update_plugin_state() {
        let mut state = ParamState {
            values: PARAM_DEFAULTS,
        };
        let plugin = stub_plugin(
            param_process,
            &mut state as *mut ParamState as *mut c_void,
            Some(param_get_extension),
        );

        let mut params = vec![ParamChange {
            param_id: 0,
            value: 500.0,
        }];
        let events = drain_events_params_only(&mut params);
        let (result, _) = run(&plugin, events, None, 8, false, true);
        result.unwrap();
        assert_eq!(state.values[0], 500.0);
        assert_eq!(state.values[2], 0.8);
    }

    #[test]
    fn test_param_proxy_against_stub() {
        let mut state = ParamState {
            values: PARAM_DEFAULTS,
        };
        let plugin = stub_plugin(
            param_process,
            &mut state as *mut ParamState as *mut c_void,
            Some(param_get_extension),
        );
        let plugin_ptr = &plugin as *const clap_plugin;

        unsafe {
            assert_eq!(crate::params::param_count_raw(plugin_ptr), 3);
            let info = crate::params::param_info_raw(plugin_ptr, 0).unwrap();
            assert_eq!(info.name, "Cutoff");
            assert_eq!(info.min, 20.0);
            assert_eq!(info.max, 20000.0);
            assert_eq!(info.default, 1000.0);
            assert_eq!(crate::params::param_get_raw(plugin_ptr, 2), 0.8);
            assert!(crate::params::param_info_raw(plugin_ptr, 3).is_none());
            assert_eq!(crate::params::param_get_raw(plugin_ptr, 9), 0.0);
        }
    }

    /// Drain only the parameter queue, leaving the shared MIDI queue alone
    /// so these tests do not race the MIDI ones.
    fn drain_events_params_only(params: &mut Vec<ParamChange>) -> EventBatch {
        let mut batch = EventBatch::new();
        let _guard = MIDI_QUEUE_TEST_LOCK.lock();
        crate::events::drain_midi_queue_for_test();
        batch.extend(drain_events(params));
        batch.retain(|e| matches!(*e, ClapEvent::Param(_)));
        batch
    }

    #[test]
    fn test_clip_to_i16() {
        assert_eq!(clip_to_i16(0.0), 0);
        assert_eq!(clip_to_i16(1.0), 32767);
        assert_eq!(clip_to_i16(-1.0), -32767);
        assert_eq!(clip_to_i16(1.5), 32767);
        assert_eq!(clip_to_i16(-3.0), -32767);
        assert_eq!(clip_to_i16(0.5), 16384);
    }
}
