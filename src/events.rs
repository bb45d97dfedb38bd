//! Event queues and CLAP event list marshalling.
//!
//! MIDI is one process-wide stream: the outer chain multiplexes every
//! device onto a single bus and pushes raw 3-byte packets from whichever
//! thread its router runs on. The queue is a bounded lock-free ring; a full
//! queue drops the packet rather than block the audio thread. Parameter
//! changes are per-instance and live on the instance itself.
//!
//! Each block, both queues drain into a CLAP input event list: note events
//! first, then parameter values, all stamped at frame 0.

use clap_sys::events::{
    clap_event_header, clap_event_note, clap_event_param_value, clap_input_events,
    clap_output_events, CLAP_CORE_EVENT_SPACE_ID, CLAP_EVENT_NOTE_OFF, CLAP_EVENT_NOTE_ON,
    CLAP_EVENT_PARAM_VALUE,
};
use clap_sys::id::clap_id;
use crossbeam::queue::ArrayQueue;
use smallvec::SmallVec;
use std::ptr;
use std::sync::OnceLock;

/// Capacity of the process-wide MIDI queue.
pub const MAX_MIDI_EVENTS: usize = 256;

/// Capacity of each instance's pending parameter-write queue.
pub const MAX_PARAM_EVENTS: usize = 32;

/// A raw MIDI packet as received from the outer chain.
#[derive(Clone, Copy, Debug)]
pub struct MidiMessage {
    pub data: [u8; 3],
    pub len: u8,
}

/// A pending parameter write, already resolved to a CLAP param id.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ParamChange {
    pub param_id: clap_id,
    pub value: f64,
}

fn midi_queue() -> &'static ArrayQueue<MidiMessage> {
    static QUEUE: OnceLock<ArrayQueue<MidiMessage>> = OnceLock::new();
    QUEUE.get_or_init(|| ArrayQueue::new(MAX_MIDI_EVENTS))
}

/// Queue a raw MIDI packet for the next process call.
///
/// Accepts 1 to 3 bytes; anything else is ignored. A full queue drops the
/// packet silently -- losing an event is preferable to blocking the audio
/// thread.
pub fn enqueue_midi(msg: &[u8]) {
    if msg.is_empty() || msg.len() > 3 {
        return;
    }
    let mut packet = MidiMessage {
        data: [0; 3],
        len: msg.len() as u8,
    };
    packet.data[..msg.len()].copy_from_slice(msg);
    let _ = midi_queue().push(packet);
}

/// Events drained for one block.
pub(crate) type EventBatch = SmallVec<[ClapEvent; 16]>;

#[derive(Clone, Copy)]
pub(crate) enum ClapEvent {
    Note(clap_event_note),
    Param(clap_event_param_value),
}

impl ClapEvent {
    fn header(&self) -> &clap_event_header {
        match self {
            ClapEvent::Note(e) => &e.header,
            ClapEvent::Param(e) => &e.header,
        }
    }
}

/// Translate one raw packet into a CLAP note event.
///
/// Note-on with velocity zero counts as a note-off. Anything
/// that is not a note message is dropped here; this host does not forward
/// CC or pitch-bend.
fn midi_to_event(msg: &MidiMessage) -> Option<ClapEvent> {
    if msg.len < 3 {
        return None;
    }
    let status = msg.data[0];
    let key = msg.data[1];
    let velocity = msg.data[2];
    let type_ = match status & 0xF0 {
        0x90 if velocity > 0 => CLAP_EVENT_NOTE_ON,
        0x90 | 0x80 => CLAP_EVENT_NOTE_OFF,
        _ => return None,
    };
    Some(ClapEvent::Note(clap_event_note {
        header: clap_event_header {
            size: std::mem::size_of::<clap_event_note>() as u32,
            time: 0,
            space_id: CLAP_CORE_EVENT_SPACE_ID,
            type_,
            flags: 0,
        },
        note_id: -1,
        port_index: 0,
        channel: (status & 0x0F) as i16,
        key: key as i16,
        velocity: f64::from(velocity) / 127.0,
    }))
}

fn param_to_event(change: ParamChange) -> ClapEvent {
    ClapEvent::Param(clap_event_param_value {
        header: clap_event_header {
            size: std::mem::size_of::<clap_event_param_value>() as u32,
            time: 0,
            space_id: CLAP_CORE_EVENT_SPACE_ID,
            type_: CLAP_EVENT_PARAM_VALUE,
            flags: 0,
        },
        param_id: change.param_id,
        cookie: ptr::null_mut(),
        note_id: -1,
        port_index: -1,
        channel: -1,
        key: -1,
        value: change.value,
    })
}

/// Drain the process-wide MIDI queue and the given parameter queue into an
/// event batch for one block. Notes come first, then parameter values.
/// Both queues are empty afterwards.
pub(crate) fn drain_events(param_queue: &mut Vec<ParamChange>) -> EventBatch {
    let mut batch = EventBatch::new();
    while let Some(packet) = midi_queue().pop() {
        if let Some(event) = midi_to_event(&packet) {
            batch.push(event);
        }
    }
    for change in param_queue.drain(..) {
        batch.push(param_to_event(change));
    }
    batch
}

/// Owned CLAP input event list for a single process call.
///
/// The `clap_input_events` vtable must be the first field: plugins hand the
/// list pointer back to the callbacks, which recover the full struct from
/// it.
#[repr(C)]
pub(crate) struct InputEventList {
    list: clap_input_events,
    events: EventBatch,
}

impl InputEventList {
    pub(crate) fn new(events: EventBatch) -> Self {
        Self {
            list: clap_input_events {
                ctx: ptr::null_mut(),
                size: Some(input_events_size),
                get: Some(input_events_get),
            },
            events,
        }
    }

    pub(crate) fn as_ptr(&self) -> *const clap_input_events {
        &self.list
    }
}

unsafe extern "C" fn input_events_size(list: *const clap_input_events) -> u32 {
    let list = &*(list as *const InputEventList);
    list.events.len() as u32
}

unsafe extern "C" fn input_events_get(
    list: *const clap_input_events,
    index: u32,
) -> *const clap_event_header {
    let list = &*(list as *const InputEventList);
    match list.events.get(index as usize) {
        Some(event) => event.header(),
        None => ptr::null(),
    }
}

/// Output event sink. This host does not consume plugin output events;
/// `try_push` accepts and discards everything.
#[repr(C)]
pub(crate) struct OutputEventList {
    list: clap_output_events,
}

impl OutputEventList {
    pub(crate) fn new() -> Self {
        Self {
            list: clap_output_events {
                ctx: ptr::null_mut(),
                try_push: Some(output_events_try_push),
            },
        }
    }

    pub(crate) fn as_ptr(&self) -> *const clap_output_events {
        &self.list
    }
}

unsafe extern "C" fn output_events_try_push(
    _list: *const clap_output_events,
    _event: *const clap_event_header,
) -> bool {
    true
}

#[cfg(test)]
pub(crate) fn drain_midi_queue_for_test() {
    while midi_queue().pop().is_some() {}
}

#[cfg(test)]
pub(crate) static MIDI_QUEUE_TEST_LOCK: parking_lot::Mutex<()> = parking_lot::Mutex::new(());
