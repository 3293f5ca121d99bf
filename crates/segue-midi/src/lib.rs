//! MIDI support for the segue client.
//!
//! Two halves: the legacy in-place port-buffer format applications read and
//! write through the MIDI API ([`buffer`]), and the control-sequence format
//! MIDI travels in between graph nodes ([`codec`]), with conversion in both
//! directions.

pub mod buffer;
pub mod codec;

pub use buffer::{MidiBufferRef, MidiEvent, MIDI_BUFFER_MAGIC, MIDI_INLINE_MAX};
pub use codec::{convert_from_midi, convert_to_midi, ControlRef, SeqBuilder, SeqReader, CONTROL_MIDI};
