//! Legacy MIDI port-buffer layout.
//!
//! A MIDI port buffer is a fixed-size byte region (the port's scratch
//! buffer) with a small header, an array of event records growing upward
//! from the header, and payload bytes for large events growing downward
//! from the high end. Events must be reserved in non-decreasing time order;
//! violations are counted in `lost_events` and rejected.
//!
//! ```text
//! | header | ev0 | ev1 | ...  ->      gap      <- ... |payload1|payload0| |
//! ```
//!
//! Payloads of up to [`MIDI_INLINE_MAX`] bytes are stored inline in the
//! event record itself.

use tracing::warn;

pub const MIDI_BUFFER_MAGIC: u32 = 0x900d_f00d;
pub const MIDI_INLINE_MAX: usize = 4;

const HEADER_SIZE: usize = 24;
const EVENT_SIZE: usize = 8;

// Header field byte offsets.
const H_MAGIC: usize = 0;
const H_BUFFER_SIZE: usize = 4;
const H_NFRAMES: usize = 8;
const H_WRITE_POS: usize = 12;
const H_EVENT_COUNT: usize = 16;
const H_LOST_EVENTS: usize = 20;

#[inline]
fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_ne_bytes(buf[off..off + 4].try_into().unwrap())
}

#[inline]
fn set_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_ne_bytes());
}

#[inline]
fn get_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_ne_bytes(buf[off..off + 2].try_into().unwrap())
}

#[inline]
fn set_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_ne_bytes());
}

/// One decoded event: a time offset within the cycle and the raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidiEvent<'a> {
    pub time: u32,
    pub data: &'a [u8],
}

/// Mutable view over a MIDI port buffer region.
pub struct MidiBufferRef<'a> {
    buf: &'a mut [u8],
}

impl<'a> MidiBufferRef<'a> {
    /// Initialize a region as an empty MIDI buffer covering `nframes`.
    pub fn init(buf: &'a mut [u8], nframes: u32) -> MidiBufferRef<'a> {
        debug_assert!(buf.len() >= HEADER_SIZE + EVENT_SIZE);
        let size = buf.len() as u32;
        set_u32(buf, H_MAGIC, MIDI_BUFFER_MAGIC);
        set_u32(buf, H_BUFFER_SIZE, size);
        set_u32(buf, H_NFRAMES, nframes);
        set_u32(buf, H_WRITE_POS, 0);
        set_u32(buf, H_EVENT_COUNT, 0);
        set_u32(buf, H_LOST_EVENTS, 0);
        MidiBufferRef { buf }
    }

    /// View an already-initialized buffer.
    pub fn from_raw(buf: &'a mut [u8]) -> MidiBufferRef<'a> {
        MidiBufferRef { buf }
    }

    pub fn is_valid(&self) -> bool {
        self.buf.len() >= HEADER_SIZE && get_u32(self.buf, H_MAGIC) == MIDI_BUFFER_MAGIC
    }

    #[inline]
    pub fn buffer_size(&self) -> usize {
        get_u32(self.buf, H_BUFFER_SIZE) as usize
    }

    #[inline]
    pub fn nframes(&self) -> u32 {
        get_u32(self.buf, H_NFRAMES)
    }

    #[inline]
    pub fn event_count(&self) -> u32 {
        get_u32(self.buf, H_EVENT_COUNT)
    }

    #[inline]
    pub fn lost_event_count(&self) -> u32 {
        get_u32(self.buf, H_LOST_EVENTS)
    }

    #[inline]
    fn write_pos(&self) -> usize {
        get_u32(self.buf, H_WRITE_POS) as usize
    }

    /// Drop all events and reclaim the payload space.
    pub fn clear(&mut self) {
        set_u32(self.buf, H_EVENT_COUNT, 0);
        set_u32(self.buf, H_WRITE_POS, 0);
        set_u32(self.buf, H_LOST_EVENTS, 0);
    }

    /// Identical to [`clear`](Self::clear); kept for API parity.
    pub fn reset(&mut self) {
        self.clear();
    }

    fn event_record(&self, index: u32) -> usize {
        HEADER_SIZE + index as usize * EVENT_SIZE
    }

    /// Fetch event `index`, `None` past the end.
    pub fn event_get(&self, index: u32) -> Option<MidiEvent<'_>> {
        if index >= self.event_count() {
            return None;
        }
        let rec = self.event_record(index);
        let time = get_u16(self.buf, rec) as u32;
        let size = get_u16(self.buf, rec + 2) as usize;
        let data = if size <= MIDI_INLINE_MAX {
            &self.buf[rec + 4..rec + 4 + size]
        } else {
            let off = get_u32(self.buf, rec + 4) as usize;
            &self.buf[off..off + size]
        };
        Some(MidiEvent { time, data })
    }

    /// Largest event payload that can still be reserved.
    ///
    /// The extra event record accounts for the slot the next reservation
    /// will consume; an inline-sized payload always fits once the record
    /// itself does.
    pub fn max_event_size(&self) -> usize {
        let buffer_size = self.buffer_size();
        let used =
            HEADER_SIZE + self.write_pos() + (self.event_count() as usize + 1) * EVENT_SIZE;
        if used > buffer_size {
            0
        } else if buffer_size - used < MIDI_INLINE_MAX {
            MIDI_INLINE_MAX
        } else {
            buffer_size - used
        }
    }

    /// Reserve space for an event at `time` and return the payload slice.
    ///
    /// Fails (returning `None` and counting a lost event) when the time is
    /// out of range or decreasing, the size is zero, or the buffer is full.
    pub fn event_reserve(&mut self, time: u32, size: usize) -> Option<&mut [u8]> {
        let count = self.event_count();

        if time >= self.nframes() {
            warn!(time, nframes = self.nframes(), "midi event time out of range");
            return self.lose();
        }
        if count > 0 {
            let last = get_u16(self.buf, self.event_record(count - 1)) as u32;
            if time < last {
                warn!(time, last, "midi event time not monotonic");
                return self.lose();
            }
        }
        if size == 0 {
            warn!("midi event with empty payload");
            return self.lose();
        }
        if self.max_event_size() < size {
            warn!(size, "midi event too large for buffer");
            return self.lose();
        }

        let rec = self.event_record(count);
        set_u16(self.buf, rec, time as u16);
        set_u16(self.buf, rec + 2, size as u16);

        let payload = if size <= MIDI_INLINE_MAX {
            rec + 4
        } else {
            let write_pos = self.write_pos() + size;
            set_u32(self.buf, H_WRITE_POS, write_pos as u32);
            let off = self.buffer_size() - 1 - write_pos;
            set_u32(self.buf, rec + 4, off as u32);
            off
        };
        set_u32(self.buf, H_EVENT_COUNT, count + 1);
        Some(&mut self.buf[payload..payload + size])
    }

    /// Reserve and fill in one step.
    pub fn event_write(&mut self, time: u32, data: &[u8]) -> Result<(), ()> {
        match self.event_reserve(time, data.len()) {
            Some(dst) => {
                dst.copy_from_slice(data);
                Ok(())
            }
            None => Err(()),
        }
    }

    fn lose(&mut self) -> Option<&mut [u8]> {
        let lost = self.lost_event_count() + 1;
        set_u32(self.buf, H_LOST_EVENTS, lost);
        None
    }
}
