//! Control-sequence codec.
//!
//! Between nodes, MIDI travels as a sequence pod: a sized header followed
//! by controls, each tagged with a cycle offset and a control type. Only
//! `CONTROL_MIDI` controls map to legacy MIDI events; anything else is
//! carried but ignored on conversion.
//!
//! Sequence layout, all fields native-endian u32:
//!
//! ```text
//! magic  body_size  { offset  type  size  data[size] pad4 }*
//! ```

use crate::buffer::MidiBufferRef;
use smallvec::SmallVec;
use tracing::trace;

pub const SEQ_MAGIC: u32 = 0x5351_3153; // "SQ1S"
pub const CONTROL_PROPERTIES: u32 = 1;
pub const CONTROL_MIDI: u32 = 2;
pub const CONTROL_OSC: u32 = 3;

const SEQ_HEADER: usize = 8;
const CONTROL_HEADER: usize = 12;

#[inline]
fn pad4(n: usize) -> usize {
    (n + 3) & !3
}

#[inline]
fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_ne_bytes(buf[off..off + 4].try_into().unwrap())
}

#[inline]
fn set_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_ne_bytes());
}

/// One control inside a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRef<'a> {
    pub offset: u32,
    pub ctype: u32,
    pub data: &'a [u8],
}

/// Incremental sequence writer over a caller-provided region.
pub struct SeqBuilder<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> SeqBuilder<'a> {
    /// Start a sequence. `None` when the region cannot even hold the header.
    pub fn new(buf: &'a mut [u8]) -> Option<SeqBuilder<'a>> {
        if buf.len() < SEQ_HEADER {
            return None;
        }
        set_u32(buf, 0, SEQ_MAGIC);
        set_u32(buf, 4, 0);
        Some(SeqBuilder { buf, pos: SEQ_HEADER })
    }

    /// Append one control; false when it does not fit.
    pub fn add_control(&mut self, offset: u32, ctype: u32, data: &[u8]) -> bool {
        let need = CONTROL_HEADER + pad4(data.len());
        if self.pos + need > self.buf.len() {
            trace!(offset, size = data.len(), "control dropped, sequence full");
            return false;
        }
        set_u32(self.buf, self.pos, offset);
        set_u32(self.buf, self.pos + 4, ctype);
        set_u32(self.buf, self.pos + 8, data.len() as u32);
        let body = self.pos + CONTROL_HEADER;
        self.buf[body..body + data.len()].copy_from_slice(data);
        for b in &mut self.buf[body + data.len()..body + pad4(data.len())] {
            *b = 0;
        }
        self.pos += need;
        true
    }

    /// Seal the sequence and return its total size in bytes.
    pub fn finish(self) -> usize {
        set_u32(self.buf, 4, (self.pos - SEQ_HEADER) as u32);
        self.pos
    }
}

/// Read-only cursor over a serialized sequence.
#[derive(Debug, Clone, Copy)]
pub struct SeqReader<'a> {
    body: &'a [u8],
}

impl<'a> SeqReader<'a> {
    /// Validate the header and wrap the body. `None` on anything that is
    /// not a well-formed sequence.
    pub fn from_bytes(buf: &'a [u8]) -> Option<SeqReader<'a>> {
        if buf.len() < SEQ_HEADER || get_u32(buf, 0) != SEQ_MAGIC {
            return None;
        }
        let size = get_u32(buf, 4) as usize;
        if SEQ_HEADER + size > buf.len() {
            return None;
        }
        Some(SeqReader {
            body: &buf[SEQ_HEADER..SEQ_HEADER + size],
        })
    }

    pub fn iter(&self) -> ControlIter<'a> {
        ControlIter {
            body: self.body,
            pos: 0,
        }
    }
}

pub struct ControlIter<'a> {
    body: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for ControlIter<'a> {
    type Item = ControlRef<'a>;

    fn next(&mut self) -> Option<ControlRef<'a>> {
        if self.pos + CONTROL_HEADER > self.body.len() {
            return None;
        }
        let offset = get_u32(self.body, self.pos);
        let ctype = get_u32(self.body, self.pos + 4);
        let size = get_u32(self.body, self.pos + 8) as usize;
        let body = self.pos + CONTROL_HEADER;
        if body + size > self.body.len() {
            return None;
        }
        self.pos = body + pad4(size);
        Some(ControlRef {
            offset,
            ctype,
            data: &self.body[body..body + size],
        })
    }
}

/// Serialize a MIDI port buffer into a sequence pod. Returns the number of
/// bytes written into `dst`.
pub fn convert_from_midi(midi: &MidiBufferRef<'_>, dst: &mut [u8]) -> usize {
    let Some(mut builder) = SeqBuilder::new(dst) else {
        return 0;
    };
    for i in 0..midi.event_count() {
        let Some(ev) = midi.event_get(i) else { break };
        builder.add_control(ev.time, CONTROL_MIDI, ev.data);
    }
    builder.finish()
}

/// Merge `seqs` into `midi` in time order.
///
/// The inputs are each already offset-ordered; an n-way merge interleaves
/// them, breaking ties by input index. Non-MIDI controls are skipped.
pub fn convert_to_midi(seqs: &[SeqReader<'_>], midi: &mut MidiBufferRef<'_>) {
    let mut cursors: SmallVec<[ControlIter<'_>; 16]> = seqs.iter().map(|s| s.iter()).collect();
    let mut heads: SmallVec<[Option<ControlRef<'_>>; 16]> =
        cursors.iter_mut().map(|c| c.next()).collect();

    loop {
        let mut next: Option<(usize, ControlRef<'_>)> = None;
        for (i, head) in heads.iter().enumerate() {
            if let Some(c) = head {
                match next {
                    Some((_, best)) if best.offset <= c.offset => {}
                    _ => next = Some((i, *c)),
                }
            }
        }
        let Some((index, control)) = next else { break };

        if control.ctype == CONTROL_MIDI {
            let _ = midi.event_write(control.offset, control.data);
        }
        heads[index] = cursors[index].next();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq_of<'a>(buf: &'a mut [u8], controls: &[(u32, &[u8])]) -> SeqReader<'a> {
        let len = {
            let mut b = SeqBuilder::new(&mut buf[..]).unwrap();
            for (off, data) in controls {
                assert!(b.add_control(*off, CONTROL_MIDI, data));
            }
            b.finish()
        };
        SeqReader::from_bytes(&buf[..len]).unwrap()
    }

    #[test]
    fn test_builder_reader_roundtrip() {
        let mut buf = [0u8; 256];
        let seq = seq_of(&mut buf, &[(0, &[0x90, 60, 100]), (16, &[0x80, 60, 0])]);
        let controls: Vec<_> = seq.iter().collect();
        assert_eq!(controls.len(), 2);
        assert_eq!(controls[0].offset, 0);
        assert_eq!(controls[0].data, &[0x90, 60, 100]);
        assert_eq!(controls[1].offset, 16);
        assert_eq!(controls[1].ctype, CONTROL_MIDI);
    }

    #[test]
    fn test_reader_rejects_garbage() {
        assert!(SeqReader::from_bytes(&[0u8; 4]).is_none());
        assert!(SeqReader::from_bytes(&[0xffu8; 32]).is_none());
    }

    #[test]
    fn test_builder_full() {
        let mut buf = [0u8; 24];
        let mut b = SeqBuilder::new(&mut buf).unwrap();
        assert!(b.add_control(0, CONTROL_MIDI, &[1, 2, 3]));
        assert!(!b.add_control(1, CONTROL_MIDI, &[4, 5, 6]));
    }

    #[test]
    fn test_midi_roundtrip() {
        let mut mem = vec![0u8; 1024];
        let mut mb = MidiBufferRef::init(&mut mem, 256);
        mb.event_write(0, &[0x90, 60, 100]).unwrap();
        mb.event_write(3, &[0xb0, 7, 64]).unwrap();
        let sysex: Vec<u8> = vec![0xf0, 1, 2, 3, 4, 5, 6, 0xf7];
        mb.event_write(9, &sysex).unwrap();

        let mut pod = vec![0u8; 1024];
        let len = convert_from_midi(&mb, &mut pod);
        assert!(len > 0);
        let seq = SeqReader::from_bytes(&pod[..len]).unwrap();

        let mut out_mem = vec![0u8; 1024];
        let mut out = MidiBufferRef::init(&mut out_mem, 256);
        convert_to_midi(&[seq], &mut out);

        assert_eq!(out.event_count(), 3);
        for i in 0..3 {
            let a = mb.event_get(i).unwrap();
            let b = out.event_get(i).unwrap();
            assert_eq!(a.time, b.time);
            assert_eq!(a.data, b.data);
        }
    }

    #[test]
    fn test_merge_orders_by_offset_with_index_ties() {
        let mut b0 = [0u8; 128];
        let mut b1 = [0u8; 128];
        let s0 = seq_of(&mut b0, &[(0, &[1]), (10, &[2])]);
        let s1 = seq_of(&mut b1, &[(0, &[3]), (5, &[4])]);

        let mut mem = vec![0u8; 512];
        let mut mb = MidiBufferRef::init(&mut mem, 64);
        convert_to_midi(&[s0, s1], &mut mb);

        let order: Vec<(u32, u8)> = (0..mb.event_count())
            .map(|i| {
                let ev = mb.event_get(i).unwrap();
                (ev.time, ev.data[0])
            })
            .collect();
        // tie at offset 0 resolved in input order
        assert_eq!(order, vec![(0, 1), (0, 3), (5, 4), (10, 2)]);
    }

    #[test]
    fn test_merge_skips_non_midi() {
        let mut buf = [0u8; 128];
        let len = {
            let mut b = SeqBuilder::new(&mut buf).unwrap();
            b.add_control(0, CONTROL_PROPERTIES, &[9, 9]);
            b.add_control(1, CONTROL_MIDI, &[0x90, 1, 1]);
            b.finish()
        };
        let seq = SeqReader::from_bytes(&buf[..len]).unwrap();

        let mut mem = vec![0u8; 256];
        let mut mb = MidiBufferRef::init(&mut mem, 64);
        convert_to_midi(&[seq], &mut mb);
        assert_eq!(mb.event_count(), 1);
        assert_eq!(mb.event_get(0).unwrap().data, &[0x90, 1, 1]);
    }
}
