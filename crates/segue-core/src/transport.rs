//! Transport state and position mapping.
//!
//! The server publishes a segmented position model (clock + segments with
//! optional bar info); the legacy API wants a rolling/stopped/looping state
//! and a flat position struct. The decode direction runs every cycle on the
//! realtime thread; the encode direction runs only for the elected timebase
//! owner.

use crate::activation::{
    position_state, PositionBlock, SegmentBar, NSEC_PER_USEC, SEGMENT_BAR_FLAG_VALID,
    SEGMENT_FLAG_LOOPING,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportState {
    #[default]
    Stopped,
    Starting,
    Rolling,
    Looping,
}

/// Validity bits in [`TransportPosition::valid`], legacy-compatible values.
pub mod position_valid {
    pub const BBT: u32 = 0x10;
    pub const TIMECODE: u32 = 0x20;
    pub const BBT_OFFSET: u32 = 0x40;
    pub const AUDIO_VIDEO_RATIO: u32 = 0x80;
    pub const VIDEO_OFFSET: u32 = 0x100;
}

pub const TICKS_PER_BEAT: f64 = 1920.0;

/// Flat position struct handed to applications, field-compatible with the
/// legacy layout.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportPosition {
    pub unique_1: u64,
    pub usecs: u64,
    pub frame_rate: u32,
    pub frame: u32,
    pub valid: u32,
    pub bar: i32,
    pub beat: i32,
    pub tick: i32,
    pub bar_start_tick: f64,
    pub beats_per_bar: f32,
    pub beat_type: f32,
    pub ticks_per_beat: f64,
    pub beats_per_minute: f64,
    pub frame_time: f64,
    pub next_time: f64,
    pub bbt_offset: u32,
    pub audio_frames_per_video_frame: f32,
    pub video_offset: u32,
    pub unique_2: u64,
}

/// Map the driver's state word to the legacy transport state. Looping is
/// derived from the flags of segment 0.
pub fn transport_state(pos: &PositionBlock) -> TransportState {
    match pos.state {
        position_state::STARTING => TransportState::Starting,
        position_state::RUNNING => {
            if pos.segments[0].flags & SEGMENT_FLAG_LOOPING != 0 {
                TransportState::Looping
            } else {
                TransportState::Rolling
            }
        }
        _ => TransportState::Stopped,
    }
}

/// Decode the driver position into `dst` and return the transport state.
///
/// `segment_owner` is the current value of the activation's owner slot 0;
/// bar info is only reported while some node owns the timebase and the
/// segment carries valid bar data.
pub fn decode_position(
    pos: &PositionBlock,
    segment_owner: u32,
    dst: &mut TransportPosition,
) -> TransportState {
    let state = transport_state(pos);
    let seg = &pos.segments[0];

    dst.unique_1 = dst.unique_1.wrapping_add(1);
    dst.usecs = pos.clock.nsec / NSEC_PER_USEC;
    dst.frame_rate = pos.clock.rate.denom;

    let running = pos.clock.position.wrapping_sub(pos.offset);
    dst.frame = if running >= seg.start && (seg.duration == 0 || running < seg.start + seg.duration)
    {
        ((running - seg.start) as f64 * seg.rate + seg.position as f64) as u32
    } else {
        seg.position as u32
    };

    dst.valid = 0;
    if segment_owner != 0 && seg.bar.flags & SEGMENT_BAR_FLAG_VALID != 0 {
        dst.valid |= position_valid::BBT;

        dst.bbt_offset = seg.bar.offset;
        if seg.bar.offset != 0 {
            dst.valid |= position_valid::BBT_OFFSET;
        }

        dst.beats_per_bar = seg.bar.signature_num;
        dst.beat_type = seg.bar.signature_denom;
        dst.ticks_per_beat = TICKS_PER_BEAT;
        dst.beats_per_minute = seg.bar.bpm;

        let abs_beat = seg.bar.beat;

        dst.bar = (abs_beat / dst.beats_per_bar as f64) as i32;
        let mut beats = (dst.bar as f32 * dst.beats_per_bar) as i64;
        dst.bar_start_tick = beats as f64 * dst.ticks_per_beat;
        dst.beat = (abs_beat - beats as f64) as i32;
        beats += dst.beat as i64;
        dst.tick = ((abs_beat - beats as f64) * dst.ticks_per_beat) as i32;
        dst.bar += 1;
        dst.beat += 1;
    }
    dst.unique_2 = dst.unique_1;
    state
}

/// Trace-dump a position, field for field. Realtime-safe: tracing either
/// filters it out or formats into its own buffers.
pub fn trace_position(d: &TransportPosition) {
    use tracing::trace;
    trace!(usecs = d.usecs, frame_rate = d.frame_rate, frame = d.frame, valid = d.valid, "position");
    if d.valid & position_valid::BBT != 0 {
        trace!(
            bar = d.bar,
            beat = d.beat,
            tick = d.tick,
            bar_start_tick = d.bar_start_tick,
            beats_per_bar = d.beats_per_bar,
            beat_type = d.beat_type,
            ticks_per_beat = d.ticks_per_beat,
            beats_per_minute = d.beats_per_minute,
            "bbt"
        );
    }
    if d.valid & position_valid::BBT_OFFSET != 0 {
        trace!(bbt_offset = d.bbt_offset, "bbt offset");
    }
}

/// Encode application-provided bar info back into a segment bar block.
/// Returns `None` when the position carries no BBT data.
pub fn encode_segment_bar(src: &TransportPosition) -> Option<SegmentBar> {
    if src.valid & position_valid::BBT == 0 {
        return None;
    }
    let offset = if src.valid & position_valid::BBT_OFFSET != 0 {
        src.bbt_offset
    } else {
        0
    };
    Some(SegmentBar {
        flags: SEGMENT_BAR_FLAG_VALID,
        offset,
        signature_num: src.beats_per_bar,
        signature_denom: src.beat_type,
        bpm: src.beats_per_minute,
        beat: (src.bar as f64 - 1.0) * src.beats_per_bar as f64
            + (src.beat as f64 - 1.0)
            + src.tick as f64 / src.ticks_per_beat,
    })
}
