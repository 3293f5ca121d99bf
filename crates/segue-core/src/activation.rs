//! Shared-memory activation records.
//!
//! One activation record per node participant, mapped into every process
//! that takes part in a graph cycle. Both sides write it: the server (and
//! the driver node) fill the position block and arm the pending counters,
//! the client stamps its status timeline and decrements peer counters when
//! it signals them.
//!
//! The CAS'd cells (`segment_owner`, `reposition_owner`, `command`,
//! `sync_timeout`, the per-state `pending` counter) are atomics. The
//! position block is plain data read and written through volatile copies:
//! the server's signal/wait protocol orders those accesses, and a torn read
//! of an in-flight position only affects one cycle of display state.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};

/// Client status within one graph cycle.
pub mod status {
    pub const IDLE: u32 = 0;
    pub const TRIGGERED: u32 = 1;
    pub const AWAKE: u32 = 2;
    pub const FINISHED: u32 = 3;
}

/// Transport commands written into the driver's activation.
pub mod command {
    pub const NONE: u32 = 0;
    pub const START: u32 = 1;
    pub const STOP: u32 = 2;
}

/// Position states published by the driver.
pub mod position_state {
    pub const STOPPED: u32 = 0;
    pub const STARTING: u32 = 1;
    pub const RUNNING: u32 = 2;
}

pub const SEGMENT_FLAG_LOOPING: u32 = 1 << 0;
pub const SEGMENT_BAR_FLAG_VALID: u32 = 1 << 0;

pub const NSEC_PER_USEC: u64 = 1_000;
pub const NSEC_PER_SEC: u64 = 1_000_000_000;
pub const USEC_PER_SEC: u64 = 1_000_000;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Fraction {
    pub num: u32,
    pub denom: u32,
}

/// The graph clock as published by the driver.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ClockBlock {
    /// Id of the node this clock originates from.
    pub id: u32,
    pub flags: u32,
    /// Time of the current cycle start, CLOCK_MONOTONIC nanoseconds.
    pub nsec: u64,
    /// Samples per second as `num/denom`; `denom` is the sample rate.
    pub rate: Fraction,
    /// Sample position at cycle start.
    pub position: u64,
    /// Samples per cycle.
    pub duration: u64,
    pub delay: i64,
    /// Rate difference against the system clock.
    pub rate_diff: f64,
    /// Estimated time of the next cycle start.
    pub next_nsec: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SegmentBar {
    pub flags: u32,
    /// Frame offset of the first beat boundary.
    pub offset: u32,
    pub signature_num: f32,
    pub signature_denom: f32,
    pub bpm: f64,
    /// Absolute beat number at segment start.
    pub beat: f64,
}

/// One contiguous stretch of the timeline.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Segment {
    pub version: u32,
    pub flags: u32,
    /// Running-time start of the segment.
    pub start: u64,
    /// Running-time length; 0 means open-ended.
    pub duration: u64,
    pub rate: f64,
    /// Timeline position at `start`.
    pub position: u64,
    pub bar: SegmentBar,
}

pub const MAX_SEGMENTS: usize = 8;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct PositionBlock {
    pub clock: ClockBlock,
    /// Subtracted from `clock.position` to obtain running time.
    pub offset: u64,
    pub state: u32,
    pub n_segments: u32,
    pub segments: [Segment; MAX_SEGMENTS],
}

/// Per-port, per-mix buffer handoff cell, shared with the server.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoBuffers {
    pub status: i32,
    pub buffer_id: u32,
}

/// Values of [`IoBuffers::status`].
pub mod io_status {
    pub const OK: i32 = 0;
    pub const NEED_DATA: i32 = 1;
    pub const HAVE_DATA: i32 = 2;
    /// No buffer available; same value the server uses (negative EPIPE).
    pub const BROKEN: i32 = -32;
}

impl Default for IoBuffers {
    fn default() -> Self {
        Self {
            status: io_status::OK,
            buffer_id: crate::INVALID_ID,
        }
    }
}

/// Pending/required trigger counters for one node.
#[repr(C)]
#[derive(Debug, Default)]
pub struct ActivationState {
    pub status: AtomicU32,
    pub required: AtomicU32,
    pub pending: AtomicI32,
}

impl ActivationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decrement the pending counter; true when it reached zero and the
    /// node must now be signalled. The release/acquire pair is the
    /// happens-before edge the peer's reader relies on.
    #[inline]
    pub fn dec(&self) -> bool {
        self.pending.fetch_sub(1, Ordering::AcqRel) == 1
    }

    #[inline]
    pub fn reset(&self) {
        let required = self.required.load(Ordering::Relaxed);
        self.pending.store(required as i32, Ordering::Release);
    }
}

/// Reposition request cell. The requester fills the target and then stores
/// its node id into `reposition_owner`; the server consumes both.
#[repr(C)]
#[derive(Debug, Default)]
pub struct Reposition {
    pub flags: AtomicU32,
    pub start: AtomicU64,
    pub duration: AtomicU64,
    pub position: AtomicU64,
    rate_bits: AtomicU64,
}

impl Reposition {
    pub fn set_rate(&self, rate: f64) {
        self.rate_bits.store(rate.to_bits(), Ordering::Relaxed);
    }

    pub fn rate(&self) -> f64 {
        f64::from_bits(self.rate_bits.load(Ordering::Relaxed))
    }
}

/// The activation record proper.
#[repr(C)]
pub struct ActivationRecord {
    pub status: AtomicU32,
    pub pending_sync: AtomicU32,
    pub pending_new_pos: AtomicU32,
    pub state: [ActivationState; 1],
    pub signal_time: AtomicU64,
    pub awake_time: AtomicU64,
    pub finish_time: AtomicU64,
    pub sync_timeout: AtomicU64,
    pub sync_left: AtomicU64,
    /// Smoothed cpu load, f32 bit patterns over three windows.
    pub cpu_load: [AtomicU32; 3],
    pub xrun_count: AtomicU32,
    pub xrun_time: AtomicU64,
    pub xrun_delay: AtomicU64,
    pub max_delay: AtomicU64,
    pub command: AtomicU32,
    pub reposition_owner: AtomicU32,
    /// Slot 0 holds the elected timebase owner's node id.
    pub segment_owner: [AtomicU32; 8],
    pub reposition: Reposition,
    position: UnsafeCell<PositionBlock>,
}

// Safety: every mutable cell is either an atomic or accessed through the
// volatile position accessors below; concurrent writers live in another
// process either way.
unsafe impl Sync for ActivationRecord {}
unsafe impl Send for ActivationRecord {}

impl ActivationRecord {
    pub fn new() -> Self {
        Self {
            status: AtomicU32::new(status::IDLE),
            pending_sync: AtomicU32::new(0),
            pending_new_pos: AtomicU32::new(0),
            state: [ActivationState::new()],
            signal_time: AtomicU64::new(0),
            awake_time: AtomicU64::new(0),
            finish_time: AtomicU64::new(0),
            sync_timeout: AtomicU64::new(0),
            sync_left: AtomicU64::new(0),
            cpu_load: std::array::from_fn(|_| AtomicU32::new(0)),
            xrun_count: AtomicU32::new(0),
            xrun_time: AtomicU64::new(0),
            xrun_delay: AtomicU64::new(0),
            max_delay: AtomicU64::new(0),
            command: AtomicU32::new(command::NONE),
            reposition_owner: AtomicU32::new(0),
            segment_owner: std::array::from_fn(|_| AtomicU32::new(0)),
            reposition: Reposition::default(),
            position: UnsafeCell::new(PositionBlock::default()),
        }
    }

    /// Snapshot the position block.
    #[inline]
    pub fn position(&self) -> PositionBlock {
        unsafe { std::ptr::read_volatile(self.position.get()) }
    }

    /// Overwrite the whole position block. Driver/test side only.
    pub fn set_position(&self, pos: PositionBlock) {
        unsafe { std::ptr::write_volatile(self.position.get(), pos) }
    }

    /// Publish new bar information into segment 0. Timebase owner only.
    pub fn write_segment_bar(&self, bar: SegmentBar) {
        unsafe {
            let p = self.position.get();
            std::ptr::write_volatile(std::ptr::addr_of_mut!((*p).segments[0].bar), bar);
        }
    }

    #[inline]
    pub fn cpu_load(&self, window: usize) -> f32 {
        f32::from_bits(self.cpu_load[window].load(Ordering::Relaxed))
    }

    pub fn set_cpu_load(&self, window: usize, load: f32) {
        self.cpu_load[window].store(load.to_bits(), Ordering::Relaxed);
    }

    #[inline]
    pub fn set_status(&self, s: u32) {
        self.status.store(s, Ordering::Relaxed);
    }

    /// Try to take the timebase: CAS slot 0 from 0 to `node_id`.
    pub fn acquire_segment_owner(&self, node_id: u32) -> bool {
        self.segment_owner[0]
            .compare_exchange(0, node_id, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Release the timebase: CAS slot 0 from `node_id` back to 0.
    pub fn release_segment_owner(&self, node_id: u32) -> bool {
        self.segment_owner[0]
            .compare_exchange(node_id, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Default for ActivationRecord {
    fn default() -> Self {
        Self::new()
    }
}
