//! Local port and mix pools.
//!
//! Both pools are fully preallocated at client creation so the realtime
//! side walks stable storage: ports never move, mixes never move, and the
//! per-port active lists reserve their capacity up front. Free-list
//! operations happen on the control side under the thread-loop lock.

use crate::mem::MemMap;
use crate::registry::ObjKey;
use segue_core::activation::io_status;
use segue_core::{
    Direction, IoBuffers, PortType, INVALID_ID, MAX_BUFFERS, MAX_BUFFER_DATAS, MAX_BUFFER_FRAMES,
    MAX_BUFFER_MEMS, MAX_MIX, MAX_PORTS,
};
use segue_midi::MidiBufferRef;
use smallvec::SmallVec;
use tracing::{trace, warn};

/// Per-port scratch buffer: mixing target, silence source and MIDI staging
/// area. Aligned for the wide mix path.
#[repr(align(16))]
pub struct EmptyBuffer(pub [f32; MAX_BUFFER_FRAMES]);

/// Chunk header inside a buffer's metadata region, shared with the server.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Chunk {
    pub offset: u32,
    pub size: u32,
    pub stride: i32,
    pub flags: u32,
}

/// One mapped data plane of a server buffer.
#[derive(Debug, Clone, Copy)]
pub struct DataPlane {
    pub data: *mut u8,
    pub maxsize: u32,
    pub chunk: *mut Chunk,
}

/// One server buffer attached to a mix.
#[derive(Default)]
pub struct BufferSlot {
    pub id: u32,
    /// Held by producer (application or server) rather than queued.
    pub out: bool,
    pub datas: SmallVec<[DataPlane; MAX_BUFFER_DATAS]>,
    pub mems: SmallVec<[MemMap; MAX_BUFFER_MEMS]>,
}

impl BufferSlot {
    pub fn clear(&mut self) {
        self.datas.clear();
        self.mems.clear();
        self.out = false;
    }
}

pub type MixKey = usize;

/// One peer's buffer flow into or out of a port. `id == INVALID_ID` is the
/// port's own output mix.
pub struct Mix {
    pub in_use: bool,
    pub id: u32,
    pub port: Option<(Direction, u32)>,
    /// Io area mapped by the server, null until `port_set_io`.
    pub io: *mut IoBuffers,
    pub buffers: [BufferSlot; MAX_BUFFERS],
    pub n_buffers: u32,
    /// Buffer ids free for writing, oldest first.
    pub queue: SmallVec<[u32; MAX_BUFFERS]>,
}

impl Default for Mix {
    fn default() -> Self {
        Self {
            in_use: false,
            id: INVALID_ID,
            port: None,
            io: std::ptr::null_mut(),
            buffers: Default::default(),
            n_buffers: 0,
            queue: SmallVec::new(),
        }
    }
}

impl Mix {
    /// Take the oldest writable buffer, marking it held.
    pub fn dequeue_buffer(&mut self) -> Option<u32> {
        if self.queue.is_empty() {
            return None;
        }
        let id = self.queue.remove(0);
        self.buffers[id as usize].out = true;
        Some(id)
    }

    /// Requeue a held buffer for writing.
    pub fn reuse_buffer(&mut self, id: u32) {
        let slot = &mut self.buffers[id as usize];
        if slot.out {
            trace!(mix = self.id, buffer = id, "recycle buffer");
            slot.out = false;
            self.queue.push(id);
        }
    }

    /// Drop all buffer mappings and reset the queue.
    pub fn clear_buffers(&mut self) {
        for slot in &mut self.buffers {
            slot.clear();
        }
        self.n_buffers = 0;
        self.queue.clear();
    }

    /// Read the io cell, if the server gave us one.
    #[inline]
    pub fn io_read(&self) -> Option<IoBuffers> {
        if self.io.is_null() {
            None
        } else {
            // Safety: io points into a live tagged mapping; the server
            // sequences its writes against our cycles.
            Some(unsafe { std::ptr::read_volatile(self.io) })
        }
    }

    #[inline]
    pub fn io_write(&self, io: IoBuffers) {
        if !self.io.is_null() {
            // Safety: as above.
            unsafe { std::ptr::write_volatile(self.io, io) }
        }
    }

    #[inline]
    pub fn io_set_status(&self, status: i32) {
        if let Some(mut io) = self.io_read() {
            io.status = status;
            self.io_write(io);
        }
    }
}

/// A locally-owned port.
pub struct LocalPort {
    pub valid: bool,
    pub direction: Direction,
    pub index: u32,
    pub object: Option<ObjKey>,
    pub type_id: PortType,
    /// Our own buffer state, fanned out to reader mixes by the tee.
    pub io: IoBuffers,
    pub mixes: Vec<MixKey>,
    pub have_format: bool,
    pub rate: u32,
    pub zeroed: bool,
    empty: Box<EmptyBuffer>,
}

/// Reserved so pushing a new connection does not move the list under the
/// realtime walker.
const MIXES_CAPACITY: usize = 64;

impl LocalPort {
    fn new(direction: Direction, index: u32) -> LocalPort {
        // Safety: an all-zero EmptyBuffer is valid, and zeroed allocation
        // keeps the untouched ports unbacked by physical pages.
        let empty = unsafe { Box::<EmptyBuffer>::new_zeroed().assume_init() };
        LocalPort {
            valid: false,
            direction,
            index,
            object: None,
            type_id: PortType::Other,
            io: IoBuffers::default(),
            mixes: Vec::with_capacity(MIXES_CAPACITY),
            have_format: false,
            rate: 0,
            zeroed: false,
            empty,
        }
    }

    #[inline]
    pub fn empty_samples(&mut self) -> &mut [f32] {
        &mut self.empty.0
    }

    #[inline]
    pub fn empty_ptr(&mut self) -> *mut f32 {
        self.empty.0.as_mut_ptr()
    }

    #[inline]
    pub fn empty_bytes(&mut self) -> &mut [u8] {
        // Safety: reinterpreting the scratch floats as bytes.
        unsafe {
            std::slice::from_raw_parts_mut(
                self.empty.0.as_mut_ptr() as *mut u8,
                MAX_BUFFER_FRAMES * std::mem::size_of::<f32>(),
            )
        }
    }

    /// Prepare the scratch buffer: silence for audio/video, an empty MIDI
    /// buffer for control ports.
    pub fn init_empty(&mut self) {
        if self.type_id == PortType::Midi {
            let frames = MAX_BUFFER_FRAMES as u32;
            MidiBufferRef::init(self.empty_bytes(), frames);
        } else {
            self.empty.0.fill(0.0);
        }
        self.zeroed = true;
    }
}

/// Fixed pools for both directions plus the shared mix pool.
pub struct PortPool {
    ports: [Vec<LocalPort>; 2],
    free: [Vec<u32>; 2],
    /// Indices of valid ports, reserved to capacity for the realtime walk.
    active: [Vec<u32>; 2],
    mixes: Vec<Mix>,
    free_mix: Vec<MixKey>,
}

impl PortPool {
    pub fn new() -> PortPool {
        let mut ports = [Vec::with_capacity(MAX_PORTS), Vec::with_capacity(MAX_PORTS)];
        let mut free = [Vec::with_capacity(MAX_PORTS), Vec::with_capacity(MAX_PORTS)];
        for (d, direction) in [(0, Direction::Input), (1, Direction::Output)] {
            for i in 0..MAX_PORTS {
                ports[d].push(LocalPort::new(direction, i as u32));
            }
            free[d].extend((0..MAX_PORTS as u32).rev());
        }
        let mut mixes = Vec::with_capacity(MAX_MIX);
        mixes.resize_with(MAX_MIX, Mix::default);
        PortPool {
            ports,
            free,
            active: [Vec::with_capacity(MAX_PORTS), Vec::with_capacity(MAX_PORTS)],
            mixes,
            free_mix: (0..MAX_MIX).rev().collect(),
        }
    }

    pub fn alloc(&mut self, direction: Direction) -> Option<u32> {
        let d = direction.index();
        let index = match self.free[d].pop() {
            Some(i) => i,
            None => {
                warn!("port pool exhausted");
                return None;
            }
        };
        let port = &mut self.ports[d][index as usize];
        port.valid = true;
        port.zeroed = false;
        port.have_format = false;
        port.rate = 0;
        port.object = None;
        port.io = IoBuffers::default();
        self.active[d].push(index);
        Some(index)
    }

    /// Release a port and all of its mixes.
    pub fn release(&mut self, direction: Direction, index: u32) {
        let d = direction.index();
        let port = &mut self.ports[d][index as usize];
        if !port.valid {
            return;
        }
        port.valid = false;
        let mixes = std::mem::take(&mut port.mixes);
        for key in mixes {
            self.release_mix(key);
        }
        self.active[d].retain(|&i| i != index);
        self.free[d].push(index);
    }

    #[inline]
    pub fn port(&self, direction: Direction, index: u32) -> &LocalPort {
        &self.ports[direction.index()][index as usize]
    }

    #[inline]
    pub fn port_mut(&mut self, direction: Direction, index: u32) -> &mut LocalPort {
        &mut self.ports[direction.index()][index as usize]
    }

    pub fn active(&self, direction: Direction) -> &[u32] {
        &self.active[direction.index()]
    }

    #[inline]
    pub fn mix(&self, key: MixKey) -> &Mix {
        &self.mixes[key]
    }

    #[inline]
    pub fn mix_mut(&mut self, key: MixKey) -> &mut Mix {
        &mut self.mixes[key]
    }

    pub fn find_mix(&self, direction: Direction, port: u32, mix_id: u32) -> Option<MixKey> {
        self.ports[direction.index()][port as usize]
            .mixes
            .iter()
            .copied()
            .find(|&k| self.mixes[k].id == mix_id)
    }

    /// Find or lazily allocate the mix `mix_id` on a port.
    pub fn ensure_mix(&mut self, direction: Direction, port: u32, mix_id: u32) -> Option<MixKey> {
        if let Some(key) = self.find_mix(direction, port, mix_id) {
            return Some(key);
        }
        let key = match self.free_mix.pop() {
            Some(k) => k,
            None => {
                warn!("mix pool exhausted");
                return None;
            }
        };
        let mix = &mut self.mixes[key];
        mix.in_use = true;
        mix.id = mix_id;
        mix.port = Some((direction, port));
        mix.io = std::ptr::null_mut();
        mix.n_buffers = 0;
        mix.queue.clear();
        self.ports[direction.index()][port as usize].mixes.push(key);
        Some(key)
    }

    fn release_mix(&mut self, key: MixKey) {
        let mix = &mut self.mixes[key];
        mix.clear_buffers();
        mix.in_use = false;
        mix.id = INVALID_ID;
        mix.port = None;
        mix.io = std::ptr::null_mut();
        self.free_mix.push(key);
    }
}

impl Default for PortPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Initial own-io state for an output buffer grab: nothing to hand out.
pub fn io_unset() -> IoBuffers {
    IoBuffers {
        status: io_status::BROKEN,
        buffer_id: INVALID_ID,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_release_cycle() {
        let mut pool = PortPool::new();
        let a = pool.alloc(Direction::Input).unwrap();
        let b = pool.alloc(Direction::Input).unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.active(Direction::Input), &[a, b]);

        pool.release(Direction::Input, a);
        assert_eq!(pool.active(Direction::Input), &[b]);
        assert!(!pool.port(Direction::Input, a).valid);

        // released index comes back
        let c = pool.alloc(Direction::Input).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn test_ensure_mix_is_idempotent() {
        let mut pool = PortPool::new();
        let p = pool.alloc(Direction::Input).unwrap();
        let m1 = pool.ensure_mix(Direction::Input, p, 0).unwrap();
        let m2 = pool.ensure_mix(Direction::Input, p, 0).unwrap();
        assert_eq!(m1, m2);
        let m3 = pool.ensure_mix(Direction::Input, p, 1).unwrap();
        assert_ne!(m1, m3);
        assert_eq!(pool.port(Direction::Input, p).mixes.len(), 2);
    }

    #[test]
    fn test_release_port_frees_mixes() {
        let mut pool = PortPool::new();
        let p = pool.alloc(Direction::Output).unwrap();
        let m = pool.ensure_mix(Direction::Output, p, INVALID_ID).unwrap();
        pool.release(Direction::Output, p);
        assert!(!pool.mix(m).in_use);
        assert!(pool.find_mix(Direction::Output, p, INVALID_ID).is_none());
    }

    #[test]
    fn test_queue_accounting() {
        let mut pool = PortPool::new();
        let p = pool.alloc(Direction::Output).unwrap();
        let key = pool.ensure_mix(Direction::Output, p, INVALID_ID).unwrap();
        let mix = pool.mix_mut(key);
        mix.n_buffers = 2;
        mix.buffers[0].out = true;
        mix.buffers[1].out = true;
        mix.reuse_buffer(0);
        mix.reuse_buffer(1);

        // queued + held always equals n_buffers
        assert_eq!(mix.queue.len(), 2);
        let first = mix.dequeue_buffer().unwrap();
        assert_eq!(first, 0);
        assert!(mix.buffers[0].out);
        assert_eq!(
            mix.queue.len() + mix.buffers.iter().filter(|b| b.out).count(),
            2
        );

        // double reuse is a no-op
        mix.reuse_buffer(1);
        assert_eq!(mix.queue.len(), 1);

        mix.clear_buffers();
        assert_eq!(mix.queue.len(), 0);
        assert_eq!(mix.n_buffers, 0);
    }

    #[test]
    fn test_midi_scratch_init() {
        let mut pool = PortPool::new();
        let p = pool.alloc(Direction::Input).unwrap();
        let port = pool.port_mut(Direction::Input, p);
        port.type_id = PortType::Midi;
        port.init_empty();
        assert!(port.zeroed);
        let mb = MidiBufferRef::from_raw(port.empty_bytes());
        assert!(mb.is_valid());
        assert_eq!(mb.event_count(), 0);
    }
}
