//! Buffer presentation to the application.
//!
//! `port_get_buffer` resolves to one of four paths on direction × type.
//! Audio input walks the port's mixes: the first live mix hands its plane
//! out zero-copy, every further one is summed pairwise into the port's
//! scratch buffer. Audio output dequeues from the port's own mix and fans
//! the io state out to every reader. MIDI input merges all mix sequences;
//! MIDI output always stages in the scratch buffer and is emitted by the
//! tee at cycle end.

use crate::ports::Chunk;
use crate::state::NodeState;
use segue_core::activation::io_status;
use segue_core::{Direction, IoBuffers, PortType, INVALID_ID, MAX_BUFFER_FRAMES};
use segue_midi::{convert_to_midi, MidiBufferRef, SeqReader};
use smallvec::SmallVec;
use tracing::{trace, warn};

/// Scalar mix-add; the obligatory fallback.
pub unsafe fn mix2_scalar(dst: *mut f32, src1: *const f32, src2: *const f32, n: usize) {
    for i in 0..n {
        *dst.add(i) = *src1.add(i) + *src2.add(i);
    }
}

/// 4-wide SSE mix-add. The alignment check runs once per call, not per
/// sample; unaligned tails fall to the scalar loop.
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "sse")]
pub unsafe fn mix2_sse(dst: *mut f32, src1: *const f32, src2: *const f32, n: usize) {
    use std::arch::x86_64::*;

    let aligned = (dst as usize | src1 as usize | src2 as usize) & 15 == 0;
    let unrolled = if aligned { n / 4 } else { 0 };

    let mut i = 0;
    while i < unrolled * 4 {
        let a = _mm_load_ps(src1.add(i));
        let b = _mm_load_ps(src2.add(i));
        _mm_store_ps(dst.add(i), _mm_add_ps(a, b));
        i += 4;
    }
    while i < n {
        *dst.add(i) = *src1.add(i) + *src2.add(i);
        i += 1;
    }
}

/// Pick the mix-add implementation once, from runtime CPU features.
pub fn select_mix2() -> crate::state::Mix2Fn {
    #[cfg(target_arch = "x86_64")]
    {
        if std::arch::is_x86_feature_detected!("sse") {
            return mix2_sse;
        }
    }
    mix2_scalar
}

/// Grab an output buffer on the port's own mix, stamp its chunk, and tee
/// the resulting io state to every reader mix. Returns the plane pointer,
/// null when no buffer is available.
pub fn get_buffer_output(
    state: &mut NodeState,
    port_index: u32,
    frames: u32,
    stride: u32,
) -> *mut u8 {
    let mut ptr: *mut u8 = std::ptr::null_mut();
    let mut io = crate::ports::io_unset();

    if let Some(own) = state.ports.find_mix(Direction::Output, port_index, INVALID_ID) {
        let mix = state.ports.mix_mut(own);
        if mix.n_buffers > 0 {
            trace!(port = port_index, frames, n_buffers = mix.n_buffers, "get output buffer");
            match mix.dequeue_buffer() {
                Some(id) => {
                    // immediately recycled so the next cycle alternates
                    mix.reuse_buffer(id);
                    let slot = &mix.buffers[id as usize];
                    let plane = slot.datas[0];
                    ptr = plane.data;
                    if !plane.chunk.is_null() {
                        // Safety: chunk points into the buffer's mapped
                        // metadata region.
                        unsafe {
                            *plane.chunk = Chunk {
                                offset: 0,
                                size: frames * std::mem::size_of::<f32>() as u32,
                                stride: stride as i32,
                                flags: 0,
                            };
                        }
                    }
                    io = IoBuffers { status: io_status::HAVE_DATA, buffer_id: id };
                }
                None => warn!(port = port_index, "out of buffers"),
            }
        }
    }

    let port = state.ports.port_mut(Direction::Output, port_index);
    port.io = io;
    tee_port(state, port_index);
    ptr
}

/// Copy the port's own io state into every reader mix's io cell.
pub fn tee_port(state: &mut NodeState, port_index: u32) {
    let port = state.ports.port(Direction::Output, port_index);
    let io = port.io;
    for i in 0..port.mixes.len() {
        let key = state.ports.port(Direction::Output, port_index).mixes[i];
        let mix = state.ports.mix(key);
        if mix.io.is_null() {
            continue;
        }
        trace!(port = port_index, mix = mix.id, "tee io");
        mix.io_write(io);
    }
}

/// Input audio: zero-copy single source, pairwise sum beyond that.
/// Returns null when no mix had a live buffer.
pub fn get_buffer_input_audio(state: &mut NodeState, port_index: u32, frames: u32) -> *mut f32 {
    let mix2 = state.mix2;
    let mut ptr: *mut f32 = std::ptr::null_mut();
    let mut layer = 0u32;

    let n_mixes = state.ports.port(Direction::Input, port_index).mixes.len();
    for i in 0..n_mixes {
        let key = state.ports.port(Direction::Input, port_index).mixes[i];
        let mix = state.ports.mix(key);
        trace!(port = port_index, mix = mix.id, frames, "input mix");
        let Some(io) = mix.io_read() else { continue };
        if io.buffer_id >= mix.n_buffers {
            continue;
        }
        mix.io_set_status(io_status::NEED_DATA);
        let data = mix.buffers[io.buffer_id as usize].datas[0].data as *mut f32;

        if layer == 0 {
            ptr = data;
        } else {
            let port = state.ports.port_mut(Direction::Input, port_index);
            let empty = port.empty_ptr();
            // Safety: scratch holds MAX_BUFFER_FRAMES floats; sources are
            // live mapped planes; dst may alias src1 while accumulating.
            unsafe { mix2(empty, ptr, data, frames as usize) };
            ptr = empty;
            port.zeroed = false;
        }
        layer += 1;
    }
    ptr
}

/// Input MIDI: collect each live mix's sequence and merge them in time
/// order into the port's scratch buffer.
pub fn get_buffer_input_midi(state: &mut NodeState, port_index: u32) -> *mut f32 {
    // collect the live sequences first; the scratch rewrite below must
    // not invalidate them (they point into mapped buffers, not scratch)
    let mut seqs: SmallVec<[SeqReader<'_>; 16]> = SmallVec::new();

    let n_mixes = state.ports.port(Direction::Input, port_index).mixes.len();
    for i in 0..n_mixes {
        let key = state.ports.port(Direction::Input, port_index).mixes[i];
        let mix = state.ports.mix(key);
        let Some(io) = mix.io_read() else { continue };
        if io.buffer_id >= mix.n_buffers {
            continue;
        }
        mix.io_set_status(io_status::NEED_DATA);
        let plane = mix.buffers[io.buffer_id as usize].datas[0];
        if plane.chunk.is_null() {
            continue;
        }
        // Safety: chunk and plane belong to a live mapped buffer.
        let chunk = unsafe { *plane.chunk };
        let offset = chunk.offset as usize;
        if offset >= plane.maxsize as usize {
            continue;
        }
        let size = (chunk.size as usize).min(plane.maxsize as usize - offset);
        let bytes = unsafe { std::slice::from_raw_parts(plane.data.add(offset), size) };
        if let Some(seq) = SeqReader::from_bytes(bytes) {
            seqs.push(seq);
        }
    }

    let port = state.ports.port_mut(Direction::Input, port_index);
    let frames = MAX_BUFFER_FRAMES as u32;
    let mut midi = MidiBufferRef::init(port.empty_bytes(), frames);
    convert_to_midi(&seqs, &mut midi);
    port.zeroed = false;
    port.empty_ptr()
}

/// The full direction × type dispatch. Returns a pointer into either a
/// mapped buffer or the port's scratch area; never null for a valid port.
pub fn port_buffer(state: &mut NodeState, direction: Direction, port_index: u32, frames: u32) -> *mut f32 {
    let type_id = state.ports.port(direction, port_index).type_id;
    match direction {
        Direction::Input => {
            let ptr = match type_id {
                PortType::Midi => get_buffer_input_midi(state, port_index),
                _ => get_buffer_input_audio(state, port_index, frames),
            };
            if !ptr.is_null() {
                return ptr;
            }
            let port = state.ports.port_mut(Direction::Input, port_index);
            if !port.zeroed {
                port.init_empty();
            }
            port.empty_ptr()
        }
        Direction::Output => match type_id {
            PortType::Midi => {
                // staged locally; the tee converts and emits at cycle end
                state.ports.port_mut(Direction::Output, port_index).empty_ptr()
            }
            _ => {
                let ptr = get_buffer_output(
                    state,
                    port_index,
                    frames,
                    std::mem::size_of::<f32>() as u32,
                ) as *mut f32;
                if !ptr.is_null() {
                    return ptr;
                }
                let port = state.ports.port_mut(Direction::Output, port_index);
                warn!(port = port_index, "no output buffer, writes go nowhere");
                port.empty_ptr()
            }
        },
    }
}
