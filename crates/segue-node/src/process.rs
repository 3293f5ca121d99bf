//! The realtime cycle engine.
//!
//! A dedicated data-loop thread polls the rt eventfd the server installed
//! with the transport. Each wakeup runs one cycle: decode position, run
//! the application callback, tee MIDI output, then signal every peer
//! whose pending counter we complete. Nothing on this path allocates,
//! locks, or blocks beyond the eventfd read and the peer signal writes;
//! every I/O failure is logged and the cycle proceeds.
//!
//! In custom-thread mode the loop only launches the application's thread
//! callback; the application then drives `cycle_wait`/`cycle_signal`
//! itself, which compose to exactly the default path.

use crate::buffers::get_buffer_output;
use crate::client::ClientInner;
use crate::state::NodeState;
use crossbeam_channel::{unbounded, Receiver, Sender};
use segue_core::activation::{status, NSEC_PER_SEC};
use segue_core::transport::{decode_position, encode_segment_bar, TransportState};
use segue_core::{Direction, PortType, MAX_BUFFER_FRAMES};
use smallvec::SmallVec;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

/// Control-side requests applied on the data loop.
pub enum Invoke {
    SetRtSocket(Option<OwnedFd>),
}

/// Handle the control side uses to reach into the data loop.
#[derive(Clone)]
pub struct DataLoopCtl {
    tx: Sender<Invoke>,
    wake: Arc<OwnedFd>,
}

impl DataLoopCtl {
    /// Interrupt the poll so flag changes are observed.
    pub fn wake(&self) {
        let one: u64 = 1;
        // Safety: writing 8 bytes to our own eventfd.
        let res = unsafe {
            libc::write(
                self.wake.as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                8,
            )
        };
        if res != 8 {
            warn!("data loop wake failed: {}", std::io::Error::last_os_error());
        }
    }

    /// Replace (or drop) the rt socket from the control side.
    pub fn set_rt_socket(&self, fd: Option<OwnedFd>) {
        let _ = self.tx.send(Invoke::SetRtSocket(fd));
        self.wake();
    }
}

/// Build the ctl/receiver pair around a fresh wake eventfd.
pub fn make_ctl() -> std::io::Result<(DataLoopCtl, Receiver<Invoke>)> {
    // Safety: plain eventfd creation.
    let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    // Safety: we own the fd we just created.
    let wake = Arc::new(unsafe { <OwnedFd as std::os::fd::FromRawFd>::from_raw_fd(fd) });
    let (tx, rx) = unbounded();
    Ok((DataLoopCtl { tx, wake }, rx))
}

fn drain_invokes(state: &mut NodeState, rx: &Receiver<Invoke>) {
    for invoke in rx.try_iter() {
        match invoke {
            Invoke::SetRtSocket(fd) => state.rt_socket = fd,
        }
    }
}

fn drain_eventfd(fd: RawFd) {
    let mut value: u64 = 0;
    // Safety: 8-byte read from an eventfd we own.
    unsafe { libc::read(fd, &mut value as *mut u64 as *mut libc::c_void, 8) };
}

fn monotonic_nsec() -> u64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // Safety: plain clock query into a local.
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * NSEC_PER_SEC + ts.tv_nsec as u64
}

/// The data-loop thread body.
pub fn data_loop_main(inner: Arc<ClientInner>) {
    debug!("data loop running");
    while inner.data_running.load(Ordering::Acquire) {
        let (rt_fd, thread_mode) = {
            // Safety: the data loop is the realtime owner of the node
            // state; the control side only touches it at server-sequenced
            // points, and this borrow ends before any callback runs.
            let state = unsafe { &mut *inner.state.get() };
            drain_invokes(state, &inner.invoke_rx);
            (
                state.rt_socket.as_ref().map(|f| f.as_raw_fd()),
                state.callbacks.thread.is_some(),
            )
        };
        let started = inner.flags.started.load(Ordering::Acquire);
        let wake_fd = inner.data_loop.wake.as_raw_fd();

        let mut fds = [
            libc::pollfd { fd: wake_fd, events: libc::POLLIN, revents: 0 },
            libc::pollfd {
                fd: rt_fd.unwrap_or(-1),
                events: if started { libc::POLLIN } else { 0 },
                revents: 0,
            },
        ];
        // Safety: polling two descriptors we own.
        let res = unsafe { libc::poll(fds.as_mut_ptr(), 2, -1) };
        if res < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                warn!("data loop poll failed: {err}");
            }
            continue;
        }

        if fds[0].revents & libc::POLLIN != 0 {
            drain_eventfd(wake_fd);
        }

        let revents = fds[1].revents;
        if revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
            rt_hangup(&inner);
            continue;
        }
        if revents & libc::POLLIN != 0 && started {
            if thread_mode {
                if !inner.flags.thread_entered.swap(true, Ordering::AcqRel) {
                    // Safety: exclusive realtime access, see above.
                    let state = unsafe { &mut *inner.state.get() };
                    if let Some(cb) = state.callbacks.thread.as_mut() {
                        cb();
                    }
                }
                continue;
            }
            run_one_cycle(&inner);
        }
    }
    debug!("data loop stopped");
}

/// The default process path: first half, application callback, second
/// half.
pub fn run_one_cycle(inner: &ClientInner) {
    let frames = cycle_run(inner);
    // Safety: exclusive realtime access, see data_loop_main.
    let state = unsafe { &mut *inner.state.get() };
    let status_code = match state.callbacks.process.as_mut() {
        Some(cb) => cb(frames),
        None => 0,
    };
    cycle_signal(inner, status_code);
}

/// Rt socket hangup: unregister it and deliver the shutdown callback
/// exactly once, unless the client itself is closing.
fn rt_hangup(inner: &ClientInner) {
    warn!("rt socket error");
    // Safety: exclusive realtime access, see data_loop_main.
    let state = unsafe { &mut *inner.state.get() };
    state.rt_socket = None;
    if !inner.flags.destroyed.load(Ordering::Acquire)
        && !inner.flags.shutdown_emitted.swap(true, Ordering::AcqRel)
    {
        if let Some(cb) = state.callbacks.info_shutdown.as_mut() {
            cb("client ejected from the graph");
        } else if let Some(cb) = state.callbacks.shutdown.as_mut() {
            cb();
        }
    }
}

/// One cycle up to (not including) the process callback. Returns the
/// cycle's frame count, 0 when there is nothing to run.
pub fn cycle_run(inner: &ClientInner) -> u32 {
    // Safety: see data_loop_main.
    let state = unsafe { &mut *inner.state.get() };

    let Some(fd) = state.rt_socket.as_ref().map(|f| f.as_raw_fd()) else {
        return 0;
    };
    let mut cmd: u64 = 0;
    // Safety: 8-byte eventfd read.
    let n = unsafe { libc::read(fd, &mut cmd as *mut u64 as *mut libc::c_void, 8) };
    if n != 8 {
        let err = std::io::Error::last_os_error();
        warn!("rt socket read failed: {err}");
        if err.kind() == std::io::ErrorKind::WouldBlock {
            return 0;
        }
    }
    if cmd > 1 {
        warn!(missed = cmd - 1, "missed wakeups");
    }

    let Some(pos) = state.position_snapshot() else {
        error!("missing position io");
        return 0;
    };

    let nsec = pos.clock.nsec;
    if let Some(activation) = state.activation.get() {
        activation.set_status(status::AWAKE);
        activation.awake_time.store(nsec, Ordering::Relaxed);
    }

    if inner.flags.first.swap(false, Ordering::AcqRel) {
        if let Some(cb) = state.callbacks.thread_init.as_mut() {
            cb();
        }
    }

    let buffer_frames = pos.clock.duration as u32;
    if buffer_frames != state.buffer_frames {
        debug!(buffer_frames, "buffer size changed");
        state.buffer_frames = buffer_frames;
        if let Some(cb) = state.callbacks.buffer_size.as_mut() {
            cb(buffer_frames);
        }
    }

    let sample_rate = pos.clock.rate.denom;
    if sample_rate != state.sample_rate {
        debug!(sample_rate, "sample rate changed");
        state.sample_rate = sample_rate;
        if let Some(cb) = state.callbacks.sample_rate.as_mut() {
            cb(sample_rate);
        }
    }

    if let Some(driver) = state.driver_activation.get() {
        let driver_pos = driver.position();
        let owner = driver.segment_owner[0].load(Ordering::Acquire);
        state.last_state = decode_position(&driver_pos, owner, &mut state.last_position);

        if let Some(activation) = state.activation.get() {
            if activation.pending_sync.load(Ordering::Acquire) != 0 {
                let complete = match state.callbacks.sync.as_mut() {
                    Some(cb) => cb(state.last_state, &state.last_position),
                    None => true,
                };
                if complete {
                    activation.pending_sync.store(0, Ordering::Release);
                }
            }
        }

        let xruns = driver.xrun_count.load(Ordering::Relaxed);
        if xruns != state.xrun_count && state.xrun_count != 0 {
            if let Some(cb) = state.callbacks.xrun.as_mut() {
                cb();
            }
        }
        state.xrun_count = xruns;
    }

    trace!(
        frames = state.buffer_frames,
        rate = state.sample_rate,
        position = state.last_position.frame,
        "cycle"
    );
    buffer_frames
}

/// Block until the next cycle is ready and run its first half. The
/// custom-thread entry point.
pub fn cycle_wait(inner: &ClientInner) -> u32 {
    // Safety: called from the data-loop thread (custom thread mode).
    let state = unsafe { &mut *inner.state.get() };
    let Some(fd) = state.rt_socket.as_ref().map(|f| f.as_raw_fd()) else {
        return 0;
    };
    let mut fds = [libc::pollfd { fd, events: libc::POLLIN, revents: 0 }];
    // Safety: polling one descriptor we own.
    let res = unsafe { libc::poll(fds.as_mut_ptr(), 1, -1) };
    if res <= 0 || fds[0].revents & (libc::POLLERR | libc::POLLHUP) != 0 {
        warn!("cycle wait failed");
        return 0;
    }
    cycle_run(inner)
}

/// Timebase emission plus peer fan-out; the second half of a cycle.
pub fn cycle_signal(inner: &ClientInner, status_code: i32) {
    // Safety: see data_loop_main.
    let state = unsafe { &mut *inner.state.get() };

    if status_code == 0 {
        if let Some(driver) = state.driver_activation.get() {
            let owns_timebase = state.callbacks.timebase.is_some()
                && driver.segment_owner[0].load(Ordering::Acquire) == state.node_id;
            if owns_timebase {
                let own = state.activation;
                let pending_new_pos = own
                    .get()
                    .map(|a| a.pending_new_pos.load(Ordering::Acquire) != 0)
                    .unwrap_or(false);
                let moving = matches!(
                    state.last_state,
                    TransportState::Rolling | TransportState::Looping
                );
                if pending_new_pos || moving {
                    let NodeState {
                        callbacks,
                        last_position,
                        last_state,
                        buffer_frames,
                        ..
                    } = &mut *state;
                    if let Some(cb) = callbacks.timebase.as_mut() {
                        cb(*last_state, *buffer_frames, last_position, pending_new_pos);
                    }
                    if let Some(activation) = own.get() {
                        activation.pending_new_pos.store(0, Ordering::Release);
                        segue_core::transport::trace_position(&state.last_position);
                        if let Some(bar) = encode_segment_bar(&state.last_position) {
                            activation.write_segment_bar(bar);
                        }
                    }
                }
            }
        }
    }
    signal_sync(state);
}

/// Tee MIDI output and wake the peers whose pending counters we drain.
fn signal_sync(state: &mut NodeState) {
    process_tee(state);

    let nsec = monotonic_nsec();
    if let Some(activation) = state.activation.get() {
        activation.set_status(status::FINISHED);
        activation.finish_time.store(nsec, Ordering::Relaxed);
    }

    let one: u64 = 1;
    for link in &state.links {
        let Some(activation) = link.activation.get() else {
            continue;
        };
        let link_state = &activation.state[0];
        trace!(
            peer = link.node_id,
            pending = link_state.pending.load(Ordering::Relaxed),
            "peer link"
        );
        if link_state.dec() {
            activation.set_status(status::TRIGGERED);
            activation.signal_time.store(nsec, Ordering::Relaxed);
            if let Some(fd) = &link.signalfd {
                // Safety: 8-byte write to the peer's eventfd.
                let res = unsafe {
                    libc::write(
                        fd.as_raw_fd(),
                        &one as *const u64 as *const libc::c_void,
                        8,
                    )
                };
                if res != 8 {
                    warn!(
                        peer = link.node_id,
                        "peer signal failed: {}",
                        std::io::Error::last_os_error()
                    );
                }
            }
        }
    }
}

/// Convert every output MIDI port's staged buffer into a fresh server
/// buffer and mirror the port's io state to all readers.
fn process_tee(state: &mut NodeState) {
    let midi_ports: SmallVec<[u32; 16]> = state
        .ports
        .active(Direction::Output)
        .iter()
        .copied()
        .filter(|&i| state.ports.port(Direction::Output, i).type_id == PortType::Midi)
        .collect();

    for index in midi_ports {
        let out = get_buffer_output(state, index, MAX_BUFFER_FRAMES as u32, 1);
        if out.is_null() {
            continue;
        }
        let port = state.ports.port_mut(Direction::Output, index);
        let staged = port.empty_ptr() as *mut u8;
        let bytes = MAX_BUFFER_FRAMES * std::mem::size_of::<f32>();
        // Safety: staged is the port's scratch area, out is the plane of
        // the buffer just dequeued; both cover `bytes` and never overlap.
        unsafe {
            let midi = segue_midi::MidiBufferRef::from_raw(std::slice::from_raw_parts_mut(
                staged, bytes,
            ));
            let dst = std::slice::from_raw_parts_mut(out, bytes);
            segue_midi::convert_from_midi(&midi, dst);
        }
    }
}
