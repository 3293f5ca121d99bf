//! End-to-end cycle test against an in-process mock server.
//!
//! The mock feeds the client a full node setup over a socketpair: pool
//! memory, transport with an rt eventfd pair, a driver activation with a
//! signalfd, a position io area, and one output port's buffers. Writing
//! the rt eventfd then drives a real cycle through the client's data
//! loop, and the shared memory shows the results.

use parking_lot::Mutex;
use segue_core::activation::{
    position_state, status, ActivationRecord, Fraction, PositionBlock,
};
use segue_core::{ids, IoBuffers, PortFlags, INVALID_ID};
use segue_node::client::Client;
use segue_node::config::ClientConfig;
use segue_node::connection::{self, ConnTx};
use segue_node::mem::{MemMap, MemPool};
use segue_node::protocol::{
    BufferDesc, ClientRequest, DataDesc, DataKind, IoKind, NodeCommand, ServerEvent, WireDirection,
};
use std::fs::File;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const NODE_ID: u32 = 7;
const DRIVER_ID: u32 = 42;
const FRAMES: u64 = 256;
const RATE: u32 = 48000;

struct MockServer {
    tx: Arc<Mutex<ConnTx>>,
    handle: Option<JoinHandle<()>>,
}

impl MockServer {
    fn start() -> (UnixStream, MockServer) {
        let (client_side, server_side) = UnixStream::pair().unwrap();
        let (tx, mut rx) = connection::split(server_side).unwrap();
        let tx = Arc::new(Mutex::new(tx));
        let loop_tx = tx.clone();
        let handle = std::thread::spawn(move || loop {
            match rx.recv::<ClientRequest>(Duration::from_millis(20)) {
                Ok(None) => continue,
                Ok(Some(ClientRequest::Sync { seq })) => {
                    let _ = loop_tx.lock().send(&ServerEvent::Done { seq });
                }
                Ok(Some(_)) => {}
                Err(_) => break,
            }
        });
        (client_side, MockServer { tx, handle: Some(handle) })
    }

    fn send(&self, event: &ServerEvent) {
        self.tx.lock().send(event).unwrap();
    }

    fn send_with_fds(&self, event: &ServerEvent, fds: &[RawFd]) {
        self.tx.lock().send_with_fds(event, fds).unwrap();
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

/// A pool block backed by a temp file, mapped on the server side too.
struct Block {
    file: File,
    map: MemMap,
    size: u32,
}

fn make_block(pool: &mut MemPool, id: u32, size: u32) -> Block {
    let file = tempfile::tempfile().unwrap();
    file.set_len(65536).unwrap();
    let fd = OwnedFd::from(file.try_clone().unwrap());
    pool.add_block(id, 0, 0, fd);
    let map = pool.map(id, 0, size, None).unwrap();
    Block { file, map, size }
}

fn eventfd() -> OwnedFd {
    // Safety: plain eventfd creation; ownership transferred immediately.
    let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
    assert!(fd >= 0);
    unsafe { <OwnedFd as std::os::fd::FromRawFd>::from_raw_fd(fd) }
}

fn eventfd_write(fd: &OwnedFd, value: u64) {
    // Safety: 8-byte write to an eventfd we own.
    let n = unsafe {
        libc::write(fd.as_raw_fd(), &value as *const u64 as *const libc::c_void, 8)
    };
    assert_eq!(n, 8);
}

fn eventfd_read(fd: &OwnedFd) -> Option<u64> {
    let mut value: u64 = 0;
    // Safety: 8-byte read from an eventfd we own.
    let n = unsafe {
        libc::read(fd.as_raw_fd(), &mut value as *mut u64 as *mut libc::c_void, 8)
    };
    (n == 8).then_some(value)
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

fn test_config(name: &str) -> ClientConfig {
    ClientConfig {
        name: name.into(),
        socket_path: "/nonexistent".into(),
        latency: "1024/48000".into(),
        no_start_server: true,
        node_restrict: None,
        disabled: false,
    }
}

#[test]
fn test_full_cycle_through_shared_memory() {
    let (stream, server) = MockServer::start();
    let client = Client::open_on_stream(test_config("cycle"), stream).unwrap();

    let mut pool = MemPool::new();
    let act_size = std::mem::size_of::<ActivationRecord>() as u32;
    let pos_size = std::mem::size_of::<PositionBlock>() as u32;

    let own_block = make_block(&mut pool, 1, act_size);
    let driver_block = make_block(&mut pool, 2, act_size);
    let pos_block = make_block(&mut pool, 3, pos_size);
    let buf_block = make_block(&mut pool, 4, 8192);
    let io_block = make_block(&mut pool, 5, 8);

    // Safety: freshly mapped, zero-initialized activation records.
    let own_act: &ActivationRecord = unsafe { &*own_block.map.ptr_as() };
    let driver_act: &ActivationRecord = unsafe { &*driver_block.map.ptr_as() };

    // the driver owes us one trigger per cycle
    driver_act.state[0].required.store(1, Ordering::Relaxed);
    driver_act.state[0].pending.store(1, Ordering::Relaxed);

    let mut pos = PositionBlock::default();
    pos.state = position_state::RUNNING;
    pos.clock.id = DRIVER_ID;
    pos.clock.nsec = 1_000;
    pos.clock.duration = FRAMES;
    pos.clock.position = 0;
    pos.clock.rate = Fraction { num: 1, denom: RATE };
    pos.n_segments = 1;
    pos.segments[0].rate = 1.0;
    // Safety: writing the position block through our own mapping.
    unsafe { std::ptr::write_volatile(pos_block.map.ptr_as::<PositionBlock>(), pos) };

    // transport: activation plus the rt eventfd pair
    let rt_read = eventfd();
    let rt_write = eventfd();
    server.send_with_fds(
        &ServerEvent::AddMem { mem_id: 1, kind: 0, flags: 0 },
        &[own_block.file.as_raw_fd()],
    );
    server.send_with_fds(
        &ServerEvent::Transport { node_id: NODE_ID, mem_id: 1, offset: 0, size: act_size },
        &[rt_read.as_raw_fd(), rt_write.as_raw_fd()],
    );

    // peer (driver) activation with its signalfd
    let signal = eventfd();
    server.send_with_fds(
        &ServerEvent::AddMem { mem_id: 2, kind: 0, flags: 0 },
        &[driver_block.file.as_raw_fd()],
    );
    server.send_with_fds(
        &ServerEvent::SetActivation {
            node_id: DRIVER_ID,
            mem_id: 2,
            offset: 0,
            size: act_size,
        },
        &[signal.as_raw_fd()],
    );

    // position io binds the driver
    server.send_with_fds(
        &ServerEvent::AddMem { mem_id: 3, kind: 0, flags: 0 },
        &[pos_block.file.as_raw_fd()],
    );
    server.send(&ServerEvent::SetIo {
        id: IoKind::Position,
        mem_id: 3,
        offset: 0,
        size: pos_size,
    });

    // one audio output port with one buffer and an io area
    let out = client
        .port_register("out", ids::DEFAULT_AUDIO_TYPE, PortFlags::IS_OUTPUT, 0)
        .unwrap();

    server.send_with_fds(
        &ServerEvent::AddMem { mem_id: 4, kind: 0, flags: 0 },
        &[buf_block.file.as_raw_fd()],
    );
    server.send(&ServerEvent::PortUseBuffers {
        direction: WireDirection::Output,
        port_id: 0,
        mix_id: INVALID_ID,
        flags: 0,
        buffers: vec![BufferDesc {
            mem_id: 4,
            offset: 0,
            size: 4096,
            metas: vec![],
            datas: vec![DataDesc {
                kind: DataKind::MemPtr { offset: 64 },
                flags: 0,
                mapoffset: 0,
                maxsize: 2048,
            }],
        }],
    });
    server.send_with_fds(
        &ServerEvent::AddMem { mem_id: 5, kind: 0, flags: 0 },
        &[io_block.file.as_raw_fd()],
    );
    server.send(&ServerEvent::PortSetIo {
        direction: WireDirection::Output,
        port_id: 0,
        mix_id: INVALID_ID,
        id: IoKind::Buffers,
        mem_id: 5,
        offset: 0,
        size: io_block.size,
    });
    server.send(&ServerEvent::Command(NodeCommand::Start));

    let processed = Arc::new(AtomicU32::new(0));
    let init_ran = Arc::new(AtomicBool::new(false));
    {
        let rt = client.clone();
        let processed = processed.clone();
        client
            .set_process_callback(move |frames| {
                if let Some(buffer) = rt.port_get_buffer(out, frames) {
                    let samples = buffer.as_audio().unwrap();
                    for (i, s) in samples.iter_mut().enumerate() {
                        *s = i as f32;
                    }
                }
                processed.store(frames, Ordering::Release);
                0
            })
            .unwrap();
        let init_ran = init_ran.clone();
        client
            .set_thread_init_callback(move || init_ran.store(true, Ordering::Release))
            .unwrap();
    }

    // activate syncs, so every event above has been applied when it
    // returns
    client.activate().unwrap();

    // one wakeup, one cycle; our rt_read handle shares the eventfd
    // object with the descriptor the client received
    eventfd_write(&rt_read, 1);

    assert!(wait_until(|| processed.load(Ordering::Acquire) == FRAMES as u32));
    assert!(init_ran.load(Ordering::Acquire));

    // our activation went through AWAKE to FINISHED
    assert!(wait_until(|| own_act.status.load(Ordering::Relaxed) == status::FINISHED));
    let awake = own_act.awake_time.load(Ordering::Relaxed);
    let finish = own_act.finish_time.load(Ordering::Relaxed);
    assert_eq!(awake, 1_000);
    assert!(finish >= awake);

    // the driver was triggered and signalled after we finished
    assert!(wait_until(|| {
        driver_act.status.load(Ordering::Relaxed) == status::TRIGGERED
    }));
    let signal_time = driver_act.signal_time.load(Ordering::Relaxed);
    assert!(signal_time >= finish);
    assert_eq!(driver_act.state[0].pending.load(Ordering::Relaxed), 0);
    assert_eq!(eventfd_read(&signal), Some(1));

    // the io area advertises the filled buffer
    let io: IoBuffers = unsafe { std::ptr::read_volatile(io_block.map.ptr_as()) };
    assert_eq!(io.status, segue_core::activation::io_status::HAVE_DATA);
    assert_eq!(io.buffer_id, 0);

    // chunk header stamped, samples written through shared memory
    let chunk_words: &[u32] =
        unsafe { std::slice::from_raw_parts(buf_block.map.ptr_as::<u32>(), 4) };
    assert_eq!(chunk_words[1], FRAMES as u32 * 4);
    let samples: &[f32] = unsafe {
        std::slice::from_raw_parts(buf_block.map.ptr().add(64) as *const f32, FRAMES as usize)
    };
    assert_eq!(samples[0], 0.0);
    assert_eq!(samples[255], 255.0);

    client.deactivate().unwrap();
    client.close();
}

#[test]
fn test_pause_gates_wakeups() {
    let (stream, server) = MockServer::start();
    let client = Client::open_on_stream(test_config("pause"), stream).unwrap();

    let mut pool = MemPool::new();
    let act_size = std::mem::size_of::<ActivationRecord>() as u32;
    let pos_size = std::mem::size_of::<PositionBlock>() as u32;
    let own_block = make_block(&mut pool, 1, act_size);
    let pos_block = make_block(&mut pool, 3, pos_size);

    let mut pos = PositionBlock::default();
    pos.clock.duration = FRAMES;
    pos.clock.rate = Fraction { num: 1, denom: RATE };
    unsafe { std::ptr::write_volatile(pos_block.map.ptr_as::<PositionBlock>(), pos) };

    let rt_read = eventfd();
    let rt_write = eventfd();
    server.send_with_fds(
        &ServerEvent::AddMem { mem_id: 1, kind: 0, flags: 0 },
        &[own_block.file.as_raw_fd()],
    );
    server.send_with_fds(
        &ServerEvent::Transport { node_id: NODE_ID, mem_id: 1, offset: 0, size: act_size },
        &[rt_read.as_raw_fd(), rt_write.as_raw_fd()],
    );
    server.send_with_fds(
        &ServerEvent::AddMem { mem_id: 3, kind: 0, flags: 0 },
        &[pos_block.file.as_raw_fd()],
    );
    server.send(&ServerEvent::SetIo {
        id: IoKind::Position,
        mem_id: 3,
        offset: 0,
        size: pos_size,
    });

    let processed = Arc::new(AtomicU32::new(0));
    let seen = processed.clone();
    client
        .set_process_callback(move |f| {
            seen.fetch_add(f.max(1), Ordering::AcqRel);
            0
        })
        .unwrap();

    // never started: wakeups do nothing
    client.activate().unwrap();
    eventfd_write(&rt_read, 1);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(processed.load(Ordering::Acquire), 0);

    // started: wakeups process
    server.send(&ServerEvent::Command(NodeCommand::Start));
    assert!(wait_until(|| {
        eventfd_write(&rt_read, 1);
        processed.load(Ordering::Acquire) > 0
    }));

    // paused again: the counter settles
    server.send(&ServerEvent::Command(NodeCommand::Pause));
    std::thread::sleep(Duration::from_millis(50));
    let settled = processed.load(Ordering::Acquire);
    eventfd_write(&rt_read, 1);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(processed.load(Ordering::Acquire), settled);

    client.deactivate().unwrap();
    client.close();
}
