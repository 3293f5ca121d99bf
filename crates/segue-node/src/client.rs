//! Client orchestration and the legacy-compatible API surface.
//!
//! A [`Client`] owns three threads' worth of machinery: the calling
//! application threads (every public method), the thread loop that
//! dispatches server events, and the realtime data loop. Public methods
//! that talk to the server take the control lock for the duration of the
//! call, including the `sync` round-trip; the realtime path never touches
//! that lock.

use crate::buffers::{self, select_mix2};
use crate::config::{ClientConfig, OpenFlags};
use crate::connection::{self, ConnRx, ConnTx};
use crate::error::{NodeError, OpenError, Result, Status};
use crate::mem::MemPool;
use crate::node::EventCtx;
use crate::process::{self, DataLoopCtl, Invoke};
use crate::protocol::{
    keys, port_params, ClientRequest, Dict, PortInfoUpdate, ServerEvent, NODE_FLAG_RT,
    PORT_FLAG_NO_REF,
};
use crate::registry::{Notify, ObjKey, ObjectBody, PortEntry, Registry};
use crate::state::{ClientFlags, NodeState};
use crate::threads::{self, ClientThread, ThreadBody};
use crate::mem::TaggedMaps;
use crossbeam_channel::Receiver;
use parking_lot::{Condvar, Mutex, MutexGuard};
use segue_core::activation::{command, NSEC_PER_SEC, NSEC_PER_USEC, USEC_PER_SEC};
use segue_core::ids::LatencyMode;
use segue_core::transport::{decode_position, position_valid, TransportPosition, TransportState};
use segue_core::{
    Direction, LatencyRange, PortFlags, PortType, CONNECTIONS_PER_PORT, DEFAULT_BUFFER_FRAMES,
    DEFAULT_SAMPLE_RATE, INVALID_ID, MAX_BUFFER_FRAMES, MAX_PORTS, PORT_MAX,
};
use segue_midi::MidiBufferRef;
use std::cell::UnsafeCell;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, trace, warn};

/// Namespace bit for client uuids.
const CLIENT_UUID_BASE: u64 = 0x2;
/// Namespace bit for port uuids.
const PORT_UUID_BASE: u64 = 0x1;

const LOOP_TICK: Duration = Duration::from_millis(100);

/// Handle to a port, local or foreign. Copyable; stays valid (as a
/// tombstoned entry) until the client goes away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Port {
    pub(crate) key: ObjKey,
    pub(crate) local: Option<(Direction, u32)>,
    pub(crate) type_id: PortType,
}

/// What `port_get_buffer` hands the application for one cycle.
pub enum PortBuffer<'a> {
    Audio(&'a mut [f32]),
    Midi(MidiBufferRef<'a>),
}

impl<'a> PortBuffer<'a> {
    pub fn as_audio(self) -> Option<&'a mut [f32]> {
        match self {
            PortBuffer::Audio(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_midi(self) -> Option<MidiBufferRef<'a>> {
        match self {
            PortBuffer::Midi(m) => Some(m),
            _ => None,
        }
    }
}

/// Snapshot returned by [`Client::get_cycle_times`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CycleTimes {
    pub current_frames: u32,
    pub current_usecs: u64,
    pub next_usecs: u64,
    pub period_usecs: f32,
}

pub(crate) struct Control {
    pub tx: Option<ConnTx>,
    pub seq: u32,
    pub last_sync: u32,
    pub registry: Registry,
    pub mem: MemPool,
    pub io_maps: TaggedMaps,
    pub loop_thread: Option<JoinHandle<()>>,
    pub data_thread: Option<JoinHandle<()>>,
}

pub struct ClientInner {
    pub(crate) config: ClientConfig,
    pub(crate) control: Mutex<Control>,
    pub(crate) sync_cond: Condvar,
    pub(crate) state: UnsafeCell<NodeState>,
    pub(crate) flags: ClientFlags,
    pub(crate) data_running: AtomicBool,
    pub(crate) data_loop: DataLoopCtl,
    pub(crate) invoke_rx: Receiver<Invoke>,
    user_refs: AtomicU32,
}

// Safety: NodeState is only mutated by the data loop and, at
// server-sequenced reconfiguration points, by the thread loop under the
// control lock; everything else in here is a lock, a channel or an
// atomic.
unsafe impl Send for ClientInner {}
unsafe impl Sync for ClientInner {}

/// A connected client. Cloning hands out another handle to the same
/// client; the last handle dropped closes it.
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish()
    }
}

impl Clone for Client {
    fn clone(&self) -> Client {
        self.inner.user_refs.fetch_add(1, Ordering::AcqRel);
        Client { inner: self.inner.clone() }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if self.inner.user_refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.close_internal();
        }
    }
}

/// Current monotonic time in microseconds; the clock every frame/time
/// conversion is defined against.
pub fn get_time() -> u64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // Safety: plain clock query into a local.
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * USEC_PER_SEC + ts.tv_nsec as u64 / NSEC_PER_USEC
}

impl Client {
    /// Open a client by name, environment-configured.
    pub fn open(name: &str, options: OpenFlags) -> std::result::Result<Client, OpenError> {
        Self::open_with_config(options, ClientConfig::from_env(name))
    }

    /// Legacy `client_new` behavior: exact name, and no server start
    /// unless the environment asks for it.
    pub fn new(name: &str) -> std::result::Result<Client, OpenError> {
        let mut options = OpenFlags::USE_EXACT_NAME;
        if std::env::var_os("JACK_START_SERVER").is_none() {
            options = options | OpenFlags::NO_START_SERVER;
        }
        Self::open(name, options)
    }

    pub fn open_with_config(
        options: OpenFlags,
        config: ClientConfig,
    ) -> std::result::Result<Client, OpenError> {
        if config.disabled {
            return Err(OpenError::new(
                Status::FAILURE | Status::SERVER_FAILED,
                "disabled by environment",
            ));
        }
        debug!(name = %config.name, ?options, "open");
        let stream = UnixStream::connect(&config.socket_path).map_err(|e| {
            OpenError::new(
                Status::FAILURE | Status::SERVER_FAILED,
                format!("can't reach server at {:?}: {e}", config.socket_path),
            )
        })?;
        Self::open_on_stream(config, stream)
    }

    /// Open over an established stream. The entry point mock-server tests
    /// use; `open_with_config` funnels here.
    pub fn open_on_stream(
        config: ClientConfig,
        stream: UnixStream,
    ) -> std::result::Result<Client, OpenError> {
        let init_err =
            |reason: String| OpenError::new(Status::FAILURE | Status::INIT_FAILURE, reason);

        let (tx, rx_conn) =
            connection::split(stream).map_err(|e| init_err(format!("transport setup: {e}")))?;
        let (ctl, invoke_rx) =
            process::make_ctl().map_err(|e| init_err(format!("data loop setup: {e}")))?;

        let inner = Arc::new(ClientInner {
            control: Mutex::new(Control {
                tx: Some(tx),
                seq: 0,
                last_sync: 0,
                registry: Registry::new(),
                mem: MemPool::new(),
                io_maps: TaggedMaps::new(),
                loop_thread: None,
                data_thread: None,
            }),
            sync_cond: Condvar::new(),
            state: UnsafeCell::new(NodeState::new(select_mix2())),
            flags: ClientFlags::default(),
            data_running: AtomicBool::new(false),
            data_loop: ctl,
            invoke_rx,
            user_refs: AtomicU32::new(1),
            config,
        });

        let loop_inner = inner.clone();
        let loop_thread = std::thread::Builder::new()
            .name(format!("{}-loop", inner.config.name))
            .spawn(move || thread_loop_main(loop_inner, rx_conn))
            .map_err(|e| init_err(format!("thread loop spawn: {e}")))?;
        inner.control.lock().loop_thread = Some(loop_thread);

        let client = Client { inner };
        {
            let mut control = client.inner.control.lock();
            let name = client.inner.config.name.clone();
            let latency = client.inner.config.latency.clone();
            client
                .handshake(&mut control, &name, &latency)
                .map_err(|e| init_err(e.to_string()))?;
        }
        trace!("client open");
        Ok(client)
    }

    fn handshake(
        &self,
        control: &mut MutexGuard<'_, Control>,
        name: &str,
        latency: &str,
    ) -> Result<()> {
        send(control, &ClientRequest::Hello {
            name: name.to_string(),
            props: vec![(keys::CLIENT_API.into(), "jack".into())],
        })?;
        send(control, &ClientRequest::GetRegistry)?;
        send(control, &ClientRequest::CreateObject {
            factory: "client-node".into(),
            props: vec![
                (keys::NODE_NAME.into(), name.to_string()),
                (keys::MEDIA_TYPE.into(), "Audio".into()),
                (keys::MEDIA_CATEGORY.into(), "Duplex".into()),
                (keys::MEDIA_ROLE.into(), "DSP".into()),
                (keys::NODE_LATENCY.into(), latency.to_string()),
                (keys::NODE_ALWAYS_PROCESS.into(), "1".into()),
            ],
        })?;
        send(control, &ClientRequest::UpdateInfo {
            max_input_ports: MAX_PORTS as u32,
            max_output_ports: MAX_PORTS as u32,
            flags: NODE_FLAG_RT,
            props: vec![],
        })?;
        self.do_sync(control)
    }

    /// Round-trip to the server: send a sync and wait for its done.
    fn do_sync(&self, control: &mut MutexGuard<'_, Control>) -> Result<()> {
        control.seq = control.seq.wrapping_add(1);
        let seq = control.seq;
        send(control, &ClientRequest::Sync { seq })?;
        loop {
            if self.inner.flags.error.load(Ordering::Acquire) {
                return Err(NodeError::Disconnected);
            }
            if control.last_sync == seq {
                return Ok(());
            }
            self.inner.sync_cond.wait(control);
        }
    }

    // Safety: callers hold the control lock (control-side accessors) or
    // run on the realtime path (buffer/time accessors), matching the
    // NodeState access contract.
    #[allow(clippy::mut_from_ref)]
    fn state(&self) -> &mut NodeState {
        unsafe { &mut *self.inner.state.get() }
    }

    fn close_internal(&self) {
        if self.inner.flags.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("close");
        self.inner.data_running.store(false, Ordering::Release);
        self.inner.data_loop.wake();

        let (loop_thread, data_thread) = {
            let mut control = self.inner.control.lock();
            control.tx = None;
            (control.loop_thread.take(), control.data_thread.take())
        };
        if let Some(t) = data_thread {
            let _ = t.join();
        }
        if let Some(t) = loop_thread {
            let _ = t.join();
        }
        // callbacks routinely capture client handles; with both loops
        // joined, dropping them here breaks the reference cycle
        self.state().callbacks = crate::state::Callbacks::default();
        debug!("closed");
    }

    /// Stop everything and disconnect. Remaining handles stay safe to
    /// call but report the connection as gone; closing also happens when
    /// the last handle is dropped.
    pub fn close(self) {
        self.close_internal();
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    fn do_activate(&self) -> Result<()> {
        if !self.inner.data_running.swap(true, Ordering::AcqRel) {
            let inner = self.inner.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{}-data", self.inner.config.name))
                .spawn(move || process::data_loop_main(inner))?;
            self.inner.control.lock().data_thread = Some(handle);
        }
        let mut control = self.inner.control.lock();
        debug!("activate");
        send(&mut control, &ClientRequest::SetActive { active: true })?;
        self.do_sync(&mut control)
    }

    pub fn activate(&self) -> Result<()> {
        if self.inner.flags.active.load(Ordering::Acquire) {
            return Ok(());
        }
        self.do_activate()?;
        if let Some(a) = self.state().activation.get() {
            a.pending_new_pos.store(1, Ordering::Release);
            a.pending_sync.store(1, Ordering::Release);
        }
        self.inner.flags.active.store(true, Ordering::Release);
        Ok(())
    }

    pub fn deactivate(&self) -> Result<()> {
        if !self.inner.flags.active.load(Ordering::Acquire) {
            return Ok(());
        }
        {
            let mut control = self.inner.control.lock();
            debug!("deactivate");
            send(&mut control, &ClientRequest::SetActive { active: false })?;
            if let Some(a) = self.state().activation.get() {
                a.pending_new_pos.store(0, Ordering::Release);
                a.pending_sync.store(0, Ordering::Release);
            }
            self.do_sync(&mut control)?;
        }
        self.stop_data_loop();
        self.inner.flags.active.store(false, Ordering::Release);
        Ok(())
    }

    fn stop_data_loop(&self) {
        if self.inner.data_running.swap(false, Ordering::AcqRel) {
            self.inner.data_loop.wake();
            let handle = self.inner.control.lock().data_thread.take();
            if let Some(t) = handle {
                let _ = t.join();
            }
        }
    }

    // ------------------------------------------------------------------
    // callbacks
    // ------------------------------------------------------------------

    fn with_callbacks<R>(&self, f: impl FnOnce(&mut crate::state::Callbacks) -> R) -> Result<R> {
        if self.inner.flags.active.load(Ordering::Acquire) {
            error!("can't set callback on an active client");
            return Err(NodeError::ActiveClient);
        }
        let _guard = self.inner.control.lock();
        Ok(f(&mut self.state().callbacks))
    }

    pub fn set_process_callback(
        &self,
        cb: impl FnMut(u32) -> i32 + Send + 'static,
    ) -> Result<()> {
        if self.state().callbacks.thread.is_some() {
            error!("thread callback was already set");
            return Err(NodeError::ActiveClient);
        }
        self.with_callbacks(|c| c.process = Some(Box::new(cb)))
    }

    /// Custom-thread mode: mutually exclusive with a process callback.
    pub fn set_process_thread(&self, cb: impl FnMut() + Send + 'static) -> Result<()> {
        if self.state().callbacks.process.is_some() {
            error!("process callback was already set");
            return Err(NodeError::ActiveClient);
        }
        self.with_callbacks(|c| c.thread = Some(Box::new(cb)))
    }

    pub fn set_thread_init_callback(&self, cb: impl FnMut() + Send + 'static) -> Result<()> {
        let _guard = self.inner.control.lock();
        self.state().callbacks.thread_init = Some(Box::new(cb));
        Ok(())
    }

    pub fn on_shutdown(&self, cb: impl FnMut() + Send + 'static) {
        if self.inner.flags.active.load(Ordering::Acquire) {
            error!("can't set callback on an active client");
            return;
        }
        let _guard = self.inner.control.lock();
        self.state().callbacks.shutdown = Some(Box::new(cb));
    }

    pub fn on_info_shutdown(&self, cb: impl FnMut(&str) + Send + 'static) {
        if self.inner.flags.active.load(Ordering::Acquire) {
            error!("can't set callback on an active client");
            return;
        }
        let _guard = self.inner.control.lock();
        self.state().callbacks.info_shutdown = Some(Box::new(cb));
    }

    pub fn set_freewheel_callback(&self, cb: impl FnMut(bool) + Send + 'static) -> Result<()> {
        self.with_callbacks(|c| c.freewheel = Some(Box::new(cb)))
    }

    pub fn set_buffer_size_callback(
        &self,
        cb: impl FnMut(u32) -> i32 + Send + 'static,
    ) -> Result<()> {
        self.with_callbacks(|c| c.buffer_size = Some(Box::new(cb)))
    }

    pub fn set_sample_rate_callback(
        &self,
        cb: impl FnMut(u32) -> i32 + Send + 'static,
    ) -> Result<()> {
        self.with_callbacks(|c| c.sample_rate = Some(Box::new(cb)))
    }

    pub fn set_client_registration_callback(
        &self,
        cb: impl FnMut(&str, bool) + Send + 'static,
    ) -> Result<()> {
        self.with_callbacks(|c| c.client_registration = Some(Box::new(cb)))
    }

    pub fn set_port_registration_callback(
        &self,
        cb: impl FnMut(u32, bool) + Send + 'static,
    ) -> Result<()> {
        self.with_callbacks(|c| c.port_registration = Some(Box::new(cb)))
    }

    pub fn set_port_connect_callback(
        &self,
        cb: impl FnMut(u32, u32, bool) + Send + 'static,
    ) -> Result<()> {
        self.with_callbacks(|c| c.port_connect = Some(Box::new(cb)))
    }

    pub fn set_port_rename_callback(
        &self,
        cb: impl FnMut(u32, &str, &str) + Send + 'static,
    ) -> Result<()> {
        self.with_callbacks(|c| c.port_rename = Some(Box::new(cb)))
    }

    pub fn set_graph_order_callback(
        &self,
        cb: impl FnMut() -> i32 + Send + 'static,
    ) -> Result<()> {
        self.with_callbacks(|c| c.graph_order = Some(Box::new(cb)))
    }

    pub fn set_xrun_callback(&self, cb: impl FnMut() -> i32 + Send + 'static) -> Result<()> {
        self.with_callbacks(|c| c.xrun = Some(Box::new(cb)))
    }

    pub fn set_latency_callback(
        &self,
        cb: impl FnMut(LatencyMode) + Send + 'static,
    ) -> Result<()> {
        self.with_callbacks(|c| c.latency = Some(Box::new(cb)))
    }

    // ------------------------------------------------------------------
    // ports
    // ------------------------------------------------------------------

    pub fn port_register(
        &self,
        port_name: &str,
        port_type: &str,
        flags: PortFlags,
        _buffer_frames: u64,
    ) -> Result<Port> {
        debug!(port_name, port_type, %flags, "port register");
        let direction = flags
            .direction()
            .ok_or_else(|| NodeError::InvalidArgument("port needs a direction flag".into()))?;
        let type_id = PortType::from_type_string(port_type)
            .ok_or_else(|| NodeError::InvalidArgument(format!("unknown port type {port_type}")))?;

        let mut control = self.inner.control.lock();
        let state = self.state();

        let index = state
            .ports
            .alloc(direction)
            .ok_or(NodeError::Exhausted("ports"))?;
        let full_name = format!("{}:{}", self.inner.config.name, port_name);
        let key = control.registry.add_local_port(PortEntry {
            flags,
            name: full_name,
            type_id,
            node_id: state.node_id,
            port_id: index,
            ..PortEntry::default()
        });
        let port = state.ports.port_mut(direction, index);
        port.object = Some(key);
        port.type_id = type_id;

        send(&mut control, &ClientRequest::PortUpdate {
            direction: direction.into(),
            port_id: index,
            params: port_params(type_id, None),
            info: Some(PortInfoUpdate {
                flags: PORT_FLAG_NO_REF,
                props: vec![
                    (keys::FORMAT_DSP.into(), port_type.to_string()),
                    (keys::PORT_NAME.into(), port_name.to_string()),
                ],
            }),
        })?;
        self.do_sync(&mut control)?;

        Ok(Port { key, local: Some((direction, index)), type_id })
    }

    pub fn port_unregister(&self, port: Port) -> Result<()> {
        let (direction, index) = port
            .local
            .ok_or_else(|| NodeError::InvalidArgument("not our port".into()))?;
        debug!(index, "port unregister");

        let mut control = self.inner.control.lock();
        self.state().ports.release(direction, index);
        control.registry.remove_local(port.key);

        send(&mut control, &ClientRequest::PortUpdate {
            direction: direction.into(),
            port_id: index,
            params: vec![],
            info: None,
        })?;
        self.do_sync(&mut control)
    }

    /// The per-cycle buffer for one of our ports. Must be called from the
    /// process cycle; foreign ports have no buffer here.
    pub fn port_get_buffer(&self, port: Port, frames: u32) -> Option<PortBuffer<'_>> {
        let (direction, index) = match port.local {
            Some(l) => l,
            None => {
                error!("port_get_buffer on a foreign port");
                return None;
            }
        };
        let state = self.state();
        let ptr = buffers::port_buffer(state, direction, index, frames);
        trace!(index, ?ptr, "port buffer");
        if port.type_id == PortType::Midi {
            // Safety: ptr covers the full scratch area used for MIDI.
            let bytes = unsafe {
                std::slice::from_raw_parts_mut(
                    ptr as *mut u8,
                    MAX_BUFFER_FRAMES * std::mem::size_of::<f32>(),
                )
            };
            Some(PortBuffer::Midi(MidiBufferRef::from_raw(bytes)))
        } else {
            // Safety: every path hands back at least `frames` floats.
            let samples = unsafe { std::slice::from_raw_parts_mut(ptr, frames as usize) };
            Some(PortBuffer::Audio(samples))
        }
    }

    fn with_port_entry<R>(&self, port: Port, f: impl FnOnce(&PortEntry) -> R) -> Option<R> {
        let control = self.inner.control.lock();
        control.registry.port(port.key).map(f)
    }

    fn with_port_entry_mut<R>(&self, port: Port, f: impl FnOnce(&mut PortEntry) -> R) -> Option<R> {
        let mut control = self.inner.control.lock();
        control.registry.port_mut(port.key).map(f)
    }

    pub fn port_name(&self, port: Port) -> Option<String> {
        self.with_port_entry(port, |p| p.name.clone())
    }

    pub fn port_short_name(&self, port: Port) -> Option<String> {
        self.with_port_entry(port, |p| {
            p.name.split_once(':').map(|(_, s)| s.to_string()).unwrap_or_default()
        })
    }

    pub fn port_flags(&self, port: Port) -> PortFlags {
        self.with_port_entry(port, |p| p.flags).unwrap_or_default()
    }

    pub fn port_type(&self, port: Port) -> &'static str {
        port.type_id.type_string()
    }

    pub fn port_type_id(&self, port: Port) -> u32 {
        port.type_id.id()
    }

    pub fn port_is_mine(&self, port: Port) -> bool {
        port.local.is_some()
    }

    pub fn port_uuid(&self, port: Port) -> u64 {
        let control = self.inner.control.lock();
        let id = control.registry.get(port.key).map(|o| o.id).unwrap_or(INVALID_ID);
        (PORT_UUID_BASE << 32) | id as u64
    }

    pub fn port_by_name(&self, name: &str) -> Option<Port> {
        let control = self.inner.control.lock();
        let key = control.registry.find_port_by_name(name)?;
        Some(make_handle(&control.registry, key))
    }

    pub fn port_by_id(&self, id: u32) -> Option<Port> {
        let control = self.inner.control.lock();
        let key = control.registry.lookup_global(id)?;
        match &control.registry.get(key)?.body {
            ObjectBody::Port(_) => Some(make_handle(&control.registry, key)),
            _ => None,
        }
    }

    pub fn port_connected(&self, port: Port) -> usize {
        let control = self.inner.control.lock();
        let id = match control.registry.get(port.key) {
            Some(o) => o.id,
            None => return 0,
        };
        control
            .registry
            .live_links()
            .filter(|(_, _, l)| l.src == id || l.dst == id)
            .count()
    }

    pub fn port_connected_to(&self, port: Port, other_name: &str) -> bool {
        let control = self.inner.control.lock();
        let Some(this) = control.registry.get(port.key) else { return false };
        let Some(other_key) = control.registry.find_port_by_name(other_name) else {
            return false;
        };
        let other = control.registry.get(other_key).unwrap();
        let (this_entry, other_entry) =
            match (control.registry.port(port.key), control.registry.port(other_key)) {
                (Some(a), Some(b)) => (a, b),
                _ => return false,
            };
        if this_entry.flags.direction() == other_entry.flags.direction() {
            return false;
        }
        let (src, dst) = if other_entry.flags.contains(PortFlags::IS_OUTPUT) {
            (other.id, this.id)
        } else {
            (this.id, other.id)
        };
        control.registry.find_link(src, dst).is_some()
    }

    pub fn port_get_connections(&self, port: Port) -> Vec<String> {
        let control = self.inner.control.lock();
        let Some(this) = control.registry.get(port.key) else { return Vec::new() };
        let id = this.id;
        let mut out = Vec::new();
        for (_, _, link) in control.registry.live_links() {
            let peer = if link.src == id {
                link.dst
            } else if link.dst == id {
                link.src
            } else {
                continue;
            };
            let Some(peer_key) = control.registry.lookup_global(peer) else { continue };
            if let Some(p) = control.registry.port(peer_key) {
                out.push(p.name.clone());
                if out.len() == CONNECTIONS_PER_PORT {
                    break;
                }
            }
        }
        out
    }

    pub fn port_get_all_connections(&self, port: Port) -> Vec<String> {
        self.port_get_connections(port)
    }

    pub fn port_set_alias(&self, port: Port, alias: &str) -> Result<()> {
        let (key_name, direction, index) = {
            let mut control = self.inner.control.lock();
            let entry = control
                .registry
                .port_mut(port.key)
                .ok_or_else(|| NodeError::InvalidArgument("bad port".into()))?;
            let key_name = if entry.alias1.is_empty() {
                entry.alias1 = alias.to_string();
                keys::OBJECT_PATH
            } else if entry.alias2.is_empty() {
                entry.alias2 = alias.to_string();
                keys::PORT_ALIAS
            } else {
                return Err(NodeError::InvalidArgument("both aliases taken".into()));
            };
            let (direction, index) = port
                .local
                .ok_or_else(|| NodeError::InvalidArgument("not our port".into()))?;
            (key_name, direction, index)
        };
        self.send_port_props(direction, index, vec![(key_name.into(), alias.into())])
    }

    pub fn port_unset_alias(&self, port: Port, alias: &str) -> Result<()> {
        let (key_name, direction, index) = {
            let mut control = self.inner.control.lock();
            let entry = control
                .registry
                .port_mut(port.key)
                .ok_or_else(|| NodeError::InvalidArgument("bad port".into()))?;
            let key_name = if entry.alias1 == alias {
                entry.alias1.clear();
                keys::OBJECT_PATH
            } else if entry.alias2 == alias {
                entry.alias2.clear();
                keys::PORT_ALIAS
            } else {
                return Err(NodeError::NotFound(format!("alias {alias}")));
            };
            let (direction, index) = port
                .local
                .ok_or_else(|| NodeError::InvalidArgument("not our port".into()))?;
            (key_name, direction, index)
        };
        self.send_port_props(direction, index, vec![(key_name.into(), String::new())])
    }

    pub fn port_get_aliases(&self, port: Port) -> Vec<String> {
        self.with_port_entry(port, |p| {
            [&p.alias1, &p.alias2]
                .into_iter()
                .filter(|a| !a.is_empty())
                .cloned()
                .collect()
        })
        .unwrap_or_default()
    }

    pub fn port_rename(&self, port: Port, new_name: &str) -> Result<()> {
        let (direction, index) = port
            .local
            .ok_or_else(|| NodeError::InvalidArgument("not our port".into()))?;
        self.send_port_props(direction, index, vec![(keys::PORT_NAME.into(), new_name.into())])
    }

    fn send_port_props(&self, direction: Direction, index: u32, props: Dict) -> Result<()> {
        let mut control = self.inner.control.lock();
        send(&mut control, &ClientRequest::PortUpdate {
            direction: direction.into(),
            port_id: index,
            params: vec![],
            info: Some(PortInfoUpdate { flags: PORT_FLAG_NO_REF, props }),
        })
    }

    pub fn port_request_monitor(&self, port: Port, onoff: bool) -> Result<()> {
        self.with_port_entry_mut(port, |p| {
            if onoff {
                p.monitor_requests += 1;
            } else if p.monitor_requests > 0 {
                p.monitor_requests -= 1;
            }
        })
        .ok_or_else(|| NodeError::InvalidArgument("bad port".into()))
    }

    pub fn port_request_monitor_by_name(&self, name: &str, onoff: bool) -> Result<()> {
        let port = self
            .port_by_name(name)
            .ok_or_else(|| NodeError::NotFound(name.to_string()))?;
        self.port_request_monitor(port, onoff)
    }

    pub fn port_ensure_monitor(&self, port: Port, onoff: bool) -> Result<()> {
        self.with_port_entry_mut(port, |p| {
            if onoff {
                if p.monitor_requests == 0 {
                    p.monitor_requests = 1;
                }
            } else {
                p.monitor_requests = 0;
            }
        })
        .ok_or_else(|| NodeError::InvalidArgument("bad port".into()))
    }

    pub fn port_monitoring_input(&self, port: Port) -> bool {
        self.with_port_entry(port, |p| p.monitor_requests > 0).unwrap_or(false)
    }

    pub fn port_get_latency_range(&self, port: Port, mode: LatencyMode) -> LatencyRange {
        self.with_port_entry(port, |p| match mode {
            LatencyMode::Capture => p.capture_latency,
            LatencyMode::Playback => p.playback_latency,
        })
        .unwrap_or_default()
    }

    pub fn port_set_latency_range(&self, port: Port, mode: LatencyMode, range: LatencyRange) {
        let _ = self.with_port_entry_mut(port, |p| match mode {
            LatencyMode::Capture => p.capture_latency = range,
            LatencyMode::Playback => p.playback_latency = range,
        });
    }

    /// Legacy whole-port latency setter.
    pub fn port_set_latency(&self, port: Port, frames: u32) {
        let range = LatencyRange::new(frames, frames);
        let flags = self.port_flags(port);
        if flags.contains(PortFlags::IS_OUTPUT) {
            self.port_set_latency_range(port, LatencyMode::Capture, range);
        }
        if flags.contains(PortFlags::IS_INPUT) {
            self.port_set_latency_range(port, LatencyMode::Playback, range);
        }
    }

    pub fn port_get_latency(&self, port: Port) -> u32 {
        let flags = self.port_flags(port);
        let range = if flags.contains(PortFlags::IS_OUTPUT) {
            self.port_get_latency_range(port, LatencyMode::Capture)
        } else {
            self.port_get_latency_range(port, LatencyMode::Playback)
        };
        (range.min + range.max) / 2
    }

    pub fn port_type_get_buffer_size(&self, port_type: &str) -> usize {
        match PortType::from_type_string(port_type) {
            Some(PortType::Audio) => self.get_buffer_size() as usize * 4,
            Some(PortType::Midi) => MAX_BUFFER_FRAMES * 4,
            Some(PortType::Video) => 320 * 240 * 4 * 4,
            _ => 0,
        }
    }

    pub fn get_ports(
        &self,
        port_name_pattern: Option<&str>,
        type_name_pattern: Option<&str>,
        flags: PortFlags,
    ) -> Vec<String> {
        let compile = |p: Option<&str>| -> Option<regex::Regex> {
            let p = p.filter(|p| !p.is_empty())?;
            match regex::Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(pattern = p, "bad port pattern: {e}");
                    Some(regex::Regex::new("$^").unwrap())
                }
            }
        };
        let name_re = compile(port_name_pattern);
        let type_re = compile(type_name_pattern);
        let restrict = self.inner.config.node_restrict;

        let control = self.inner.control.lock();
        let mut matches: Vec<(&PortEntry, u32)> = Vec::new();
        for (key, entry) in control.registry.live_ports() {
            if matches.len() == PORT_MAX {
                break;
            }
            if entry.type_id == PortType::Other {
                continue;
            }
            if !entry.flags.contains(flags) {
                continue;
            }
            if let Some(id) = restrict {
                if entry.node_id != id {
                    continue;
                }
            }
            if let Some(re) = &name_re {
                if !re.is_match(&entry.name) {
                    continue;
                }
            }
            if let Some(re) = &type_re {
                if !re.is_match(entry.type_id.type_string()) {
                    continue;
                }
            }
            let id = control.registry.get(key).map(|o| o.id).unwrap_or(INVALID_ID);
            matches.push((entry, id));
        }
        matches.sort_by(|(a, aid), (b, bid)| {
            a.type_id
                .cmp(&b.type_id)
                .then(b.priority.cmp(&a.priority))
                .then(aid.cmp(bid))
        });
        matches.into_iter().map(|(p, _)| p.name.clone()).collect()
    }

    // ------------------------------------------------------------------
    // connections
    // ------------------------------------------------------------------

    pub fn connect_ports(&self, source_port: &str, destination_port: &str) -> Result<()> {
        debug!(source_port, destination_port, "connect");
        let mut control = self.inner.control.lock();

        let (src_key, dst_key) = (
            control.registry.find_port_by_name(source_port),
            control.registry.find_port_by_name(destination_port),
        );
        let (Some(src_key), Some(dst_key)) = (src_key, dst_key) else {
            return Err(NodeError::InvalidArgument("unknown port".into()));
        };
        let src = control.registry.port(src_key).unwrap();
        let dst = control.registry.port(dst_key).unwrap();
        if !src.flags.contains(PortFlags::IS_OUTPUT)
            || !dst.flags.contains(PortFlags::IS_INPUT)
            || src.type_id != dst.type_id
        {
            return Err(NodeError::InvalidArgument(
                "direction or type mismatch".into(),
            ));
        }
        let (src_node, dst_node) = (src.node_id, dst.node_id);
        let (src_id, dst_id) = (
            control.registry.get(src_key).unwrap().id,
            control.registry.get(dst_key).unwrap().id,
        );

        send(&mut control, &ClientRequest::CreateLink {
            props: vec![
                (keys::LINK_OUTPUT_NODE.into(), src_node.to_string()),
                (keys::LINK_OUTPUT_PORT.into(), src_id.to_string()),
                (keys::LINK_INPUT_NODE.into(), dst_node.to_string()),
                (keys::LINK_INPUT_PORT.into(), dst_id.to_string()),
                (keys::OBJECT_LINGER.into(), "1".into()),
            ],
        })?;
        self.do_sync(&mut control)
    }

    pub fn disconnect_ports(&self, source_port: &str, destination_port: &str) -> Result<()> {
        let mut control = self.inner.control.lock();

        let (src_key, dst_key) = (
            control.registry.find_port_by_name(source_port),
            control.registry.find_port_by_name(destination_port),
        );
        let (Some(src_key), Some(dst_key)) = (src_key, dst_key) else {
            return Err(NodeError::InvalidArgument("unknown port".into()));
        };
        let src = control.registry.port(src_key).unwrap();
        let dst = control.registry.port(dst_key).unwrap();
        if !src.flags.contains(PortFlags::IS_OUTPUT) || !dst.flags.contains(PortFlags::IS_INPUT) {
            return Err(NodeError::InvalidArgument("direction mismatch".into()));
        }
        let (src_id, dst_id) = (
            control.registry.get(src_key).unwrap().id,
            control.registry.get(dst_key).unwrap().id,
        );
        debug!(src_id, dst_id, "disconnect");

        let link_key = control
            .registry
            .find_link(src_id, dst_id)
            .ok_or_else(|| NodeError::NotFound("link".into()))?;
        let link_id = control.registry.get(link_key).unwrap().id;

        send(&mut control, &ClientRequest::DestroyGlobal { id: link_id })?;
        self.do_sync(&mut control)
    }

    /// Tear down every link touching the port.
    pub fn port_disconnect(&self, port: Port) -> Result<()> {
        let mut control = self.inner.control.lock();
        let id = control
            .registry
            .get(port.key)
            .map(|o| o.id)
            .ok_or_else(|| NodeError::InvalidArgument("bad port".into()))?;
        let links: Vec<u32> = control
            .registry
            .live_links()
            .filter(|(_, _, l)| l.src == id || l.dst == id)
            .map(|(_, o, _)| o.id)
            .collect();
        for link_id in links {
            send(&mut control, &ClientRequest::DestroyGlobal { id: link_id })?;
        }
        self.do_sync(&mut control)
    }

    // ------------------------------------------------------------------
    // uuids and names
    // ------------------------------------------------------------------

    pub fn uuid_for_client_name(&self, client_name: &str) -> Option<String> {
        let control = self.inner.control.lock();
        let result = control
            .registry
            .live_nodes()
            .find(|(_, _, n)| n.name == client_name)
            .map(|(_, o, _)| ((CLIENT_UUID_BASE << 32) | o.id as u64).to_string());
        result
    }

    pub fn client_name_by_uuid(&self, uuid: &str) -> Option<String> {
        let uuid: u64 = uuid.parse().ok()?;
        let control = self.inner.control.lock();
        let result = control
            .registry
            .live_nodes()
            .find(|(_, o, _)| (CLIENT_UUID_BASE << 32) | o.id as u64 == uuid)
            .map(|(_, _, n)| n.name.clone());
        result
    }

    pub fn client_uuid(&self) -> String {
        self.state().node_id.to_string()
    }

    // ------------------------------------------------------------------
    // time and transport
    // ------------------------------------------------------------------

    pub fn get_sample_rate(&self) -> u32 {
        let rate = self.state().sample_rate;
        if rate == u32::MAX {
            DEFAULT_SAMPLE_RATE
        } else {
            rate
        }
    }

    pub fn get_buffer_size(&self) -> u32 {
        let frames = self.state().buffer_frames;
        if frames == u32::MAX {
            DEFAULT_BUFFER_FRAMES
        } else {
            frames
        }
    }

    /// Ask the server for a different quantum via the latency property.
    pub fn set_buffer_size(&self, frames: u32) -> Result<()> {
        let latency = format!("{}/{}", frames, self.get_sample_rate());
        let mut control = self.inner.control.lock();
        send(&mut control, &ClientRequest::UpdateInfo {
            max_input_ports: MAX_PORTS as u32,
            max_output_ports: MAX_PORTS as u32,
            flags: NODE_FLAG_RT,
            props: vec![(keys::NODE_LATENCY.into(), latency)],
        })
    }

    pub fn frames_since_cycle_start(&self) -> u32 {
        let Some(pos) = self.state().position_snapshot() else { return 0 };
        let now = get_time() * NSEC_PER_USEC;
        let diff = now.saturating_sub(pos.clock.nsec);
        ((self.get_sample_rate() as u64 * diff) / NSEC_PER_SEC) as u32
    }

    pub fn frame_time(&self) -> u32 {
        self.time_to_frames(get_time())
    }

    pub fn last_frame_time(&self) -> u32 {
        self.state()
            .position_snapshot()
            .map(|p| p.clock.position as u32)
            .unwrap_or(0)
    }

    pub fn get_cycle_times(&self) -> Result<CycleTimes> {
        let state = self.state();
        let pos = state.position_snapshot().ok_or(NodeError::NoDriver)?;
        Ok(CycleTimes {
            current_frames: pos.clock.position as u32,
            current_usecs: pos.clock.nsec / NSEC_PER_USEC,
            next_usecs: pos.clock.next_nsec / NSEC_PER_USEC,
            period_usecs: pos.clock.duration as f32 * USEC_PER_SEC as f32
                / (self.get_sample_rate() as f32 * pos.clock.rate_diff as f32),
        })
    }

    pub fn frames_to_time(&self, frames: u32) -> u64 {
        let Some(pos) = self.state().position_snapshot() else { return 0 };
        let df =
            (frames as f64 - pos.clock.position as f64) * NSEC_PER_SEC as f64
                / self.get_sample_rate() as f64;
        ((pos.clock.nsec as i64 + df.round() as i64) / NSEC_PER_USEC as i64) as u64
    }

    pub fn time_to_frames(&self, usecs: u64) -> u32 {
        let Some(pos) = self.state().position_snapshot() else { return 0 };
        let du = (usecs as f64 - (pos.clock.nsec / NSEC_PER_USEC) as f64)
            * self.get_sample_rate() as f64
            / USEC_PER_SEC as f64;
        (pos.clock.position as i64 + du.round() as i64) as u32
    }

    pub fn cpu_load(&self) -> f32 {
        self.state()
            .driver_activation
            .get()
            .map(|a| a.cpu_load(0) * 100.0)
            .unwrap_or(0.0)
    }

    pub fn transport_query(&self, pos: Option<&mut TransportPosition>) -> TransportState {
        let state = self.state();
        match state.driver_activation.get() {
            Some(driver) => {
                let driver_pos = driver.position();
                let owner = driver.segment_owner[0].load(Ordering::Acquire);
                match pos {
                    Some(dst) => decode_position(&driver_pos, owner, dst),
                    None => segue_core::transport::transport_state(&driver_pos),
                }
            }
            None => {
                if let Some(dst) = pos {
                    *dst = TransportPosition::default();
                }
                TransportState::Stopped
            }
        }
    }

    pub fn get_current_transport_frame(&self) -> u32 {
        let state = self.state();
        let Some(driver) = state.driver_activation.get() else { return 0 };
        let pos = driver.position();
        let mut running = pos.clock.position.wrapping_sub(pos.offset);
        if pos.state == segue_core::activation::position_state::RUNNING {
            let now = get_time() * NSEC_PER_USEC;
            let elapsed = now.saturating_sub(pos.clock.nsec);
            running += self.get_sample_rate() as u64 * elapsed / NSEC_PER_SEC;
        }
        let seg = &pos.segments[0];
        ((running.wrapping_sub(seg.start)) as f64 * seg.rate + seg.position as f64) as u32
    }

    pub fn transport_reposition(&self, pos: &TransportPosition) -> Result<()> {
        let state = self.state();
        let driver = state.driver_activation.get().ok_or(NodeError::NoDriver)?;
        let own = state.activation.get().ok_or(NodeError::NoDriver)?;
        if pos.valid & !(position_valid::BBT | position_valid::TIMECODE) != 0 {
            return Err(NodeError::InvalidArgument("unsupported position fields".into()));
        }
        debug!(frame = pos.frame, "reposition");
        own.reposition.flags.store(0, Ordering::Relaxed);
        own.reposition.start.store(0, Ordering::Relaxed);
        own.reposition.duration.store(0, Ordering::Relaxed);
        own.reposition.position.store(pos.frame as u64, Ordering::Relaxed);
        own.reposition.set_rate(1.0);
        driver.reposition_owner.store(state.node_id, Ordering::Release);
        Ok(())
    }

    pub fn transport_locate(&self, frame: u32) -> Result<()> {
        let pos = TransportPosition { frame, ..TransportPosition::default() };
        self.transport_reposition(&pos)
    }

    fn update_command(&self, cmd: u32) {
        if let Some(driver) = self.state().driver_activation.get() {
            driver.command.store(cmd, Ordering::Release);
        }
    }

    pub fn transport_start(&self) {
        self.update_command(command::START);
    }

    pub fn transport_stop(&self) {
        self.update_command(command::STOP);
    }

    pub fn set_sync_callback(
        &self,
        cb: impl FnMut(TransportState, &TransportPosition) -> bool + Send + 'static,
    ) -> Result<()> {
        {
            let _guard = self.inner.control.lock();
            self.state().callbacks.sync = Some(Box::new(cb));
        }
        self.do_activate()?;
        if let Some(a) = self.state().activation.get() {
            a.pending_sync.store(1, Ordering::Release);
        }
        Ok(())
    }

    pub fn set_sync_timeout(&self, timeout_usecs: u64) -> Result<()> {
        let driver = self.state().driver_activation.get().ok_or(NodeError::NoDriver)?;
        driver.sync_timeout.store(timeout_usecs, Ordering::Release);
        Ok(())
    }

    /// Try to become the timebase owner.
    pub fn set_timebase_callback(
        &self,
        conditional: bool,
        cb: impl FnMut(TransportState, u32, &mut TransportPosition, bool) + Send + 'static,
    ) -> Result<()> {
        let state = self.state();
        let driver = state.driver_activation.get().ok_or(NodeError::NoDriver)?;

        let owner = driver.segment_owner[0].load(Ordering::Acquire);
        if owner == state.node_id {
            return Ok(());
        }
        if conditional {
            if !driver.acquire_segment_owner(state.node_id) {
                debug!(owner, id = state.node_id, "timebase is taken");
                return Err(NodeError::Busy);
            }
        } else {
            driver.segment_owner[0].store(state.node_id, Ordering::Release);
        }

        {
            let _guard = self.inner.control.lock();
            state.callbacks.timebase = Some(Box::new(cb));
        }
        debug!(id = state.node_id, "timebase acquired");

        self.do_activate()?;
        if let Some(a) = state.activation.get() {
            a.pending_new_pos.store(1, Ordering::Release);
        }
        Ok(())
    }

    pub fn release_timebase(&self) -> Result<()> {
        let state = self.state();
        let driver = state.driver_activation.get().ok_or(NodeError::NoDriver)?;
        if !driver.release_segment_owner(state.node_id) {
            return Err(NodeError::NotOwner);
        }
        let _guard = self.inner.control.lock();
        state.callbacks.timebase = None;
        if let Some(a) = state.activation.get() {
            a.pending_new_pos.store(0, Ordering::Release);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // threads
    // ------------------------------------------------------------------

    pub fn is_realtime(&self) -> bool {
        true
    }

    pub fn thread_id(&self) -> std::thread::ThreadId {
        std::thread::current().id()
    }

    pub fn real_time_priority(&self) -> i32 {
        20
    }

    pub fn max_real_time_priority(&self) -> i32 {
        20
    }

    pub fn create_thread(
        &self,
        realtime: bool,
        priority: i32,
        body: ThreadBody,
    ) -> std::io::Result<ClientThread> {
        threads::create_thread(realtime, priority, body)
    }

    pub fn stop_thread(&self, thread: ClientThread) -> std::io::Result<()> {
        threads::stop_thread(thread)
    }

    pub fn kill_thread(&self, thread: ClientThread) -> std::io::Result<()> {
        threads::kill_thread(thread)
    }

    /// Custom-thread mode: block for the next cycle.
    pub fn cycle_wait(&self) -> u32 {
        let frames = process::cycle_wait(&self.inner);
        trace!(frames, "cycle wait");
        frames
    }

    /// Custom-thread mode: finish the current cycle.
    pub fn cycle_signal(&self, status: i32) {
        trace!(status, "cycle signal");
        process::cycle_signal(&self.inner, status);
    }

    // ------------------------------------------------------------------
    // intentionally unsupported surface
    // ------------------------------------------------------------------

    pub fn set_freewheel(&self, onoff: bool) -> Result<()> {
        warn!(onoff, "freewheel not supported");
        Err(NodeError::NotSupported("freewheel"))
    }

    pub fn set_session_callback(&self) -> Result<()> {
        if self.inner.flags.active.load(Ordering::Acquire) {
            return Err(NodeError::ActiveClient);
        }
        warn!("session API not supported");
        Err(NodeError::NotSupported("session"))
    }

    pub fn port_tie(&self, _src: Port, _dst: Port) -> Result<()> {
        warn!("port tie not supported");
        Err(NodeError::NotSupported("port tie"))
    }

    pub fn port_untie(&self, _port: Port) -> Result<()> {
        warn!("port untie not supported");
        Err(NodeError::NotSupported("port untie"))
    }

    pub fn recompute_total_latencies(&self) -> Result<()> {
        warn!("latency recomputation not supported");
        Ok(())
    }

    pub fn recompute_total_latency(&self, _port: Port) -> Result<()> {
        warn!("latency recomputation not supported");
        Ok(())
    }

    pub fn port_get_total_latency(&self, _port: Port) -> u32 {
        warn!("total latency not supported");
        0
    }

    /// Deprecated setter kept for completeness; renames go through
    /// [`port_rename`](Self::port_rename).
    pub fn port_set_name(&self, _port: Port, _name: &str) -> Result<()> {
        warn!("port_set_name is deprecated");
        Ok(())
    }

    pub fn engine_takeover_timebase(&self) -> Result<()> {
        error!("engine_takeover_timebase is deprecated");
        Ok(())
    }

    /// Deprecated cycle primitive; superseded by
    /// [`cycle_wait`](Self::cycle_wait)/[`cycle_signal`](Self::cycle_signal).
    pub fn thread_wait(&self, _status: i32) -> u32 {
        error!("thread_wait is deprecated, use cycle_wait/cycle_signal");
        0
    }

    pub fn get_transport_info(&self) -> TransportPosition {
        error!("get_transport_info is deprecated");
        TransportPosition::default()
    }

    pub fn set_transport_info(&self, _info: &TransportPosition) {
        error!("set_transport_info is deprecated");
    }
}

/// In-process clients are not a thing this library offers.
pub fn internal_client_new(name: &str, load_name: &str, load_init: &str) -> Result<()> {
    warn!(name, load_name, load_init, "internal clients not implemented");
    Err(NodeError::NotSupported("internal clients"))
}

pub fn internal_client_close(name: &str) {
    warn!(name, "internal clients not implemented");
}

/// Pids are a server-side concept; the library never knows them.
pub fn get_client_pid(name: &str) -> i32 {
    error!(name, "client pids not implemented on the library side");
    0
}

fn send(control: &mut Control, req: &ClientRequest) -> Result<()> {
    control.tx.as_mut().ok_or(NodeError::Disconnected)?.send(req)
}

fn make_handle(registry: &Registry, key: ObjKey) -> Port {
    let entry = registry.port(key);
    let (local, type_id) = match entry {
        Some(p) => {
            let local = (p.port_id != INVALID_ID)
                .then(|| p.flags.direction().map(|d| (d, p.port_id)))
                .flatten();
            (local, p.type_id)
        }
        None => (None, PortType::Other),
    };
    Port { key, local, type_id }
}

/// The thread loop: receives server events, applies them under the
/// control lock, and delivers registration callbacks with the lock
/// released so they may re-enter the API.
fn thread_loop_main(inner: Arc<ClientInner>, mut rx: ConnRx) {
    debug!("thread loop running");
    loop {
        if inner.flags.destroyed.load(Ordering::Acquire) {
            break;
        }
        match rx.recv::<ServerEvent>(LOOP_TICK) {
            Ok(None) => continue,
            Ok(Some(event)) => dispatch_event(&inner, &mut rx, event),
            Err(e) => {
                debug!("connection closed: {e}");
                connection_lost(&inner);
                break;
            }
        }
    }
    debug!("thread loop stopped");
}

fn connection_lost(inner: &ClientInner) {
    inner.flags.error.store(true, Ordering::Release);
    inner.sync_cond.notify_all();
    if !inner.flags.destroyed.load(Ordering::Acquire)
        && !inner.flags.shutdown_emitted.swap(true, Ordering::AcqRel)
    {
        // Safety: the data loop is quiesced or about to fail its own fd;
        // shutdown delivery is one-shot either way.
        let state = unsafe { &mut *inner.state.get() };
        if let Some(cb) = state.callbacks.info_shutdown.as_mut() {
            cb("server connection lost");
        } else if let Some(cb) = state.callbacks.shutdown.as_mut() {
            cb();
        }
    }
}

fn dispatch_event(inner: &Arc<ClientInner>, rx: &mut ConnRx, event: ServerEvent) {
    let fds = rx.take_fds(event.fd_count());
    match event {
        ServerEvent::Done { seq } => {
            let mut control = inner.control.lock();
            control.last_sync = seq;
            drop(control);
            inner.sync_cond.notify_all();
        }
        ServerEvent::Error { id, res, message } => {
            warn!(id, res, %message, "server error");
            if id == 0 {
                inner.flags.error.store(true, Ordering::Release);
                inner.sync_cond.notify_all();
            }
        }
        event => {
            let notifies = {
                let mut control = inner.control.lock();
                let control = &mut *control;
                let Some(tx) = control.tx.as_mut() else { return };
                // Safety: reconfiguration point; see ClientInner.
                let state = unsafe { &mut *inner.state.get() };
                let mut ctx = EventCtx {
                    client_name: &inner.config.name,
                    state,
                    registry: &mut control.registry,
                    mem: &mut control.mem,
                    io_maps: &mut control.io_maps,
                    tx,
                    flags: &inner.flags,
                    data_loop: &inner.data_loop,
                };
                ctx.handle(event, fds)
            };
            // user callbacks run with the lock released and may call back
            // into the API
            if !notifies.is_empty() {
                // Safety: callbacks are not mutated while the client has a
                // running loop delivering them.
                let state = unsafe { &mut *inner.state.get() };
                for notify in notifies {
                    match notify {
                        Notify::Client { name, registered } => {
                            if let Some(cb) = state.callbacks.client_registration.as_mut() {
                                cb(&name, registered);
                            }
                        }
                        Notify::Port { id, registered } => {
                            if let Some(cb) = state.callbacks.port_registration.as_mut() {
                                cb(id, registered);
                            }
                        }
                        Notify::Connect { src, dst, connected } => {
                            if let Some(cb) = state.callbacks.port_connect.as_mut() {
                                cb(src, dst, connected);
                            }
                        }
                    }
                }
            }
        }
    }
}
