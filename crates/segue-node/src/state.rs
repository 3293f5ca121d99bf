//! Node-side state shared between the control loop and the data loop.
//!
//! The C-side contract this mirrors: the control loop reconfigures ports,
//! mixes and links only at points where the server is not cycling the
//! node (the server sequences reconfiguration against the signal/wait
//! protocol), and the data loop never takes the thread-loop lock. All
//! storage the realtime walk touches is preallocated and position-stable.

use crate::mem::MemMap;
use crate::ports::PortPool;
use segue_core::activation::{ActivationRecord, PositionBlock};
use segue_core::transport::{TransportPosition, TransportState};
use segue_core::INVALID_ID;
use std::os::fd::OwnedFd;

/// Raw pointer to a mapped activation record, null when unbound.
#[derive(Clone, Copy)]
pub struct ActivationPtr(pub *mut ActivationRecord);

impl ActivationPtr {
    pub const NULL: ActivationPtr = ActivationPtr(std::ptr::null_mut());

    #[inline]
    pub fn is_null(self) -> bool {
        self.0.is_null()
    }

    /// Borrow the record for the duration of one operation.
    #[inline]
    pub fn get(self) -> Option<&'static ActivationRecord> {
        // Safety: the mapping backing a non-null pointer is kept alive by
        // the owning PeerLink / client until the pointer is nulled first.
        unsafe { self.0.as_ref() }
    }
}

/// Peer node to wake after our cycle. A `node_id` of `INVALID_ID` is a
/// tombstone kept for index stability.
pub struct PeerLink {
    pub node_id: u32,
    pub mem: Option<MemMap>,
    pub activation: ActivationPtr,
    pub signalfd: Option<OwnedFd>,
}

impl PeerLink {
    pub fn clear(&mut self) {
        self.node_id = INVALID_ID;
        self.activation = ActivationPtr::NULL;
        self.mem = None;
        self.signalfd = None;
    }
}

pub type ProcessCallback = Box<dyn FnMut(u32) -> i32 + Send>;
pub type ThreadCallback = Box<dyn FnMut() + Send>;
pub type VoidCallback = Box<dyn FnMut() + Send>;
pub type InfoShutdownCallback = Box<dyn FnMut(&str) + Send>;
pub type FreewheelCallback = Box<dyn FnMut(bool) + Send>;
pub type SizeCallback = Box<dyn FnMut(u32) -> i32 + Send>;
pub type ClientRegistrationCallback = Box<dyn FnMut(&str, bool) + Send>;
pub type PortRegistrationCallback = Box<dyn FnMut(u32, bool) + Send>;
pub type PortConnectCallback = Box<dyn FnMut(u32, u32, bool) + Send>;
pub type PortRenameCallback = Box<dyn FnMut(u32, &str, &str) + Send>;
pub type GraphOrderCallback = Box<dyn FnMut() -> i32 + Send>;
pub type XRunCallback = Box<dyn FnMut() -> i32 + Send>;
pub type LatencyCallback = Box<dyn FnMut(segue_core::ids::LatencyMode) + Send>;
pub type SyncCallback = Box<dyn FnMut(TransportState, &TransportPosition) -> bool + Send>;
pub type TimebaseCallback =
    Box<dyn FnMut(TransportState, u32, &mut TransportPosition, bool) + Send>;

/// Application callbacks. Mutated only while the client is inactive;
/// invoked from the data loop (process-side) or the thread loop
/// (registration-side).
#[derive(Default)]
pub struct Callbacks {
    pub process: Option<ProcessCallback>,
    pub thread: Option<ThreadCallback>,
    pub thread_init: Option<VoidCallback>,
    pub shutdown: Option<VoidCallback>,
    pub info_shutdown: Option<InfoShutdownCallback>,
    pub freewheel: Option<FreewheelCallback>,
    pub buffer_size: Option<SizeCallback>,
    pub sample_rate: Option<SizeCallback>,
    pub client_registration: Option<ClientRegistrationCallback>,
    pub port_registration: Option<PortRegistrationCallback>,
    pub port_connect: Option<PortConnectCallback>,
    pub port_rename: Option<PortRenameCallback>,
    pub graph_order: Option<GraphOrderCallback>,
    pub xrun: Option<XRunCallback>,
    pub latency: Option<LatencyCallback>,
    pub sync: Option<SyncCallback>,
    pub timebase: Option<TimebaseCallback>,
}

/// Lifecycle flags shared across the three threads.
#[derive(Default)]
pub struct ClientFlags {
    /// Realtime wakeups enabled by the Start command.
    pub started: std::sync::atomic::AtomicBool,
    /// Next cycle runs the thread-init callback.
    pub first: std::sync::atomic::AtomicBool,
    /// Custom-thread callback already launched for this Start.
    pub thread_entered: std::sync::atomic::AtomicBool,
    pub active: std::sync::atomic::AtomicBool,
    pub destroyed: std::sync::atomic::AtomicBool,
    pub error: std::sync::atomic::AtomicBool,
    /// Shutdown callback delivered; it fires at most once.
    pub shutdown_emitted: std::sync::atomic::AtomicBool,
}

/// Two-source mix-add. May be called with `dst == src1` when
/// accumulating, so the implementations take raw pointers.
pub type Mix2Fn = unsafe fn(dst: *mut f32, src1: *const f32, src2: *const f32, n: usize);

pub struct NodeState {
    pub ports: PortPool,
    pub links: Vec<PeerLink>,
    /// Our own activation record.
    pub activation: ActivationPtr,
    pub activation_map: Option<MemMap>,
    /// The scheduling driver's activation, rebound on driver change.
    pub driver_activation: ActivationPtr,
    pub driver_id: u32,
    /// Position io area, null until `set_io(Position)`.
    pub position: *mut PositionBlock,
    /// Read end of the rt eventfd pair.
    pub rt_socket: Option<OwnedFd>,
    pub node_id: u32,
    pub xrun_count: u32,
    pub buffer_frames: u32,
    pub sample_rate: u32,
    pub last_position: TransportPosition,
    pub last_state: TransportState,
    pub callbacks: Callbacks,
    pub mix2: Mix2Fn,
}

/// Reserved so appending peers does not move the array under the
/// realtime fan-out.
const LINKS_CAPACITY: usize = 64;

impl NodeState {
    pub fn new(mix2: Mix2Fn) -> NodeState {
        NodeState {
            ports: PortPool::new(),
            links: Vec::with_capacity(LINKS_CAPACITY),
            activation: ActivationPtr::NULL,
            activation_map: None,
            driver_activation: ActivationPtr::NULL,
            driver_id: INVALID_ID,
            position: std::ptr::null_mut(),
            rt_socket: None,
            node_id: INVALID_ID,
            xrun_count: 0,
            buffer_frames: u32::MAX,
            sample_rate: u32::MAX,
            last_position: TransportPosition::default(),
            last_state: TransportState::Stopped,
            callbacks: Callbacks::default(),
            mix2,
        }
    }

    /// Snapshot of the position io area.
    #[inline]
    pub fn position_snapshot(&self) -> Option<PositionBlock> {
        if self.position.is_null() {
            None
        } else {
            // Safety: position points into a live tagged mapping.
            Some(unsafe { std::ptr::read_volatile(self.position) })
        }
    }

    pub fn find_link(&self, node_id: u32) -> Option<usize> {
        self.links.iter().position(|l| l.node_id == node_id)
    }

    /// Point `driver_activation` at the link matching `driver_id`.
    pub fn update_driver_activation(&mut self) {
        tracing::debug!(driver = self.driver_id, "rebinding driver activation");
        self.driver_activation = self
            .find_link(self.driver_id)
            .map(|i| self.links[i].activation)
            .unwrap_or(ActivationPtr::NULL);
    }
}
