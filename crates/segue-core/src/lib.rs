//! Shared primitives for the segue client library.
//!
//! This crate holds everything both the control side and the realtime side
//! of the client agree on: object ids and port flags, the shared-memory
//! activation record exchanged with the graph server, and the mapping
//! between the server's segmented position model and the legacy transport
//! states.

pub mod activation;
pub mod ids;
pub mod transport;

pub use activation::{
    ActivationRecord, ActivationState, ClockBlock, IoBuffers, PositionBlock, Segment, SegmentBar,
};
pub use ids::{Direction, LatencyRange, PortFlags, PortType};
pub use transport::{TransportPosition, TransportState};

/// Sentinel for "no object" in every id namespace the server uses.
pub const INVALID_ID: u32 = u32::MAX;

pub const MAX_BUFFER_FRAMES: usize = 8192;
pub const MAX_ALIGN: usize = 16;
pub const MAX_PORTS: usize = 1024;
pub const MAX_BUFFERS: usize = 2;
pub const MAX_BUFFER_DATAS: usize = 4;
pub const MAX_BUFFER_MEMS: usize = 4;
pub const MAX_MIX: usize = 4096;
pub const OBJECT_CHUNK: usize = 8;

pub const DEFAULT_SAMPLE_RATE: u32 = 48000;
pub const DEFAULT_BUFFER_FRAMES: u32 = 1024;

pub const CLIENT_NAME_SIZE: usize = 64;
pub const PORT_NAME_SIZE: usize = 256;
/// Full port names are `"<client>:<short>"`.
pub const REAL_PORT_NAME_SIZE: usize = CLIENT_NAME_SIZE + PORT_NAME_SIZE;
pub const PORT_TYPE_SIZE: usize = 32;
pub const PORT_MAX: usize = 4096;
pub const CONNECTIONS_PER_PORT: usize = 1024;
