//! The client-node bridge.
//!
//! This crate carries everything between the public legacy-API surface
//! and the graph server: the wire protocol and its unix-socket transport,
//! the shared-memory pool mirror, the registry read-model, local port and
//! mix pools, the realtime cycle engine, and the client orchestration
//! that ties the three threads together.

pub mod buffers;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod mem;
pub mod node;
pub mod ports;
pub mod process;
pub mod protocol;
pub mod registry;
pub mod state;
pub mod threads;

pub use client::{
    get_client_pid, get_time, internal_client_close, internal_client_new, Client, CycleTimes,
    Port, PortBuffer,
};
pub use config::{ClientConfig, OpenFlags, DEFAULT_LATENCY};
pub use error::{NodeError, OpenError, Result, Status};
pub use threads::{
    acquire_real_time_scheduling, drop_real_time_scheduling, set_thread_creator, CancelToken,
    ClientThread, ThreadCreator,
};
