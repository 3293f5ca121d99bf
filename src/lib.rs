//! segue — a JACK-compatible client library for graph media servers.
//!
//! Applications written against the legacy audio client API link against
//! this crate and run unmodified: underneath, the library drives a
//! client-node on the graph server, exchanges buffers through
//! server-owned shared memory, and runs the application's process
//! callback from an eventfd-driven realtime loop.
//!
//! ## Usage
//!
//! ```ignore
//! use segue::{Client, OpenFlags, PortFlags};
//!
//! let client = Client::open("metro", OpenFlags::NULL)?;
//! let out = client.port_register(
//!     "out",
//!     segue::port_types::DEFAULT_AUDIO_TYPE,
//!     PortFlags::IS_OUTPUT,
//!     0,
//! )?;
//!
//! let rt = client.clone();
//! client.set_process_callback(move |frames| {
//!     if let Some(buffer) = rt.port_get_buffer(out, frames) {
//!         let samples = buffer.as_audio().unwrap();
//!         samples.fill(0.0);
//!     }
//!     0
//! })?;
//! client.activate()?;
//! ```

pub use segue_core::ids as port_types;
pub use segue_core::transport::{TransportPosition, TransportState};
pub use segue_core::{
    LatencyRange, PortFlags, DEFAULT_BUFFER_FRAMES, DEFAULT_SAMPLE_RATE, MAX_BUFFER_FRAMES,
};
pub use segue_midi::{MidiBufferRef, MidiEvent};
pub use segue_node::{
    acquire_real_time_scheduling, drop_real_time_scheduling, get_client_pid,
    internal_client_close, internal_client_new, set_thread_creator, CancelToken, Client,
    ClientConfig, ClientThread, CycleTimes, NodeError, OpenError, OpenFlags, Port, PortBuffer,
    Result, Status, ThreadCreator,
};

/// Error/info printer installation is a no-op; diagnostics go through the
/// `tracing` subscriber the host application installs.
pub fn set_error_function(_func: fn(&str)) {}

pub fn set_info_function(_func: fn(&str)) {}

/// Legacy name-size limits, in bytes.
pub fn client_name_size() -> usize {
    segue_core::CLIENT_NAME_SIZE
}

pub fn port_name_size() -> usize {
    segue_core::REAL_PORT_NAME_SIZE
}

pub fn port_type_size() -> usize {
    segue_core::PORT_TYPE_SIZE
}

/// Library version; the shim never pretended to be a particular upstream
/// release.
pub fn get_version() -> (u32, u32, u32, u32) {
    (0, 0, 0, 0)
}

pub fn get_version_string() -> &'static str {
    "0.0.0.0"
}

pub use segue_node::get_time;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_sizes() {
        assert_eq!(client_name_size(), 64);
        assert_eq!(port_name_size(), 320);
        assert_eq!(port_type_size(), 32);
    }

    #[test]
    fn test_version() {
        assert_eq!(get_version(), (0, 0, 0, 0));
        assert_eq!(get_version_string(), "0.0.0.0");
    }

    #[test]
    fn test_time_is_monotonic() {
        let a = get_time();
        let b = get_time();
        assert!(b >= a);
    }
}
