//! Per-client configuration.
//!
//! Everything here is captured once at `open` time; the environment
//! variables are the ones legacy applications already use to steer the
//! shim.

use segue_core::CLIENT_NAME_SIZE;
use std::path::PathBuf;

pub const DEFAULT_LATENCY: &str = "1024/48000";

/// Open options, legacy-compatible bit values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenFlags(pub u32);

impl OpenFlags {
    pub const NULL: OpenFlags = OpenFlags(0);
    pub const NO_START_SERVER: OpenFlags = OpenFlags(0x01);
    pub const USE_EXACT_NAME: OpenFlags = OpenFlags(0x02);
    pub const SERVER_NAME: OpenFlags = OpenFlags(0x04);
    pub const LOAD_NAME: OpenFlags = OpenFlags(0x08);
    pub const LOAD_INIT: OpenFlags = OpenFlags(0x10);
    pub const SESSION_ID: OpenFlags = OpenFlags(0x20);

    #[inline]
    pub fn contains(self, other: OpenFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for OpenFlags {
    type Output = OpenFlags;
    #[inline]
    fn bitor(self, rhs: OpenFlags) -> OpenFlags {
        OpenFlags(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Client name, truncated to the legacy limit.
    pub name: String,
    /// Path of the server's control socket.
    pub socket_path: PathBuf,
    /// Requested quantum as `"frames/rate"`.
    pub latency: String,
    /// Do not ask the server to start if it is not running.
    pub no_start_server: bool,
    /// Restrict port listings to this node id (`PIPEWIRE_NODE`).
    pub node_restrict: Option<u32>,
    /// `PIPEWIRE_NOJACK` was set: refuse to open at all.
    pub disabled: bool,
}

impl ClientConfig {
    /// Capture configuration from the environment for a named client.
    pub fn from_env(name: &str) -> ClientConfig {
        let mut name = name.to_string();
        name.truncate(CLIENT_NAME_SIZE);

        let runtime_dir = std::env::var_os("PIPEWIRE_RUNTIME_DIR")
            .or_else(|| std::env::var_os("XDG_RUNTIME_DIR"))
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);

        ClientConfig {
            name,
            socket_path: runtime_dir.join("pipewire-0"),
            latency: std::env::var("PIPEWIRE_LATENCY").unwrap_or_else(|_| DEFAULT_LATENCY.into()),
            no_start_server: false,
            node_restrict: std::env::var("PIPEWIRE_NODE")
                .ok()
                .and_then(|v| v.parse().ok()),
            disabled: std::env::var_os("PIPEWIRE_NOJACK").is_some(),
        }
    }
}
