use serde::{Deserialize, Serialize};

pub mod catalog;
pub mod client;
pub mod config;
pub mod discovery;
pub mod error;
pub mod transfer;

pub use catalog::{CatalogSnapshot, DirectoryEntry, EntryKind, ServerRoot};
pub use client::{Client, ClientOptions, Session, SessionState};
pub use discovery::{DiscoveryResponder, PeerAddress, discover_peers};
pub use error::{ShareError, ShareResult};
pub use transfer::{Server, ServerHandle, ServerOptions};

/// Magic bytes to identify our discovery datagrams (6 bytes: "LANSH\0")
pub const MAGIC_BYTES: &[u8] = b"LANSH\x00";

/// Version spoken on the control channel; peers must agree exactly.
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscoveryMsg {
    /// Broadcast by a client; `nonce` is fresh for every discovery round
    Probe {
        nonce: String,
    },
    /// Server reply, echoing the probe's nonce
    Announce {
        nonce: String,
        server_name: String,
        port: u16,
    },
}

/// Report from the engine to whoever drives it (CLI, GUI shell).
#[derive(Debug, Clone, PartialEq)]
pub enum ShareEvent {
    SessionChanged {
        peer: Option<PeerAddress>,
        state: SessionState,
    },

    TransferProgress {
        file_name: String,
        bytes_done: u64,
        total_bytes: u64,
        speed: String,
    },
    TransferCompleted {
        file_name: String,
    },
    TransferFailed {
        file_name: String,
        reason: String,
    },
}

/// Name this host announces to peers.
pub fn local_name() -> String {
    hostname::get()
        .ok()
        .and_then(|s| s.into_string().ok())
        .unwrap_or_else(|| "Unknown-PC".to_string())
}
