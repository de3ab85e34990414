//! Control/data channel over QUIC.
//!
//! This module provides:
//! - Length-prefixed control messages (handshake, catalog, file requests)
//! - QUIC server and client endpoints
//! - The server accept loop and per-stream request handling
//! - Chunked file streaming with a BLAKE3 trailer on both sides

pub mod constants;
pub mod protocol;
pub mod quic;
pub mod receiver;
pub mod sender;
pub mod server;
pub mod utils;

// Re-export public API
pub use constants::TRANSFER_PORT;
pub use quic::{make_client_endpoint, make_server_endpoint};
pub use server::{Server, ServerHandle, ServerOptions};
