use std::time::Duration;

/// Default QUIC port for the control/data channel
pub const TRANSFER_PORT: u16 = 8888;

/// Chunk size for file payloads (64KB)
pub const BUFFER_SIZE: usize = 64 * 1024;

/// Largest control message we accept (64KB)
pub const MAX_MSG_SIZE: usize = 64 * 1024;

/// Longest file name a request may carry
pub const MAX_FILENAME_LENGTH: usize = 255;

/// ALPN identifier; both sides must offer it
pub const ALPN: &[u8] = b"lanshare/1";

/// Connections with no traffic for this long are torn down
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Progress is reported at most once per this many bytes
pub const PROGRESS_STEP: u64 = 10 * BUFFER_SIZE as u64;
