//! Unix Domain Socket API for the lease store daemon
//!
//! Workers and the CLI connect to the daemon's socket, send one JSON request
//! line and read one JSON response line. Typed store errors survive the trip
//! so callers can tell a version conflict from a transient outage.

use std::path::PathBuf;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

pub mod client;
pub mod listener;
pub mod messages;

pub use client::{ClientError, ClientResult, LeaseClient};
pub use listener::{ServerContext, cleanup_socket, create_listener_at, serve};
pub use messages::{ClaimedLease, Request, Response};

/// Largest request or response line accepted (1 MiB)
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Why a message line could not be read
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Message too large: more than {} bytes", MAX_MESSAGE_SIZE)]
    TooLarge,

    #[error("Connection closed before a message arrived")]
    Closed,

    #[error("Message is not valid UTF-8")]
    InvalidUtf8,

    #[error("Failed to read IPC message: {0}")]
    Io(#[from] std::io::Error),
}

/// Read one message line. The limit applies to the line without its `\n`,
/// the same way the sender measures it, and is checked before decoding.
pub async fn read_message<R: AsyncRead + Unpin>(stream: R) -> Result<String, FrameError> {
    let mut reader = BufReader::new(stream).take(MAX_MESSAGE_SIZE as u64 + 1);
    let mut line = Vec::new();

    if reader.read_until(b'\n', &mut line).await? == 0 {
        return Err(FrameError::Closed);
    }
    if line.last() == Some(&b'\n') {
        line.pop();
    }
    if line.len() > MAX_MESSAGE_SIZE {
        return Err(FrameError::TooLarge);
    }

    String::from_utf8(line).map_err(|_| FrameError::InvalidUtf8)
}

/// Get the default socket path for the daemon
pub fn get_socket_path() -> PathBuf {
    dirs::runtime_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("leased")
        .join("leased.sock")
}
