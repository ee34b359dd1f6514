//! Session-layer error types.

use thiserror::Error;
use tether_wire::{CodecError, WireError};

/// Errors surfaced by socket reads and writes
#[derive(Error, Debug)]
pub enum SocketError {
    /// Remote closed the connection cleanly
    #[error("connection closed by remote")]
    Eof,

    /// Read or write deadline expired
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// I/O failure
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    /// Frame could not be encoded or decoded
    #[error("wire: {0}")]
    Wire(#[from] WireError),
}

/// Errors surfaced by session operations
#[derive(Error, Debug)]
pub enum SessionError {
    /// The session is closed
    #[error("connection is closed")]
    Closed,

    /// Socket failure underneath the session
    #[error(transparent)]
    Socket(#[from] SocketError),

    /// Body could not be encoded or decoded
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The write path panicked; converted to a synthetic error
    #[error("write panicked: {0}")]
    WritePanic(String),
}
