//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Incomplete frame (need more data)
    #[error("incomplete frame")]
    Incomplete,

    /// Frame size limit exceeded
    #[error("frame size limit exceeded: {0}")]
    Size(usize),

    /// Unknown codec id
    #[error("unknown codec id {0}")]
    Codec(u8),

    /// Unknown packet type
    #[error("unknown packet type {0}")]
    Type(u8),

    /// Malformed frame structure
    #[error("malformed frame")]
    Malformed,

    /// Header could not be encoded or decoded
    #[error("header codec: {0}")]
    Header(#[from] CodecError),
}

/// Body and header serialization errors
#[derive(Error, Debug)]
pub enum CodecError {
    /// JSON serialization failed
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    /// CBOR serialization failed
    #[error("cbor: {0}")]
    Cbor(String),

    /// Gzip compression or decompression failed
    #[error("gzip: {0}")]
    Gzip(#[from] std::io::Error),

    /// No body codec selected for the packet
    #[error("no body codec selected")]
    MissingCodec,
}
