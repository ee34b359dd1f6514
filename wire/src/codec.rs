//! Body and header codecs plus gzip body compression.

use crate::error::CodecError;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Registered serialization codecs.
///
/// The wire carries the one-byte id; APIs use the name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    /// JSON via serde_json
    Json,
    /// CBOR via ciborium
    Cbor,
}

impl CodecKind {
    /// One-byte wire id
    pub const fn id(self) -> u8 {
        match self {
            CodecKind::Json => 1,
            CodecKind::Cbor => 2,
        }
    }

    /// Codec for a wire id
    pub fn from_id(id: u8) -> Result<Self, crate::WireError> {
        match id {
            1 => Ok(CodecKind::Json),
            2 => Ok(CodecKind::Cbor),
            _ => Err(crate::WireError::Codec(id)),
        }
    }

    /// Codec name as carried in logs and configuration
    pub const fn name(self) -> &'static str {
        match self {
            CodecKind::Json => "json",
            CodecKind::Cbor => "cbor",
        }
    }

    /// Codec for a configuration name
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "json" => Some(CodecKind::Json),
            "cbor" => Some(CodecKind::Cbor),
            _ => None,
        }
    }

    /// Serialize a value with this codec
    pub fn encode<T: Serialize + ?Sized>(self, value: &T) -> Result<Vec<u8>, CodecError> {
        match self {
            CodecKind::Json => Ok(serde_json::to_vec(value)?),
            CodecKind::Cbor => {
                let mut buf = Vec::new();
                ciborium::into_writer(value, &mut buf)
                    .map_err(|e| CodecError::Cbor(e.to_string()))?;
                Ok(buf)
            }
        }
    }

    /// Deserialize a value with this codec
    pub fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T, CodecError> {
        match self {
            CodecKind::Json => Ok(serde_json::from_slice(bytes)?),
            CodecKind::Cbor => {
                ciborium::from_reader(bytes).map_err(|e| CodecError::Cbor(e.to_string()))
            }
        }
    }
}

/// Gzip-compress body bytes at the given level (1..=9)
pub fn compress(level: u8, bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::new(u32::from(level.min(9))));
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

/// Decompress gzip'd body bytes
pub fn decompress(bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}
