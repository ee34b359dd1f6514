//! The packet: one logical message on a session.

use crate::codec::{self, CodecKind};
use crate::error::CodecError;
use crate::header::Header;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// One framed message, inbound or outbound.
///
/// The body is held in its serialized (and possibly compressed) form;
/// [`Packet::encode_body`] and [`Packet::decode_body`] convert to and from
/// typed values using the packet's body codec and gzip level. Keeping bytes
/// here means a discarded body is never deserialized and a reply body is
/// decoded straight from the frame buffer.
#[derive(Debug, Clone)]
pub struct Packet {
    /// Routed header
    pub header: Header,
    /// Codec used for the header itself
    pub header_codec: CodecKind,
    /// Codec for the body; `None` on an outbound reply means
    /// "inherit the request's"
    pub body_codec: Option<CodecKind>,
    /// Serialized body bytes, compressed when `header.gzip > 0`
    pub body: Bytes,
    /// Total frame length on the wire, for logging
    pub wire_len: usize,
}

impl Default for Packet {
    fn default() -> Self {
        Self {
            header: Header::default(),
            header_codec: CodecKind::Json,
            body_codec: None,
            body: Bytes::new(),
            wire_len: 0,
        }
    }
}

impl Packet {
    /// Reset to the post-construction state for reuse
    pub fn reset(&mut self) {
        self.header = Header::default();
        self.header_codec = CodecKind::Json;
        self.body_codec = None;
        self.body = Bytes::new();
        self.wire_len = 0;
    }

    /// Serialize `value` into the body with the packet's body codec,
    /// compressing when the header carries a gzip level
    pub fn encode_body<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), CodecError> {
        let codec = self.body_codec.ok_or(CodecError::MissingCodec)?;
        let raw = codec.encode(value)?;
        self.set_body_bytes(raw)
    }

    /// Install already-serialized body bytes, compressing when the header
    /// carries a gzip level
    pub fn set_body_bytes(&mut self, raw: Vec<u8>) -> Result<(), CodecError> {
        self.body = if self.header.gzip > 0 {
            Bytes::from(codec::compress(self.header.gzip, &raw)?)
        } else {
            Bytes::from(raw)
        };
        Ok(())
    }

    /// Deserialize the body into `T` with the packet's body codec,
    /// decompressing first when the header carries a gzip level
    pub fn decode_body<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        let codec = self.body_codec.ok_or(CodecError::MissingCodec)?;
        if self.header.gzip > 0 {
            let raw = codec::decompress(&self.body)?;
            codec.decode(&raw)
        } else {
            codec.decode(&self.body)
        }
    }
}

/// Ordered, caller-supplied packet mutations applied before a pull or push
/// is written.
#[derive(Debug, Clone, Copy)]
pub enum PacketSetting {
    /// Override the body codec
    BodyCodec(CodecKind),
    /// Override the header codec
    HeaderCodec(CodecKind),
    /// Override the gzip level (0 disables compression)
    Gzip(u8),
}

impl PacketSetting {
    /// Apply this setting to an outbound packet
    pub fn apply(&self, packet: &mut Packet) {
        match *self {
            PacketSetting::BodyCodec(codec) => packet.body_codec = Some(codec),
            PacketSetting::HeaderCodec(codec) => packet.header_codec = codec,
            PacketSetting::Gzip(level) => packet.header.gzip = level,
        }
    }
}
