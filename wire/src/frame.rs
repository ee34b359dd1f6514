//! Length-prefixed framing for packets.
//!
//! Wire layout:
//!
//! ```text
//! +----------------------+------------------------------+
//! | u32 frame_len        | length of bytes that follow  |
//! +----------------------+------------------------------+
//! | u8  header codec id  | codec the header is in       |
//! +----------------------+------------------------------+
//! | u32 header_len       |                              |
//! | header bytes         | Header, serialized           |
//! +----------------------+------------------------------+
//! | u8  body codec id    | codec the body is in         |
//! | body bytes           | gzip'd when header.gzip > 0  |
//! +----------------------+------------------------------+
//! ```

use crate::codec::CodecKind;
use crate::header::Header;
use crate::packet::Packet;
use crate::WireError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Maximum frame size (16 MiB default)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// A decoded frame before the session decides what to do with the body
#[derive(Debug)]
pub struct RawPacket {
    /// Codec the header was encoded with
    pub header_codec: CodecKind,
    /// Decoded header
    pub header: Header,
    /// Codec the body is encoded with
    pub body_codec: CodecKind,
    /// Body bytes, still compressed if `header.gzip > 0`
    pub body: Bytes,
    /// Total frame length including the length prefix
    pub wire_len: usize,
}

/// Incremental frame decoder over a read buffer
#[derive(Debug)]
pub struct FrameDecoder {
    max_frame_size: usize,
}

impl FrameDecoder {
    /// Create a decoder with the default frame size limit
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Decode one frame from the buffer, or `None` if more data is needed
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<RawPacket>, WireError> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let frame_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if frame_len > self.max_frame_size {
            return Err(WireError::Size(frame_len));
        }
        if buf.len() < 4 + frame_len {
            return Ok(None);
        }

        buf.advance(4);
        let mut frame = buf.split_to(frame_len).freeze();

        if frame.len() < 5 {
            return Err(WireError::Malformed);
        }
        let header_codec = CodecKind::from_id(frame.get_u8())?;
        let header_len = frame.get_u32() as usize;
        if frame.len() < header_len + 1 {
            return Err(WireError::Malformed);
        }
        let header_bytes = frame.split_to(header_len);
        let header: Header = header_codec.decode(&header_bytes)?;

        let body_codec = CodecKind::from_id(frame.get_u8())?;
        let body = frame;

        Ok(Some(RawPacket {
            header_codec,
            header,
            body_codec,
            body,
            wire_len: 4 + frame_len,
        }))
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode an outbound packet into one contiguous frame.
///
/// The packet body must already be serialized; `body_codec` must be
/// resolved by this point.
pub fn encode_frame(packet: &Packet, max_frame_size: usize) -> Result<Bytes, WireError> {
    let body_codec = packet.body_codec.ok_or(WireError::Malformed)?;
    let header_bytes = packet.header_codec.encode(&packet.header)?;

    let frame_len = 1 + 4 + header_bytes.len() + 1 + packet.body.len();
    if 4 + frame_len > max_frame_size {
        return Err(WireError::Size(4 + frame_len));
    }

    let mut buf = BytesMut::with_capacity(4 + frame_len);
    buf.put_u32(frame_len as u32);
    buf.put_u8(packet.header_codec.id());
    buf.put_u32(header_bytes.len() as u32);
    buf.put_slice(&header_bytes);
    buf.put_u8(body_codec.id());
    buf.put_slice(&packet.body);

    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::PacketType;

    fn sample_packet() -> Packet {
        let mut p = Packet::default();
        p.header.seq = 17;
        p.header.typ = PacketType::Pull.into();
        p.header.uri = "/echo?x=1".into();
        p.header_codec = CodecKind::Json;
        p.body_codec = Some(CodecKind::Json);
        p.encode_body(&serde_json::json!({"x": 1})).unwrap();
        p
    }

    #[test]
    fn test_frame_roundtrip() {
        let packet = sample_packet();
        let frame = encode_frame(&packet, DEFAULT_MAX_FRAME_SIZE).unwrap();

        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::from(frame.as_ref());
        let raw = decoder.decode(&mut buf).unwrap().unwrap();

        assert_eq!(raw.header, packet.header);
        assert_eq!(raw.header_codec, CodecKind::Json);
        assert_eq!(raw.body_codec, CodecKind::Json);
        assert_eq!(raw.body, packet.body);
        assert_eq!(raw.wire_len, frame.len());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_incremental_decode() {
        let frame = encode_frame(&sample_packet(), DEFAULT_MAX_FRAME_SIZE).unwrap();
        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::new();

        // Feed the frame one byte short of complete: no packet yet.
        buf.extend_from_slice(&frame[..frame.len() - 1]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&frame[frame.len() - 1..]);
        assert!(decoder.decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let frame = encode_frame(&sample_packet(), DEFAULT_MAX_FRAME_SIZE).unwrap();
        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&frame);
        buf.extend_from_slice(&frame);

        assert!(decoder.decode(&mut buf).unwrap().is_some());
        assert!(decoder.decode(&mut buf).unwrap().is_some());
        assert!(decoder.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let packet = sample_packet();
        assert!(matches!(
            encode_frame(&packet, 8),
            Err(WireError::Size(_))
        ));

        let frame = encode_frame(&packet, DEFAULT_MAX_FRAME_SIZE).unwrap();
        let mut decoder = FrameDecoder {
            max_frame_size: 8,
        };
        let mut buf = BytesMut::from(frame.as_ref());
        assert!(matches!(decoder.decode(&mut buf), Err(WireError::Size(_))));
    }

    #[test]
    fn test_unknown_codec_id_rejected() {
        let frame = encode_frame(&sample_packet(), DEFAULT_MAX_FRAME_SIZE).unwrap();
        let mut bytes = frame.to_vec();
        bytes[4] = 0xEE; // header codec id
        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::from(&bytes[..]);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(WireError::Codec(0xEE))
        ));
    }
}
