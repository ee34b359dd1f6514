//! Wire protocol framing, header/body codecs, and status codes for tether.
//!
//! This crate defines the on-wire packet contract consumed by the session
//! layer: a length-prefixed frame carrying a codec-encoded header and a
//! serialized (optionally gzip'd) body.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+------------------------------+
//! | u32 frame_len        | length of bytes that follow  |
//! +----------------------+------------------------------+
//! | u8  header codec id  | 1 = json, 2 = cbor           |
//! | u32 header_len       |                              |
//! | header bytes         | seq, type, uri, status, gzip |
//! +----------------------+------------------------------+
//! | u8  body codec id    |                              |
//! | body bytes           | opaque, codec-encoded        |
//! +----------------------+------------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod frame;
pub mod header;
pub mod packet;

pub use codec::{compress, decompress, CodecKind};
pub use error::{CodecError, WireError};
pub use frame::{encode_frame, FrameDecoder, RawPacket, DEFAULT_MAX_FRAME_SIZE};
pub use header::{status_code, Header, PacketType, Status};
pub use packet::{Packet, PacketSetting};
