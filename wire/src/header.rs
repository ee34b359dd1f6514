//! Packet header, packet types, and status codes.
//!
//! The header is the routed part of every packet: sequence number, packet
//! type, URI, status, and the gzip level applied to the body. It is encoded
//! with the packet's header codec, so the wire representation stays
//! self-describing without a fixed binary layout.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Packet types carried in [`Header::typ`]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// Request expecting a correlated reply
    Pull = 1,
    /// Reply to a pull, correlated by sequence number
    PullReply = 2,
    /// Fire-and-forget notification
    Push = 3,
}

impl TryFrom<u8> for PacketType {
    type Error = crate::WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(PacketType::Pull),
            2 => Ok(PacketType::PullReply),
            3 => Ok(PacketType::Push),
            _ => Err(crate::WireError::Type(value)),
        }
    }
}

impl From<PacketType> for u8 {
    fn from(typ: PacketType) -> u8 {
        typ as u8
    }
}

/// Packet header
///
/// `typ` is kept as a raw byte so a peer speaking a newer protocol revision
/// does not tear down the session; unknown types are discarded by the
/// session binder instead.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Header {
    /// Sequence number, unique per direction per packet type while live
    pub seq: u64,
    /// Packet type, see [`PacketType`]
    pub typ: u8,
    /// Request URI (path plus optional query string)
    pub uri: String,
    /// Status code, zero until a status is assigned
    pub status_code: i32,
    /// Human-readable status text
    pub status: String,
    /// Gzip level applied to the body; 0 disables compression
    pub gzip: u8,
}

impl Header {
    /// Packet type, if recognized
    pub fn packet_type(&self) -> Option<PacketType> {
        PacketType::try_from(self.typ).ok()
    }
}

/// Well-known status codes.
pub mod status_code {
    /// Session closed before the exchange completed
    pub const CONN_CLOSED: i32 = 102;
    /// The outbound write failed before the packet reached the wire
    pub const WRITE_FAILED: i32 = 104;
    /// Success
    pub const OK: i32 = 200;
    /// Malformed pull request (bad URI or undecodable body)
    pub const BAD_PULL: i32 = 400;
    /// No route registered for the request URI
    pub const NOT_FOUND: i32 = 404;

    /// Canonical text for a well-known code
    pub fn text(code: i32) -> &'static str {
        match code {
            CONN_CLOSED => "Connection Closed",
            WRITE_FAILED => "Write Failed",
            OK => "OK",
            BAD_PULL => "Bad Pull",
            NOT_FOUND => "Not Found",
            _ => "Unknown Status",
        }
    }
}

/// Status carrier: a numeric code plus human text.
///
/// Used both inside packet headers and as the per-pull failure value
/// surfaced to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    /// Numeric status code
    pub code: i32,
    /// Human-readable text
    pub text: String,
}

impl Status {
    /// Create a status with explicit text
    pub fn new(code: i32, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
        }
    }

    /// Create a status with the canonical text for a well-known code
    pub fn from_code(code: i32) -> Self {
        Self::new(code, status_code::text(code))
    }

    /// Success status
    pub fn ok() -> Self {
        Self::from_code(status_code::OK)
    }

    /// Whether this status denotes success
    pub fn is_ok(&self) -> bool {
        self.code == status_code::OK
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.text)
    }
}

impl std::error::Error for Status {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_type_conversion() {
        assert_eq!(PacketType::try_from(1).unwrap(), PacketType::Pull);
        assert_eq!(PacketType::try_from(2).unwrap(), PacketType::PullReply);
        assert_eq!(PacketType::try_from(3).unwrap(), PacketType::Push);
        assert!(PacketType::try_from(0).is_err());
        assert!(PacketType::try_from(0xFF).is_err());
    }

    #[test]
    fn test_status_text() {
        assert_eq!(status_code::text(status_code::NOT_FOUND), "Not Found");
        assert_eq!(status_code::text(status_code::OK), "OK");
        assert_eq!(status_code::text(-1), "Unknown Status");
    }

    #[test]
    fn test_status_carrier() {
        let ok = Status::ok();
        assert!(ok.is_ok());
        assert_eq!(ok.to_string(), "200 OK");

        let missing = Status::from_code(status_code::NOT_FOUND);
        assert!(!missing.is_ok());
        assert_eq!(missing.text, "Not Found");
    }

    #[test]
    fn test_header_packet_type() {
        let mut header = Header::default();
        header.typ = PacketType::Push.into();
        assert_eq!(header.packet_type(), Some(PacketType::Push));

        header.typ = 0x7F;
        assert_eq!(header.packet_type(), None);
    }
}
