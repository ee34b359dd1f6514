//! Framed packet socket over TCP.
//!
//! The socket is split at construction: the read half is owned by the
//! session's reader task, the write half lives behind the session's write
//! lock. Shared identity (id, remote address, public data) sits in
//! [`Socket`] behind an `Arc`.

use crate::error::SocketError;
use bytes::BytesMut;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::RwLock;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tether_wire::{encode_frame, CodecKind, FrameDecoder, Header, Packet, DEFAULT_MAX_FRAME_SIZE};

/// What the binder wants done with the body of the packet being read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyDisposition {
    /// Keep the body bytes for decoding
    Keep,
    /// Drop the body bytes unread
    Discard,
}

/// Chooses the body disposition while a packet's header is being parsed,
/// and receives the finished packet.
pub trait PacketBinder: Send {
    /// Called synchronously once the header of the incoming packet has been
    /// decoded, before the body is committed anywhere. `header_codec` is the
    /// codec the header arrived in, so replies can mirror it.
    fn bind(&mut self, header: &Header, header_codec: CodecKind) -> BodyDisposition;

    /// The packet slot the read lands in.
    fn input(&mut self) -> &mut Packet;
}

/// Shared socket identity and per-connection public data
#[derive(Debug)]
pub struct Socket {
    id: RwLock<String>,
    remote: SocketAddr,
    public: DashMap<String, serde_json::Value>,
}

impl Socket {
    /// Stable session id; defaults to the remote address
    pub fn id(&self) -> String {
        self.id.read().expect("socket id lock").clone()
    }

    /// Replace the session id
    pub fn change_id(&self, new_id: impl Into<String>) {
        *self.id.write().expect("socket id lock") = new_id.into();
    }

    /// Remote peer address
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Public per-connection data, seeded into every exchange context
    pub fn public(&self) -> &DashMap<String, serde_json::Value> {
        &self.public
    }

    /// Number of public entries
    pub fn public_len(&self) -> usize {
        self.public.len()
    }
}

/// Split a connected stream into shared identity, reader, and writer
pub fn split(
    stream: TcpStream,
    id: Option<String>,
) -> std::io::Result<(std::sync::Arc<Socket>, SocketReader, SocketWriter)> {
    let remote = stream.peer_addr()?;
    let (read_half, write_half) = stream.into_split();
    let socket = std::sync::Arc::new(Socket {
        id: RwLock::new(id.unwrap_or_else(|| remote.to_string())),
        remote,
        public: DashMap::new(),
    });
    let reader = SocketReader {
        half: read_half,
        decoder: FrameDecoder::new(),
        buf: BytesMut::with_capacity(64 * 1024),
        deadline: None,
    };
    let writer = SocketWriter {
        half: write_half,
        deadline: None,
    };
    Ok((socket, reader, writer))
}

/// Reading side of a split socket
#[derive(Debug)]
pub struct SocketReader {
    half: OwnedReadHalf,
    decoder: FrameDecoder,
    buf: BytesMut,
    deadline: Option<Instant>,
}

impl SocketReader {
    /// Deadline applied to the next `read_packet`; reset it before each read
    pub fn set_read_deadline(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
    }

    /// Read exactly one packet.
    ///
    /// The binder is invoked as soon as the header is decoded; a `Discard`
    /// disposition leaves the packet body empty and the bytes are dropped
    /// without ever being deserialized.
    pub async fn read_packet(&mut self, binder: &mut dyn PacketBinder) -> Result<(), SocketError> {
        let raw = loop {
            if let Some(raw) = self.decoder.decode(&mut self.buf)? {
                break raw;
            }
            let n = match self.deadline {
                Some(deadline) => {
                    let at = tokio::time::Instant::from_std(deadline);
                    tokio::time::timeout_at(at, self.half.read_buf(&mut self.buf))
                        .await
                        .map_err(|_| SocketError::DeadlineExceeded)??
                }
                None => self.half.read_buf(&mut self.buf).await?,
            };
            if n == 0 {
                if self.buf.is_empty() {
                    return Err(SocketError::Eof);
                }
                return Err(SocketError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed mid-frame",
                )));
            }
        };

        let disposition = binder.bind(&raw.header, raw.header_codec);
        let input = binder.input();
        input.header = raw.header;
        input.header_codec = raw.header_codec;
        input.wire_len = raw.wire_len;
        match disposition {
            BodyDisposition::Keep => {
                input.body_codec = Some(raw.body_codec);
                input.body = raw.body;
            }
            BodyDisposition::Discard => {}
        }
        Ok(())
    }
}

/// Writing side of a split socket
#[derive(Debug)]
pub struct SocketWriter {
    half: OwnedWriteHalf,
    deadline: Option<Instant>,
}

impl SocketWriter {
    /// Deadline applied to the next `write_packet`; reset it before each write
    pub fn set_write_deadline(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
    }

    /// Encode and write one full frame, recording the frame length on the
    /// packet for logging
    pub async fn write_packet(&mut self, packet: &mut Packet) -> Result<(), SocketError> {
        let frame = encode_frame(packet, DEFAULT_MAX_FRAME_SIZE)?;
        packet.wire_len = frame.len();
        match self.deadline {
            Some(deadline) => {
                let at = tokio::time::Instant::from_std(deadline);
                tokio::time::timeout_at(at, async {
                    self.half.write_all(&frame).await?;
                    self.half.flush().await
                })
                .await
                .map_err(|_| SocketError::DeadlineExceeded)??;
            }
            None => {
                self.half.write_all(&frame).await?;
                self.half.flush().await?;
            }
        }
        Ok(())
    }

    /// Shut down the write half
    pub async fn shutdown(&mut self) -> std::io::Result<()> {
        self.half.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_wire::{CodecKind, PacketType};

    struct KeepAll {
        input: Packet,
    }

    impl PacketBinder for KeepAll {
        fn bind(&mut self, _header: &Header, _header_codec: CodecKind) -> BodyDisposition {
            BodyDisposition::Keep
        }
        fn input(&mut self) -> &mut Packet {
            &mut self.input
        }
    }

    struct DiscardAll {
        input: Packet,
    }

    impl PacketBinder for DiscardAll {
        fn bind(&mut self, _header: &Header, _header_codec: CodecKind) -> BodyDisposition {
            BodyDisposition::Discard
        }
        fn input(&mut self) -> &mut Packet {
            &mut self.input
        }
    }

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, (server, _)) =
            tokio::join!(TcpStream::connect(addr), async {
                listener.accept().await.unwrap()
            });
        (client.unwrap(), server)
    }

    fn push_packet(body: &serde_json::Value) -> Packet {
        let mut p = Packet::default();
        p.header.typ = PacketType::Push.into();
        p.header.uri = "/evt".into();
        p.body_codec = Some(CodecKind::Json);
        p.encode_body(body).unwrap();
        p
    }

    #[tokio::test]
    async fn test_write_then_read_packet() {
        let (client, server) = pair().await;
        let (_, mut reader, _) = split(server, None).unwrap();
        let (_, _, mut writer) = split(client, None).unwrap();

        let mut out = push_packet(&serde_json::json!({"n": 1}));
        writer.write_packet(&mut out).await.unwrap();
        assert!(out.wire_len > 0);

        let mut binder = KeepAll {
            input: Packet::default(),
        };
        reader.read_packet(&mut binder).await.unwrap();
        assert_eq!(binder.input.header.uri, "/evt");
        let body: serde_json::Value = binder.input.decode_body().unwrap();
        assert_eq!(body["n"], 1);
    }

    #[tokio::test]
    async fn test_discard_leaves_body_empty() {
        let (client, server) = pair().await;
        let (_, mut reader, _) = split(server, None).unwrap();
        let (_, _, mut writer) = split(client, None).unwrap();

        let mut out = push_packet(&serde_json::json!({"n": 2}));
        writer.write_packet(&mut out).await.unwrap();

        let mut binder = DiscardAll {
            input: Packet::default(),
        };
        reader.read_packet(&mut binder).await.unwrap();
        assert!(binder.input.body.is_empty());
        assert!(binder.input.body_codec.is_none());
        // The header still landed.
        assert_eq!(binder.input.header.uri, "/evt");
    }

    #[tokio::test]
    async fn test_clean_remote_close_is_eof() {
        let (client, server) = pair().await;
        let (_, mut reader, _) = split(server, None).unwrap();
        drop(client);

        let mut binder = KeepAll {
            input: Packet::default(),
        };
        assert!(matches!(
            reader.read_packet(&mut binder).await,
            Err(SocketError::Eof)
        ));
    }

    #[tokio::test]
    async fn test_read_deadline_expires() {
        let (_client, server) = pair().await;
        let (_, mut reader, _) = split(server, None).unwrap();
        reader.set_read_deadline(Instant::now() + std::time::Duration::from_millis(40));

        let mut binder = KeepAll {
            input: Packet::default(),
        };
        assert!(matches!(
            reader.read_packet(&mut binder).await,
            Err(SocketError::DeadlineExceeded)
        ));
    }

    #[tokio::test]
    async fn test_id_change_and_public() {
        let (client, _server) = pair().await;
        let (socket, _, _) = split(client, Some("alpha".into())).unwrap();
        assert_eq!(socket.id(), "alpha");
        socket.change_id("beta");
        assert_eq!(socket.id(), "beta");

        socket
            .public()
            .insert("tenant".into(), serde_json::json!("acme"));
        assert_eq!(socket.public_len(), 1);
    }
}
