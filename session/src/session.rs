//! One live connection: reader loop, serialized writer, correlation,
//! dispatch, and shutdown.

use crate::coarse;
use crate::error::{SessionError, SocketError};
use crate::oplog;
use crate::peer::{PeerConfig, PeerShared};
use crate::pull::{PullCmd, PullComplete, PullOutcome, TypedPull};
use crate::router::{PullHandler, PushHandler, Router};
use crate::socket::{self, Socket, SocketReader, SocketWriter};
use crate::worker;
use dashmap::DashMap;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, trace, warn};
use tether_wire::{status_code, Packet, PacketSetting, PacketType, Status};

/// A connection session.
///
/// Symmetric: both the dialing and the accepting peer get the same object,
/// and either side may issue pulls and pushes at any time. One reader task
/// per session; writes are serialized through an async mutex; handlers run
/// on the peer's bounded worker pool.
pub struct Session {
    peer: Arc<PeerShared>,
    socket: Arc<Socket>,
    writer: Mutex<SocketWriter>,
    pull_router: Arc<Router<PullHandler>>,
    push_router: Arc<Router<PushHandler>>,
    pull_seq: AtomicU64,
    push_seq: AtomicU64,
    pulls: DashMap<u64, Box<dyn PullComplete>>,
    closed: AtomicBool,
    close_notify: Notify,
}

impl Session {
    /// Build a session over a connected stream and schedule its reader
    /// onto the worker pool.
    pub(crate) fn spawn(
        peer: Arc<PeerShared>,
        stream: TcpStream,
        id: Option<String>,
    ) -> std::io::Result<Arc<Self>> {
        let (socket, reader, writer) = socket::split(stream, id)?;
        let session = Arc::new(Session {
            pull_router: Arc::clone(&peer.pull_router),
            push_router: Arc::clone(&peer.push_router),
            peer,
            socket,
            writer: Mutex::new(writer),
            pull_seq: AtomicU64::new(0),
            push_seq: AtomicU64::new(0),
            pulls: DashMap::new(),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        });
        if let Err(e) = session
            .peer
            .workers
            .go(Arc::clone(&session).read_loop(reader))
        {
            warn!("{}", e);
        }
        Ok(session)
    }

    /// Session id, delegated to the socket
    pub fn id(&self) -> String {
        self.socket.id()
    }

    /// Change the session id and re-register in the peer hub.
    ///
    /// Insert-then-delete so a concurrent lookup never hits a gap.
    pub fn change_id(self: &Arc<Self>, new_id: impl Into<String>) {
        let new_id = new_id.into();
        let old_id = self.socket.id();
        self.socket.change_id(new_id.clone());
        self.peer.hub.insert(new_id.clone(), Arc::clone(self));
        self.peer.hub.remove(&old_id);
        trace!("session id changed: {} -> {}", old_id, new_id);
    }

    /// Remote peer address as a string
    pub fn remote_ip(&self) -> String {
        self.socket.remote_addr().to_string()
    }

    /// Remote peer address
    pub fn remote_addr(&self) -> SocketAddr {
        self.socket.remote_addr()
    }

    /// Whether the session has been closed
    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of pulls awaiting a reply
    pub fn pending_pulls(&self) -> usize {
        self.pulls.len()
    }

    pub(crate) fn socket(&self) -> &Arc<Socket> {
        &self.socket
    }

    pub(crate) fn config(&self) -> &PeerConfig {
        &self.peer.config
    }

    pub(crate) fn pull_router(&self) -> &Router<PullHandler> {
        &self.pull_router
    }

    pub(crate) fn push_router(&self) -> &Router<PushHandler> {
        &self.push_router
    }

    /// Atomically remove the correlation entry for `seq`, if still live
    pub(crate) fn take_pull(&self, seq: u64) -> Option<Box<dyn PullComplete>> {
        self.pulls.remove(&seq).map(|(_, cmd)| cmd)
    }

    /// Send a pull and receive the reply asynchronously.
    ///
    /// `done` must have room for every pull that may settle on it
    /// concurrently; one `PullCmd` is delivered per call, exactly once,
    /// whatever the ordering of reply, close, and write failure.
    pub async fn go_pull<A, R>(
        self: &Arc<Self>,
        uri: &str,
        args: &A,
        done: mpsc::Sender<PullCmd<R>>,
        settings: &[PacketSetting],
    ) where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        let mut output = Packet::default();
        output.header.seq = self.pull_seq.fetch_add(1, Ordering::Relaxed);
        output.header.typ = PacketType::Pull.into();
        output.header.uri = uri.to_owned();
        output.header.gzip = self.peer.config.default_gzip_level;
        output.header_codec = self.peer.config.default_header_codec;
        output.body_codec = Some(self.peer.config.default_body_codec);
        for setting in settings {
            setting.apply(&mut output);
        }

        let start = Instant::now();
        if let Err(e) = output.encode_body(args) {
            let cmd: Box<dyn PullComplete> = Box::new(TypedPull {
                output,
                start,
                done,
            });
            cmd.complete(PullOutcome::Failed(Status::new(
                status_code::WRITE_FAILED,
                e.to_string(),
            )));
            return;
        }

        match self.write(&mut output).await {
            Ok(()) => {
                let seq = output.header.seq;
                self.pulls.insert(
                    seq,
                    Box::new(TypedPull {
                        output,
                        start,
                        done,
                    }),
                );
                if self.closed() {
                    // Close may have drained the table before the insert
                    // landed; settle the straggler ourselves.
                    if let Some(cmd) = self.take_pull(seq) {
                        cmd.complete(PullOutcome::Failed(Status::from_code(
                            status_code::CONN_CLOSED,
                        )));
                    }
                }
            }
            Err(e) => {
                let cmd: Box<dyn PullComplete> = Box::new(TypedPull {
                    output,
                    start,
                    done,
                });
                cmd.complete(PullOutcome::Failed(Status::new(
                    status_code::WRITE_FAILED,
                    e.to_string(),
                )));
            }
        }
    }

    /// Send a pull and wait for its reply
    pub async fn pull<A, R>(
        self: &Arc<Self>,
        uri: &str,
        args: &A,
        settings: &[PacketSetting],
    ) -> PullCmd<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        let (done, mut replies) = mpsc::channel(1);
        self.go_pull(uri, args, done, settings).await;
        match replies.recv().await {
            Some(cmd) => cmd,
            // Unreachable while every entry is completed exactly once.
            None => PullCmd {
                uri: uri.to_owned(),
                reply: None,
                status: Status::from_code(status_code::CONN_CLOSED),
                cost: Duration::ZERO,
            },
        }
    }

    /// Send a push; no reply is expected
    pub async fn push<A>(&self, uri: &str, args: &A) -> Result<(), SessionError>
    where
        A: Serialize + ?Sized,
    {
        let start = Instant::now();
        let mut packet = Packet::default();
        packet.header.seq = self.push_seq.fetch_add(1, Ordering::Relaxed);
        packet.header.typ = PacketType::Push.into();
        packet.header.uri = uri.to_owned();
        packet.header.gzip = self.peer.config.default_gzip_level;
        packet.header_codec = self.peer.config.default_header_codec;
        packet.body_codec = Some(self.peer.config.default_body_codec);
        packet.encode_body(args)?;

        let result = self.write(&mut packet).await;
        oplog::exchange(
            &self.remote_ip(),
            self.peer.config.slow_threshold,
            self.peer.config.print_body,
            start.elapsed(),
            None,
            Some(&packet),
        );
        result
    }

    /// Write one packet under the session write lock.
    ///
    /// Any failure closes the session before the error is returned; a panic
    /// in the write path is converted to a synthetic error.
    pub(crate) async fn write(&self, packet: &mut Packet) -> Result<(), SessionError> {
        let result = {
            let mut writer = self.writer.lock().await;
            if let Some(timeout) = self.peer.config.write_timeout {
                writer.set_write_deadline(coarse::now() + timeout);
            }
            AssertUnwindSafe(writer.write_packet(packet)).catch_unwind().await
        };
        let result: Result<(), SessionError> = match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(translate_write_error(e)),
            Err(panic) => Err(SessionError::WritePanic(worker::panic_message(&panic))),
        };
        if let Err(err) = result {
            if let Err(e) = self.close().await {
                debug!("close after write failure: {}", e);
            }
            return Err(err);
        }
        Ok(())
    }

    /// Close the session. Idempotent.
    ///
    /// Every pull still awaiting a reply is completed with
    /// [`status_code::CONN_CLOSED`] before this returns.
    pub async fn close(&self) -> Result<(), SessionError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.close_notify.notify_waiters();

        let seqs: Vec<u64> = self.pulls.iter().map(|entry| *entry.key()).collect();
        for seq in seqs {
            if let Some(cmd) = self.take_pull(seq) {
                cmd.complete(PullOutcome::Failed(Status::from_code(
                    status_code::CONN_CLOSED,
                )));
            }
        }

        self.peer.hub.remove(&self.id());

        let mut writer = self.writer.lock().await;
        writer
            .shutdown()
            .await
            .map_err(|e| SessionError::Socket(SocketError::Io(e)))
    }

    async fn read_loop(self: Arc<Self>, mut reader: SocketReader) {
        let outcome = AssertUnwindSafe(read_packets(&self, &mut reader))
            .catch_unwind()
            .await;
        if let Err(panic) = outcome {
            debug!("reader panicked: {}", worker::panic_message(&panic));
        }
        if let Err(e) = self.close().await {
            debug!("close after reader exit: {}", e);
        }
    }
}

fn translate_write_error(e: SocketError) -> SessionError {
    match e {
        SocketError::Eof => SessionError::Closed,
        SocketError::Io(ref io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
            SessionError::Closed
        }
        other => SessionError::Socket(other),
    }
}

enum ReadEvent {
    Closed,
    Done(Result<(), SocketError>),
}

async fn read_packets(session: &Arc<Session>, reader: &mut SocketReader) {
    let read_timeout = session.peer.config.read_timeout;
    while !session.closed() {
        let mut ctx = session.peer.contexts.get();
        ctx.reinit(Arc::clone(session));

        if let Some(timeout) = read_timeout {
            reader.set_read_deadline(coarse::now() + timeout);
        }

        // Register for the close signal before re-checking the flag; a
        // notification between the loop guard and the select cannot be lost.
        let notified = session.close_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if session.closed() {
            session.peer.contexts.put(ctx);
            return;
        }

        let event = tokio::select! {
            biased;
            _ = &mut notified => ReadEvent::Closed,
            result = reader.read_packet(ctx.as_mut()) => ReadEvent::Done(result),
        };
        match event {
            ReadEvent::Closed => {
                session.peer.contexts.put(ctx);
                return;
            }
            ReadEvent::Done(Ok(())) => {}
            ReadEvent::Done(Err(SocketError::Eof)) => {
                // Clean remote close; nothing worth a log line.
                session.peer.contexts.put(ctx);
                return;
            }
            ReadEvent::Done(Err(e)) => {
                session.peer.contexts.put(ctx);
                debug!("read_packet failed: {}", e);
                return;
            }
        }

        let worker_session = Arc::clone(session);
        let dispatched = session.peer.workers.go(async move {
            let mut ctx = ctx;
            ctx.handle().await;
            worker_session.peer.contexts.put(ctx);
        });
        if let Err(e) = dispatched {
            warn!("{}", e);
        }
    }
}
