//! The peer: one endpoint of the framework, owning many sessions.
//!
//! The peer carries everything sessions share: the two routers, default
//! codecs and timeouts, the session hub, the context pool, and the worker
//! pool. Both `dial` and `listen` produce the same [`Session`] object;
//! which side connected first makes no difference afterwards.

use crate::coarse;
use crate::context::ContextPool;
use crate::router::{PullHandler, PushHandler, Router};
use crate::session::Session;
use crate::worker::{WorkerPool, DEFAULT_WORKER_CAP};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use tether_wire::CodecKind;

/// Default cap on pooled idle contexts
pub const DEFAULT_CONTEXT_POOL_CAP: usize = 256;

/// Peer-wide configuration shared by all its sessions
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Body codec used when neither caller nor handler chooses one
    pub default_body_codec: CodecKind,
    /// Header codec for outbound packets
    pub default_header_codec: CodecKind,
    /// Gzip level for outbound bodies; 0 disables compression
    pub default_gzip_level: u8,
    /// Read deadline per packet; `None` waits forever
    pub read_timeout: Option<Duration>,
    /// Write deadline per packet; `None` waits forever
    pub write_timeout: Option<Duration>,
    /// Exchanges slower than this log at warn with a `(slow)` tag
    pub slow_threshold: Duration,
    /// Whether the operation log renders packet bodies
    pub print_body: bool,
    /// Cap on concurrently executing handler workers
    pub worker_cap: usize,
    /// Cap on pooled idle exchange contexts
    pub context_pool_cap: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            default_body_codec: CodecKind::Json,
            default_header_codec: CodecKind::Json,
            default_gzip_level: 0,
            read_timeout: None,
            write_timeout: None,
            slow_threshold: Duration::from_secs(1),
            print_body: false,
            worker_cap: DEFAULT_WORKER_CAP,
            context_pool_cap: DEFAULT_CONTEXT_POOL_CAP,
        }
    }
}

/// State shared between the peer handle and its sessions
pub(crate) struct PeerShared {
    pub(crate) config: PeerConfig,
    pub(crate) pull_router: Arc<Router<PullHandler>>,
    pub(crate) push_router: Arc<Router<PushHandler>>,
    pub(crate) hub: DashMap<String, Arc<Session>>,
    pub(crate) contexts: ContextPool,
    pub(crate) workers: WorkerPool,
    closed: AtomicBool,
    close_notify: Notify,
}

/// One endpoint of the framework
#[derive(Clone)]
pub struct Peer {
    shared: Arc<PeerShared>,
}

impl Peer {
    /// Create a peer with its routers.
    ///
    /// Routers are fixed at construction; registration happens before the
    /// peer starts serving.
    pub fn new(
        config: PeerConfig,
        pull_router: Router<PullHandler>,
        push_router: Router<PushHandler>,
    ) -> Self {
        coarse::start_ticker();
        let shared = Arc::new(PeerShared {
            contexts: ContextPool::new(config.context_pool_cap),
            workers: WorkerPool::new(config.worker_cap),
            config,
            pull_router: Arc::new(pull_router),
            push_router: Arc::new(push_router),
            hub: DashMap::new(),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        });
        Peer { shared }
    }

    /// Connect to a remote peer and return the session
    pub async fn dial(&self, addr: impl ToSocketAddrs) -> std::io::Result<Arc<Session>> {
        let stream = TcpStream::connect(addr).await?;
        self.serve_stream(stream)
    }

    /// Adopt an already-connected stream as a session
    pub fn serve_stream(&self, stream: TcpStream) -> std::io::Result<Arc<Session>> {
        stream.set_nodelay(true)?;
        let session = Session::spawn(Arc::clone(&self.shared), stream, None)?;
        self.shared.hub.insert(session.id(), Arc::clone(&session));
        Ok(session)
    }

    /// Bind a listener and accept sessions until the peer is closed.
    ///
    /// Returns the bound address immediately; accepting runs in the
    /// background.
    pub async fn listen(&self, addr: impl ToSocketAddrs) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("listening on {}", local_addr);
        let peer = self.clone();
        tokio::spawn(async move {
            peer.accept_loop(listener).await;
        });
        Ok(local_addr)
    }

    async fn accept_loop(&self, listener: TcpListener) {
        loop {
            let notified = self.shared.close_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.shared.closed.load(Ordering::SeqCst) {
                return;
            }
            tokio::select! {
                _ = &mut notified => return,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!("accepted connection from {}", addr);
                        if let Err(e) = self.serve_stream(stream) {
                            warn!("failed to start session for {}: {}", addr, e);
                        }
                    }
                    Err(e) => {
                        warn!("accept failed: {}", e);
                    }
                },
            }
        }
    }

    /// Session registered under `id`
    pub fn session(&self, id: &str) -> Option<Arc<Session>> {
        self.shared.hub.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.shared.hub.len()
    }

    /// Close the peer: stop accepting, close every session, stop workers
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.close_notify.notify_waiters();

        let sessions: Vec<Arc<Session>> = self
            .shared
            .hub
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for session in sessions {
            if let Err(e) = session.close().await {
                debug!("session close: {}", e);
            }
        }
        self.shared.workers.stop();
    }
}
