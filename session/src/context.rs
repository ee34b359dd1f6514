//! Per-packet exchange context and its pool.
//!
//! One context carries one inbound packet from the reader, across a worker,
//! to its conclusion (handler reply, push completion, or pull settlement).
//! Contexts are recycled through a bounded free list on the peer so the
//! steady state allocates nothing per packet. A context handed out by the
//! pool is exclusively owned until it is put back.

use crate::oplog;
use crate::pull::{PullComplete, PullOutcome};
use crate::router::{CallCtx, PullHandler, PushHandler};
use crate::session::Session;
use crate::socket::{BodyDisposition, PacketBinder};
use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;
use tether_wire::{status_code, CodecKind, Header, Packet, PacketType};

/// Split a request URI into path and raw query string.
///
/// A URI is well-formed iff it starts with `/`; everything after the first
/// `?` is the query string.
fn parse_uri(uri: &str) -> Option<(&str, &str)> {
    if !uri.starts_with('/') {
        return None;
    }
    match uri.split_once('?') {
        Some((path, query)) => Some((path, query)),
        None => Some((uri, "")),
    }
}

/// Execution context for one inbound packet
pub struct ExchangeContext {
    session: Option<Arc<Session>>,
    pub(crate) input: Packet,
    output: Packet,
    path: String,
    query_raw: String,
    public: Option<Arc<DashMap<String, serde_json::Value>>>,
    pull_handler: Option<Arc<PullHandler>>,
    push_handler: Option<Arc<PushHandler>>,
    pull: Option<Box<dyn PullComplete>>,
    start: Instant,
    cost: Duration,
}

impl ExchangeContext {
    pub(crate) fn new() -> Self {
        Self {
            session: None,
            input: Packet::default(),
            output: Packet::default(),
            path: String::new(),
            query_raw: String::new(),
            public: None,
            pull_handler: None,
            push_handler: None,
            pull: None,
            start: Instant::now(),
            cost: Duration::ZERO,
        }
    }

    /// Prepare a pooled context for the next packet on `session`
    pub(crate) fn reinit(&mut self, session: Arc<Session>) {
        let public = Arc::new(DashMap::new());
        let socket = session.socket();
        if socket.public_len() > 0 {
            for entry in socket.public().iter() {
                public.insert(entry.key().clone(), entry.value().clone());
            }
        }
        self.public = Some(public);
        self.session = Some(session);
    }

    /// Reset so no prior-request references survive pool reuse
    pub(crate) fn clean(&mut self) {
        self.session = None;
        self.public = None;
        self.pull_handler = None;
        self.push_handler = None;
        self.pull = None;
        self.path.clear();
        self.query_raw.clear();
        self.cost = Duration::ZERO;
        self.input.reset();
        self.output.reset();
    }

    fn bind_push(&mut self, header: &Header) -> BodyDisposition {
        let Some((path, query)) = parse_uri(&header.uri) else {
            return BodyDisposition::Discard;
        };
        let Some(session) = &self.session else {
            return BodyDisposition::Discard;
        };
        match session.push_router().get(path) {
            Some(handler) => {
                self.path = path.to_owned();
                self.query_raw = query.to_owned();
                self.push_handler = Some(handler);
                BodyDisposition::Keep
            }
            None => BodyDisposition::Discard,
        }
    }

    fn bind_pull(&mut self, header: &Header, header_codec: CodecKind) -> BodyDisposition {
        self.output.header.seq = header.seq;
        self.output.header.typ = PacketType::PullReply.into();
        self.output.header.uri = header.uri.clone();
        self.output.header.gzip = header.gzip;
        self.output.header_codec = header_codec;

        let Some((path, query)) = parse_uri(&header.uri) else {
            self.output.header.status_code = status_code::BAD_PULL;
            self.output.header.status = format!("malformed uri: {:?}", header.uri);
            return BodyDisposition::Discard;
        };
        let Some(session) = &self.session else {
            return BodyDisposition::Discard;
        };
        match session.pull_router().get(path) {
            Some(handler) => {
                self.path = path.to_owned();
                self.query_raw = query.to_owned();
                self.pull_handler = Some(handler);
                BodyDisposition::Keep
            }
            None => {
                self.output.header.status_code = status_code::NOT_FOUND;
                self.output.header.status = status_code::text(status_code::NOT_FOUND).into();
                BodyDisposition::Discard
            }
        }
    }

    fn bind_pull_reply(&mut self, header: &Header) -> BodyDisposition {
        let Some(session) = &self.session else {
            return BodyDisposition::Discard;
        };
        // Removing the entry here, before any signal, is what makes a
        // second completion for the same seq impossible.
        match session.take_pull(header.seq) {
            Some(cmd) => {
                self.pull = Some(cmd);
                BodyDisposition::Keep
            }
            None => BodyDisposition::Discard,
        }
    }

    /// Handle the bound packet on a worker
    pub(crate) async fn handle(&mut self) {
        match self.input.header.packet_type() {
            Some(PacketType::Push) => self.handle_push().await,
            Some(PacketType::Pull) => self.handle_pull().await,
            Some(PacketType::PullReply) => self.pull_reply_handle(),
            None => {}
        }
    }

    fn call_ctx(&self, session: &Arc<Session>) -> (CallCtx, Arc<Mutex<Option<CodecKind>>>) {
        let reply_codec = Arc::new(Mutex::new(None));
        let public = self
            .public
            .clone()
            .unwrap_or_else(|| Arc::new(DashMap::new()));
        let ctx = CallCtx::new(
            Arc::clone(session),
            self.input.header.uri.clone(),
            self.path.clone(),
            self.query_raw.clone(),
            public,
            Arc::clone(&reply_codec),
        );
        (ctx, reply_codec)
    }

    async fn handle_push(&mut self) {
        // No route: the body was already discarded at bind time.
        let Some(handler) = self.push_handler.take() else {
            return;
        };
        let Some(session) = self.session.clone() else {
            return;
        };
        let arg = match (handler.decode)(&self.input) {
            Ok(arg) => arg,
            Err(e) => {
                debug!("push body decode failed on {}: {}", self.input.header.uri, e);
                return;
            }
        };
        let (ctx, _) = self.call_ctx(&session);
        (handler.invoke)(ctx, arg).await;

        self.cost = self.start.elapsed();
        let config = session.config();
        oplog::exchange(
            &session.remote_ip(),
            config.slow_threshold,
            config.print_body,
            self.cost,
            Some(&self.input),
            None,
        );
    }

    async fn handle_pull(&mut self) {
        let Some(session) = self.session.clone() else {
            return;
        };

        if self.output.header.status_code == 0 {
            match self.pull_handler.take() {
                Some(handler) => match (handler.decode)(&self.input) {
                    Ok(arg) => {
                        let (ctx, reply_codec) = self.call_ctx(&session);
                        match (handler.invoke)(ctx, arg).await {
                            Ok(reply) => {
                                let chosen = reply_codec.lock().expect("reply codec lock").take();
                                if let Some(codec) = chosen {
                                    self.output.body_codec = Some(codec);
                                }
                                if self.output.body_codec.is_none() {
                                    self.output.body_codec = self.input.body_codec;
                                }
                                let codec = self
                                    .output
                                    .body_codec
                                    .unwrap_or(session.config().default_body_codec);
                                self.output.body_codec = Some(codec);
                                match reply.encode(codec).and_then(|raw| {
                                    self.output.set_body_bytes(raw)
                                }) {
                                    Ok(()) => {
                                        self.output.header.status_code = status_code::OK;
                                        self.output.header.status =
                                            status_code::text(status_code::OK).into();
                                    }
                                    Err(e) => {
                                        debug!(
                                            "reply body encode failed on {}: {}",
                                            self.input.header.uri, e
                                        );
                                        self.output.body = bytes::Bytes::new();
                                        self.output.header.status_code = status_code::WRITE_FAILED;
                                        self.output.header.status =
                                            status_code::text(status_code::WRITE_FAILED).into();
                                    }
                                }
                            }
                            Err(status) => {
                                self.output.header.status_code = status.code;
                                self.output.header.status = status.text;
                            }
                        }
                    }
                    Err(e) => {
                        self.output.header.status_code = status_code::BAD_PULL;
                        self.output.header.status = format!("undecodable argument: {e}");
                    }
                },
                None => {
                    self.output.header.status_code = status_code::NOT_FOUND;
                    self.output.header.status = status_code::text(status_code::NOT_FOUND).into();
                }
            }
        }

        // Status-only replies still need a body codec on the wire.
        if self.output.body_codec.is_none() {
            self.output.body_codec = self
                .input
                .body_codec
                .or(Some(session.config().default_body_codec));
        }

        if let Err(e) = session.write(&mut self.output).await {
            debug!("write pull reply failed: {}", e);
        }

        self.cost = self.start.elapsed();
        let config = session.config();
        oplog::exchange(
            &session.remote_ip(),
            config.slow_threshold,
            config.print_body,
            self.cost,
            Some(&self.input),
            Some(&self.output),
        );
    }

    /// Settle the pull this reply correlates to
    fn pull_reply_handle(&mut self) {
        let Some(cmd) = self.pull.take() else {
            // Late, duplicate, or post-close reply; already discarded.
            return;
        };
        let cost = cmd.started_at().elapsed();
        if let Some(session) = &self.session {
            let config = session.config();
            oplog::exchange(
                &session.remote_ip(),
                config.slow_threshold,
                config.print_body,
                cost,
                Some(&self.input),
                Some(cmd.output()),
            );
        }
        cmd.complete(PullOutcome::Reply(std::mem::take(&mut self.input)));
    }
}

impl PacketBinder for ExchangeContext {
    fn bind(&mut self, header: &Header, header_codec: CodecKind) -> BodyDisposition {
        self.start = Instant::now();
        match PacketType::try_from(header.typ) {
            Ok(PacketType::PullReply) => self.bind_pull_reply(header),
            Ok(PacketType::Push) => self.bind_push(header),
            Ok(PacketType::Pull) => self.bind_pull(header, header_codec),
            Err(_) => BodyDisposition::Discard,
        }
    }

    fn input(&mut self) -> &mut Packet {
        &mut self.input
    }
}

/// Bounded free list of exchange contexts
pub(crate) struct ContextPool {
    free: Mutex<Vec<Box<ExchangeContext>>>,
    cap: usize,
}

impl ContextPool {
    pub(crate) fn new(cap: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            cap,
        }
    }

    /// A clean context, recycled when one is available
    pub(crate) fn get(&self) -> Box<ExchangeContext> {
        self.free
            .lock()
            .expect("context pool lock")
            .pop()
            .unwrap_or_else(|| Box::new(ExchangeContext::new()))
    }

    /// Clean and return a context; dropped instead when the pool is full
    pub(crate) fn put(&self, mut ctx: Box<ExchangeContext>) {
        ctx.clean();
        let mut free = self.free.lock().expect("context pool lock");
        if free.len() < self.cap {
            free.push(ctx);
        }
    }

    #[cfg(test)]
    pub(crate) fn idle(&self) -> usize {
        self.free.lock().expect("context pool lock").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_uri() {
        assert_eq!(parse_uri("/echo"), Some(("/echo", "")));
        assert_eq!(parse_uri("/echo?x=1&y=2"), Some(("/echo", "x=1&y=2")));
        assert_eq!(parse_uri("echo"), None);
        assert_eq!(parse_uri(""), None);
    }

    #[test]
    fn test_pool_recycles_cleaned_contexts() {
        let pool = ContextPool::new(2);
        let mut ctx = pool.get();
        ctx.input.header.uri = "/left-over".into();
        ctx.path = "/left-over".into();
        pool.put(ctx);
        assert_eq!(pool.idle(), 1);

        let ctx = pool.get();
        assert!(ctx.input.header.uri.is_empty());
        assert!(ctx.path.is_empty());
        assert!(ctx.session.is_none());
        assert!(ctx.pull.is_none());
    }

    #[test]
    fn test_pool_cap_is_respected() {
        let pool = ContextPool::new(1);
        let a = pool.get();
        let b = pool.get();
        pool.put(a);
        pool.put(b);
        assert_eq!(pool.idle(), 1);
    }
}
