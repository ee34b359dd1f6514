//! URI routing and handler descriptors.
//!
//! Registration captures the concrete argument and reply types in two
//! closures: a type-erased body decoder and a typed invoker. The router
//! itself only ever sees trait objects, so dispatch needs no reflection
//! and no knowledge of handler signatures.

use crate::session::Session;
use dashmap::DashMap;
use futures::future::BoxFuture;
use once_cell::sync::OnceCell;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tether_wire::{CodecError, CodecKind, Packet, Status};

/// Context handed to every handler invocation.
///
/// Owns everything the handler may touch after the reader has moved on:
/// the session (for pushing or pulling back over the same connection),
/// the parsed request URI, and the per-connection public data.
pub struct CallCtx {
    session: Arc<Session>,
    uri: String,
    path: String,
    query_raw: String,
    query: OnceCell<HashMap<String, String>>,
    public: Arc<DashMap<String, serde_json::Value>>,
    reply_codec: Arc<Mutex<Option<CodecKind>>>,
}

impl CallCtx {
    pub(crate) fn new(
        session: Arc<Session>,
        uri: String,
        path: String,
        query_raw: String,
        public: Arc<DashMap<String, serde_json::Value>>,
        reply_codec: Arc<Mutex<Option<CodecKind>>>,
    ) -> Self {
        Self {
            session,
            uri,
            path,
            query_raw,
            query: OnceCell::new(),
            public,
            reply_codec,
        }
    }

    /// The session this exchange arrived on
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Full request URI
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// URI path component
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Query parameters, parsed on first access
    pub fn query(&self) -> &HashMap<String, String> {
        self.query.get_or_init(|| {
            url::form_urlencoded::parse(self.query_raw.as_bytes())
                .into_owned()
                .collect()
        })
    }

    /// Per-connection public data, shared with middleware and later
    /// exchanges on the same connection
    pub fn public(&self) -> &DashMap<String, serde_json::Value> {
        &self.public
    }

    /// Remote peer address
    pub fn remote_addr(&self) -> SocketAddr {
        self.session.remote_addr()
    }

    /// Choose the body codec for the reply packet.
    ///
    /// Without a choice the reply inherits the request's body codec.
    /// Meaningless on push handlers.
    pub fn set_reply_codec(&self, codec: CodecKind) {
        *self.reply_codec.lock().expect("reply codec lock") = Some(codec);
    }
}

/// A reply value with its concrete type erased; it can still serialize
/// itself with any registered codec and render itself for body logging.
pub trait ReplyBody: Send {
    /// Serialize with the chosen codec
    fn encode(&self, codec: CodecKind) -> Result<Vec<u8>, CodecError>;
    /// Pretty rendering for the operation log
    fn render(&self) -> String;
}

impl<T> ReplyBody for T
where
    T: Serialize + Send,
{
    fn encode(&self, codec: CodecKind) -> Result<Vec<u8>, CodecError> {
        codec.encode(self)
    }

    fn render(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "<unrenderable>".into())
    }
}

type ArgDecoder = Arc<dyn Fn(&Packet) -> Result<Box<dyn Any + Send>, CodecError> + Send + Sync>;
type PullInvoker = Arc<
    dyn Fn(CallCtx, Box<dyn Any + Send>) -> BoxFuture<'static, Result<Box<dyn ReplyBody>, Status>>
        + Send
        + Sync,
>;
type PushInvoker =
    Arc<dyn Fn(CallCtx, Box<dyn Any + Send>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Descriptor for one registered pull route
pub struct PullHandler {
    path: String,
    pub(crate) decode: ArgDecoder,
    pub(crate) invoke: PullInvoker,
}

impl PullHandler {
    /// Registered path
    pub fn path(&self) -> &str {
        &self.path
    }
}

/// Descriptor for one registered push route
pub struct PushHandler {
    path: String,
    pub(crate) decode: ArgDecoder,
    pub(crate) invoke: PushInvoker,
}

impl PushHandler {
    /// Registered path
    pub fn path(&self) -> &str {
        &self.path
    }
}

/// URI path to handler table; built before serving, shared immutably after
pub struct Router<H> {
    table: HashMap<String, Arc<H>>,
}

impl<H> Router<H> {
    /// Empty router
    pub fn new() -> Self {
        Self {
            table: HashMap::new(),
        }
    }

    /// Handler registered at `path`
    pub fn get(&self, path: &str) -> Option<Arc<H>> {
        self.table.get(path).cloned()
    }

    /// Number of registered routes
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Whether no routes are registered
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl<H> Default for Router<H> {
    fn default() -> Self {
        Self::new()
    }
}

/// Router for pull routes
pub type PullRouter = Router<PullHandler>;
/// Router for push routes
pub type PushRouter = Router<PushHandler>;

impl Router<PullHandler> {
    /// Register a pull route.
    ///
    /// The argument type is fixed here; inbound bodies at this path are
    /// decoded into `A` and the reply is serialized from `R`.
    pub fn register<A, R, F, Fut>(&mut self, path: impl Into<String>, handler: F)
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(CallCtx, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, Status>> + Send + 'static,
    {
        let path = path.into();
        let decode: ArgDecoder = Arc::new(|packet: &Packet| {
            Ok(Box::new(packet.decode_body::<A>()?) as Box<dyn Any + Send>)
        });
        let handler = Arc::new(handler);
        let invoke: PullInvoker = Arc::new(move |ctx, arg| {
            let handler = Arc::clone(&handler);
            let arg = *arg
                .downcast::<A>()
                .expect("argument type fixed at registration");
            Box::pin(async move {
                (*handler)(ctx, arg)
                    .await
                    .map(|reply| Box::new(reply) as Box<dyn ReplyBody>)
            })
        });
        self.table.insert(
            path.clone(),
            Arc::new(PullHandler {
                path,
                decode,
                invoke,
            }),
        );
    }
}

impl Router<PushHandler> {
    /// Register a push route. Push handlers return nothing; no reply is
    /// ever written for a push.
    pub fn register<A, F, Fut>(&mut self, path: impl Into<String>, handler: F)
    where
        A: DeserializeOwned + Send + 'static,
        F: Fn(CallCtx, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let path = path.into();
        let decode: ArgDecoder = Arc::new(|packet: &Packet| {
            Ok(Box::new(packet.decode_body::<A>()?) as Box<dyn Any + Send>)
        });
        let handler = Arc::new(handler);
        let invoke: PushInvoker = Arc::new(move |ctx, arg| {
            let handler = Arc::clone(&handler);
            let arg = *arg
                .downcast::<A>()
                .expect("argument type fixed at registration");
            Box::pin(async move {
                (*handler)(ctx, arg).await;
            })
        });
        self.table.insert(
            path.clone(),
            Arc::new(PushHandler {
                path,
                decode,
                invoke,
            }),
        );
    }
}
