//! Session core for tether: a symmetric, bidirectional RPC runtime.
//!
//! Either endpoint of a connection may originate a request/response
//! exchange (a *pull*) or a fire-and-forget notification (a *push*). This
//! crate owns the per-connection state machine: one reader task per
//! session, a bounded worker pool for handler execution, a serialized
//! writer, and the correlation table for outstanding pulls, all under
//! graceful shutdown with at-most-once reply delivery.
//!
//! ## Example
//!
//! ```rust,no_run
//! use tether_session::{CallCtx, Peer, PeerConfig, PullRouter, PushRouter};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Echo {
//!     x: u32,
//! }
//!
//! # async fn example() -> anyhow::Result<()> {
//! let mut pulls = PullRouter::new();
//! pulls.register("/echo", |_ctx: CallCtx, arg: Echo| async move { Ok(arg) });
//!
//! let server = Peer::new(PeerConfig::default(), pulls, PushRouter::new());
//! let addr = server.listen("127.0.0.1:0").await?;
//!
//! let client = Peer::new(PeerConfig::default(), PullRouter::new(), PushRouter::new());
//! let session = client.dial(addr).await?;
//! let cmd = session.pull::<_, Echo>("/echo", &Echo { x: 1 }, &[]).await;
//! assert!(cmd.is_ok());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod coarse;
mod context;
pub mod error;
mod oplog;
mod pull;
pub mod router;
mod session;
pub mod socket;
pub mod worker;

mod peer;

pub use error::{SessionError, SocketError};
pub use peer::{Peer, PeerConfig, DEFAULT_CONTEXT_POOL_CAP};
pub use pull::PullCmd;
pub use router::{CallCtx, PullHandler, PullRouter, PushHandler, PushRouter, ReplyBody, Router};
pub use session::Session;
pub use socket::{BodyDisposition, PacketBinder, Socket};
pub use worker::{WorkerError, WorkerPool, DEFAULT_WORKER_CAP};

// The wire contract is part of this crate's API surface.
pub use tether_wire as wire;
