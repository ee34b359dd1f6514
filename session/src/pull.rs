//! Outstanding outbound pulls and their completion.
//!
//! Each `go_pull` leaves one entry in the session's correlation table. The
//! entry erases the caller's reply type behind [`PullComplete`]; completing
//! consumes the box, so a second signal for the same sequence number is
//! impossible by construction.

use serde::de::DeserializeOwned;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::warn;
use tether_wire::{status_code, Packet, Status};

/// The settled result of one pull, delivered on the caller's done channel.
#[derive(Debug)]
pub struct PullCmd<R> {
    /// URI the pull was sent to
    pub uri: String,
    /// Decoded reply body; `None` unless the status is OK
    pub reply: Option<R>,
    /// Final status: OK, or why the pull failed
    pub status: Status,
    /// Time from issuing the pull to completion
    pub cost: Duration,
}

impl<R> PullCmd<R> {
    /// Whether the pull succeeded
    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }
}

/// How an outstanding pull ended
pub(crate) enum PullOutcome {
    /// A correlated reply packet arrived
    Reply(Packet),
    /// The pull failed locally (write failure, session close)
    Failed(Status),
}

/// One live correlation-table entry, reply type erased.
pub(crate) trait PullComplete: Send + Sync {
    /// The packet that was sent, kept so the logger can read URI and body
    fn output(&self) -> &Packet;
    /// When the pull was issued
    fn started_at(&self) -> Instant;
    /// Settle the pull; consumes the entry
    fn complete(self: Box<Self>, outcome: PullOutcome);
}

pub(crate) struct TypedPull<R> {
    pub(crate) output: Packet,
    pub(crate) start: Instant,
    pub(crate) done: mpsc::Sender<PullCmd<R>>,
}

impl<R> PullComplete for TypedPull<R>
where
    R: DeserializeOwned + Send + 'static,
{
    fn output(&self) -> &Packet {
        &self.output
    }

    fn started_at(&self) -> Instant {
        self.start
    }

    fn complete(self: Box<Self>, outcome: PullOutcome) {
        let cost = self.start.elapsed();
        let uri = self.output.header.uri.clone();
        let cmd = match outcome {
            PullOutcome::Reply(input) => {
                let status = if input.header.status_code == status_code::OK {
                    Status::ok()
                } else {
                    Status::new(input.header.status_code, input.header.status.clone())
                };
                if status.is_ok() {
                    match input.decode_body::<R>() {
                        Ok(reply) => PullCmd {
                            uri,
                            reply: Some(reply),
                            status,
                            cost,
                        },
                        Err(e) => PullCmd {
                            uri,
                            reply: None,
                            status: Status::new(
                                status_code::BAD_PULL,
                                format!("undecodable reply: {e}"),
                            ),
                            cost,
                        },
                    }
                } else {
                    PullCmd {
                        uri,
                        reply: None,
                        status,
                        cost,
                    }
                }
            }
            PullOutcome::Failed(status) => PullCmd {
                uri,
                reply: None,
                status,
                cost,
            },
        };
        // The caller promised enough buffer for its in-flight pulls; if it
        // lied the completion is dropped here rather than blocking the
        // reader.
        if let Err(e) = self.done.try_send(cmd) {
            warn!(uri = %uri_of(&e), "pull completion dropped: {}", e);
        }
    }
}

fn uri_of<R>(e: &mpsc::error::TrySendError<PullCmd<R>>) -> &str {
    match e {
        mpsc::error::TrySendError::Full(cmd) | mpsc::error::TrySendError::Closed(cmd) => &cmd.uri,
    }
}
