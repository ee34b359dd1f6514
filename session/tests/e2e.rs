//! End-to-end tests: two real peers over loopback TCP.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tether_session::wire::{status_code, CodecKind, PacketSetting, Status};
use tether_session::{CallCtx, Peer, PeerConfig, PullCmd, PullRouter, PushRouter, Session};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Echo {
    x: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Evt {
    n: u64,
}

async fn boom_handler(_ctx: CallCtx, _arg: Echo) -> Result<Echo, Status> {
    panic!("handler exploded");
}

/// A server peer with `/echo`, `/slow`, `/boom`, `/query` pull routes and a
/// counting `/evt` push route.
fn server_peer(pull_count: Arc<AtomicU64>, push_count: Arc<AtomicU64>) -> Peer {
    let mut pulls = PullRouter::new();
    {
        let count = Arc::clone(&pull_count);
        pulls.register("/echo", move |_ctx: CallCtx, arg: Echo| {
            let count = Arc::clone(&count);
            async move {
                count.fetch_add(1, Ordering::Relaxed);
                Ok(arg)
            }
        });
    }
    pulls.register("/slow", |_ctx: CallCtx, arg: Echo| async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(arg)
    });
    pulls.register("/sleepy", |_ctx: CallCtx, arg: Echo| async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(arg)
    });
    pulls.register("/boom", boom_handler);
    pulls.register("/query", |ctx: CallCtx, _arg: Echo| async move {
        let x = ctx
            .query()
            .get("x")
            .and_then(|v| v.parse().ok())
            .unwrap_or(-1);
        Ok(Echo { x })
    });

    let mut pushes = PushRouter::new();
    {
        let count = Arc::clone(&push_count);
        pushes.register("/evt", move |_ctx: CallCtx, _arg: Evt| {
            let count = Arc::clone(&count);
            async move {
                count.fetch_add(1, Ordering::Relaxed);
            }
        });
    }

    let config = PeerConfig {
        worker_cap: 8192,
        ..PeerConfig::default()
    };
    Peer::new(config, pulls, pushes)
}

fn client_peer() -> Peer {
    Peer::new(PeerConfig::default(), PullRouter::new(), PushRouter::new())
}

async fn connected_pair() -> (Peer, Peer, Arc<Session>, Arc<AtomicU64>, Arc<AtomicU64>) {
    let pull_count = Arc::new(AtomicU64::new(0));
    let push_count = Arc::new(AtomicU64::new(0));
    let server = server_peer(Arc::clone(&pull_count), Arc::clone(&push_count));
    let addr = server.listen("127.0.0.1:0").await.unwrap();
    let client = client_peer();
    let session = client.dial(addr).await.unwrap();
    (server, client, session, pull_count, push_count)
}

async fn wait_until(deadline: Duration, mut probe: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if probe() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    probe()
}

#[tokio::test]
async fn test_echo_pull_round_trip() {
    let (_server, _client, session, _, _) = connected_pair().await;

    let cmd: PullCmd<Echo> = session.pull("/echo", &Echo { x: 1 }, &[]).await;
    assert!(cmd.is_ok(), "unexpected status: {}", cmd.status);
    assert_eq!(cmd.status.code, status_code::OK);
    assert_eq!(cmd.reply, Some(Echo { x: 1 }));
    assert_eq!(cmd.uri, "/echo");
    assert_eq!(session.pending_pulls(), 0);
}

#[tokio::test]
async fn test_missing_route_is_not_found() {
    let (_server, _client, session, pull_count, _) = connected_pair().await;

    let cmd: PullCmd<Echo> = session.pull("/missing", &Echo { x: 0 }, &[]).await;
    assert_eq!(cmd.status.code, status_code::NOT_FOUND);
    assert_eq!(cmd.status.text, "Not Found");
    assert!(cmd.reply.is_none());
    // No handler ran for the unknown route.
    assert_eq!(pull_count.load(Ordering::Relaxed), 0);
}

#[tokio::test]
async fn test_close_completes_outstanding_pull_exactly_once() {
    let (_server, _client, session, _, _) = connected_pair().await;

    let (done, mut replies) = mpsc::channel::<PullCmd<Echo>>(1);
    session.go_pull("/slow", &Echo { x: 1 }, done, &[]).await;
    assert_eq!(session.pending_pulls(), 1);

    session.close().await.unwrap();

    let cmd = tokio::time::timeout(Duration::from_secs(1), replies.recv())
        .await
        .expect("completion must arrive")
        .expect("channel must yield one command");
    assert_eq!(cmd.status.code, status_code::CONN_CLOSED);
    // Exactly once: the sender is gone, no second value can follow.
    assert!(replies.recv().await.is_none());
    assert_eq!(session.pending_pulls(), 0);
}

#[tokio::test]
async fn test_write_failure_reports_write_failed_and_leaves_table_empty() {
    let (_server, _client, session, _, _) = connected_pair().await;

    // Break the transport: closing shuts the write half down, so the next
    // write fails before reaching the wire.
    session.close().await.unwrap();

    let (done, mut replies) = mpsc::channel::<PullCmd<Echo>>(1);
    session.go_pull("/echo", &Echo { x: 1 }, done, &[]).await;

    let cmd = tokio::time::timeout(Duration::from_secs(1), replies.recv())
        .await
        .expect("completion must arrive")
        .expect("channel must yield one command");
    assert_eq!(cmd.status.code, status_code::WRITE_FAILED);
    assert_eq!(session.pending_pulls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_pushes_all_arrive() {
    const PER_TASK: u64 = 10_000;
    let (_server, _client, session, _, push_count) = connected_pair().await;

    let a = Arc::clone(&session);
    let b = Arc::clone(&session);
    let task_a = tokio::spawn(async move {
        for n in 0..PER_TASK {
            a.push("/evt", &Evt { n }).await.unwrap();
        }
    });
    let task_b = tokio::spawn(async move {
        for n in 0..PER_TASK {
            b.push("/evt", &Evt { n }).await.unwrap();
        }
    });
    task_a.await.unwrap();
    task_b.await.unwrap();

    assert!(
        wait_until(Duration::from_secs(20), || {
            push_count.load(Ordering::Relaxed) == 2 * PER_TASK
        })
        .await,
        "received {} of {} pushes",
        push_count.load(Ordering::Relaxed),
        2 * PER_TASK
    );
}

#[tokio::test]
async fn test_handler_panic_leaves_reader_serving() {
    let (_server, _client, session, _, _) = connected_pair().await;

    let (done, mut replies) = mpsc::channel::<PullCmd<Echo>>(1);
    session.go_pull("/boom", &Echo { x: 1 }, done, &[]).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The panicking handler produced no reply, but the session keeps
    // serving subsequent requests.
    let cmd: PullCmd<Echo> = session.pull("/echo", &Echo { x: 7 }, &[]).await;
    assert!(cmd.is_ok(), "unexpected status: {}", cmd.status);
    assert_eq!(cmd.reply, Some(Echo { x: 7 }));

    // The orphaned pull settles at close with CONN_CLOSED.
    session.close().await.unwrap();
    let orphan = tokio::time::timeout(Duration::from_secs(1), replies.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(orphan.status.code, status_code::CONN_CLOSED);
}

#[tokio::test]
async fn test_unknown_push_uri_is_silently_dropped() {
    let (_server, _client, session, _, push_count) = connected_pair().await;

    session.push("/nowhere", &Evt { n: 1 }).await.unwrap();
    // Session survives, and a routed exchange still works afterwards.
    let cmd: PullCmd<Echo> = session.pull("/echo", &Echo { x: 2 }, &[]).await;
    assert!(cmd.is_ok());
    assert_eq!(push_count.load(Ordering::Relaxed), 0);
}

#[tokio::test]
async fn test_remote_close_closes_session_quietly() {
    let (server, _client, session, _, _) = connected_pair().await;

    server.close().await;
    assert!(
        wait_until(Duration::from_secs(2), || session.closed()).await,
        "session must observe the remote close"
    );
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let (_server, _client, session, _, _) = connected_pair().await;

    session.close().await.unwrap();
    assert!(session.closed());
    assert!(session.close().await.is_ok());
    assert!(session.close().await.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_at_most_once_under_racing_close() {
    const PULLS: usize = 50;
    let (_server, _client, session, _, _) = connected_pair().await;

    let (done, mut replies) = mpsc::channel::<PullCmd<Echo>>(PULLS);
    for x in 0..PULLS {
        session
            .go_pull("/sleepy", &Echo { x: x as i64 }, done.clone(), &[])
            .await;
    }
    drop(done);

    tokio::time::sleep(Duration::from_millis(25)).await;
    session.close().await.unwrap();

    let mut settled = 0;
    while let Some(cmd) = replies.recv().await {
        assert!(
            cmd.status.code == status_code::OK || cmd.status.code == status_code::CONN_CLOSED,
            "unexpected status: {}",
            cmd.status
        );
        settled += 1;
    }
    assert_eq!(settled, PULLS, "every pull settles exactly once");
    assert_eq!(session.pending_pulls(), 0);
}

#[tokio::test]
async fn test_query_parameters_reach_handler() {
    let (_server, _client, session, _, _) = connected_pair().await;

    let cmd: PullCmd<Echo> = session.pull("/query?x=42&y=ignored", &Echo { x: 0 }, &[]).await;
    assert!(cmd.is_ok());
    assert_eq!(cmd.reply, Some(Echo { x: 42 }));
}

#[tokio::test]
async fn test_malformed_uri_is_bad_pull() {
    let (_server, _client, session, _, _) = connected_pair().await;

    let cmd: PullCmd<Echo> = session.pull("echo-without-slash", &Echo { x: 0 }, &[]).await;
    assert_eq!(cmd.status.code, status_code::BAD_PULL);
    assert!(cmd.reply.is_none());
}

#[tokio::test]
async fn test_cbor_and_gzip_settings() {
    let (_server, _client, session, _, _) = connected_pair().await;

    let cmd: PullCmd<Echo> = session
        .pull(
            "/echo",
            &Echo { x: 12345 },
            &[
                PacketSetting::BodyCodec(CodecKind::Cbor),
                PacketSetting::HeaderCodec(CodecKind::Cbor),
                PacketSetting::Gzip(6),
            ],
        )
        .await;
    assert!(cmd.is_ok(), "unexpected status: {}", cmd.status);
    assert_eq!(cmd.reply, Some(Echo { x: 12345 }));
}

#[tokio::test]
async fn test_change_id_re_registers_in_hub() {
    let (_server, client, session, _, _) = connected_pair().await;

    let old_id = session.id();
    assert!(client.session(&old_id).is_some());

    session.change_id("relabeled");
    assert_eq!(session.id(), "relabeled");
    assert!(client.session("relabeled").is_some());
    assert!(client.session(&old_id).is_none());
}

#[tokio::test]
async fn test_idle_read_timeout_closes_session() {
    let pull_count = Arc::new(AtomicU64::new(0));
    let push_count = Arc::new(AtomicU64::new(0));
    let server = server_peer(pull_count, push_count);
    let addr = server.listen("127.0.0.1:0").await.unwrap();

    let config = PeerConfig {
        read_timeout: Some(Duration::from_millis(150)),
        ..PeerConfig::default()
    };
    let client = Peer::new(config, PullRouter::new(), PushRouter::new());
    let session = client.dial(addr).await.unwrap();

    assert!(
        wait_until(Duration::from_secs(2), || session.closed()).await,
        "idle session must close after its read deadline"
    );
}

#[tokio::test]
async fn test_server_can_pull_client_symmetrically() {
    // Symmetry: the accepting side originates a pull served by the dialer.
    let server_seen = Arc::new(AtomicU64::new(0));
    let mut pulls = PullRouter::new();
    {
        let seen = Arc::clone(&server_seen);
        pulls.register("/mark", move |ctx: CallCtx, arg: Echo| {
            let seen = Arc::clone(&seen);
            async move {
                seen.fetch_add(1, Ordering::Relaxed);
                // Pull back over the same session, from inside a handler's
                // session handle.
                let back: PullCmd<Echo> =
                    ctx.session().pull("/double", &Echo { x: arg.x }, &[]).await;
                match back.reply {
                    Some(reply) => Ok(reply),
                    None => Err(back.status),
                }
            }
        });
    }
    let server = Peer::new(PeerConfig::default(), pulls, PushRouter::new());
    let addr = server.listen("127.0.0.1:0").await.unwrap();

    let mut client_pulls = PullRouter::new();
    client_pulls.register("/double", |_ctx: CallCtx, arg: Echo| async move {
        Ok(Echo { x: arg.x * 2 })
    });
    let client = Peer::new(PeerConfig::default(), client_pulls, PushRouter::new());
    let session = client.dial(addr).await.unwrap();

    let cmd: PullCmd<Echo> = session.pull("/mark", &Echo { x: 21 }, &[]).await;
    assert!(cmd.is_ok(), "unexpected status: {}", cmd.status);
    assert_eq!(cmd.reply, Some(Echo { x: 42 }));
    assert_eq!(server_seen.load(Ordering::Relaxed), 1);
}
