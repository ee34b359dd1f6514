//! Tether demo peer binary.
//!
//! Runs one peer with `/echo` (pull) and `/evt` (push) routes. Either side
//! of a connection can serve and originate exchanges; `--listen` and
//! `--connect` may be combined on the same process.

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tether_session::wire::status_code;
use tether_session::{CallCtx, Peer, PullCmd, PullRouter, PushRouter};

mod config;
mod logging;

use config::TetherConfig;
use logging::TetherLogFormatter;

/// Symmetric RPC peer with demo routes
#[derive(Parser, Debug)]
#[command(name = "tether", version, about = "Symmetric bidirectional RPC peer")]
struct Args {
    /// Listen address, e.g. 0.0.0.0:9090
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Connect to address, e.g. 127.0.0.1:9090 (repeatable)
    #[arg(long)]
    connect: Vec<SocketAddr>,

    /// Path to the YAML config file
    #[arg(long, default_value = "tether.yaml")]
    config: PathBuf,

    /// Body/header codec: json or cbor
    #[arg(long)]
    codec: Option<String>,

    /// Gzip level for outbound bodies (0 disables)
    #[arg(long)]
    gzip: Option<u8>,

    /// Per-packet read timeout, e.g. 30s (0s waits forever)
    #[arg(long, default_value = "0s")]
    read_timeout: humantime::Duration,

    /// Exchanges slower than this log at warn, e.g. 500ms
    #[arg(long, default_value = "1s")]
    slow_threshold: humantime::Duration,

    /// Render packet bodies in the operation log
    #[arg(long)]
    print_body: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct EchoBody {
    x: i64,
    note: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EventBody {
    kind: String,
    n: u64,
}

fn routers() -> (PullRouter, PushRouter) {
    let mut pulls = PullRouter::new();
    pulls.register("/echo", |ctx: CallCtx, arg: EchoBody| async move {
        info!("echo from {}: x={} note={:?}", ctx.remote_addr(), arg.x, arg.note);
        Ok(arg)
    });
    pulls.register("/stats", |ctx: CallCtx, _arg: serde_json::Value| async move {
        Ok(serde_json::json!({
            "session": ctx.session().id(),
            "pending_pulls": ctx.session().pending_pulls(),
        }))
    });

    let mut pushes = PushRouter::new();
    pushes.register("/evt", |ctx: CallCtx, arg: EventBody| async move {
        info!(
            "event from {}: kind={} n={}",
            ctx.remote_addr(),
            arg.kind,
            arg.n
        );
    });

    (pulls, pushes)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone()));
    tracing_subscriber::fmt()
        .event_format(TetherLogFormatter::new())
        .with_env_filter(filter)
        .init();

    let mut config = TetherConfig::load_from_file(&args.config)?;
    if let Some(codec) = &args.codec {
        config.codec = codec.clone();
    }
    if let Some(gzip) = args.gzip {
        config.gzip_level = gzip;
    }
    config.read_timeout_secs = args.read_timeout.as_secs();
    config.slow_threshold_ms = args.slow_threshold.as_millis() as u64;
    config.print_body |= args.print_body;

    let peer_config = config.to_peer_config()?;
    let (pulls, pushes) = routers();
    let peer = Peer::new(peer_config, pulls, pushes);

    let listen = args
        .listen
        .or_else(|| config.listen.as_deref().and_then(|s| s.parse().ok()));
    if let Some(addr) = listen {
        let bound = peer.listen(addr).await?;
        info!("serving on {}", bound);
    }

    let mut targets: Vec<SocketAddr> = args.connect.clone();
    for target in &config.connect {
        match target.parse() {
            Ok(addr) => targets.push(addr),
            Err(e) => warn!("skipping connect target {:?}: {}", target, e),
        }
    }

    for addr in targets {
        let session = peer.dial(addr).await?;
        info!("connected to {} as session {}", addr, session.id());

        // Exercise both directions once so a fresh link shows up in the logs.
        let cmd: PullCmd<EchoBody> = session
            .pull(
                "/echo",
                &EchoBody {
                    x: 1,
                    note: "hello from tether".into(),
                },
                &[],
            )
            .await;
        if cmd.status.code == status_code::OK {
            info!("echo reply in {:?}: {:?}", cmd.cost, cmd.reply);
        } else {
            warn!("echo pull failed: {}", cmd.status);
        }
        session
            .push(
                "/evt",
                &EventBody {
                    kind: "hello".into(),
                    n: 1,
                },
            )
            .await?;
    }

    if listen.is_none() && peer.session_count() == 0 {
        warn!("nothing to do: no --listen and no --connect");
        return Ok(());
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    peer.close().await;
    Ok(())
}
