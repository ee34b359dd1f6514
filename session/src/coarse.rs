//! Coarse monotonic clock for deadline stamping.
//!
//! Stamping a read or write deadline on every packet with `Instant::now()`
//! costs a clock call per packet; under high request rates the session
//! instead reads a cached millisecond counter refreshed by one background
//! ticker thread. Cost measurement keeps using precise instants.

use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

static ANCHOR: Lazy<Instant> = Lazy::new(Instant::now);
static ELAPSED_MS: AtomicU64 = AtomicU64::new(0);
static TICKING: AtomicBool = AtomicBool::new(false);

/// Refresh interval of the cached counter
const TICK: Duration = Duration::from_millis(1);

/// Start the background ticker thread. Idempotent.
pub fn start_ticker() {
    if TICKING.swap(true, Ordering::SeqCst) {
        return;
    }
    Lazy::force(&ANCHOR);
    std::thread::Builder::new()
        .name("tether-coarse-clock".into())
        .spawn(|| loop {
            ELAPSED_MS.store(ANCHOR.elapsed().as_millis() as u64, Ordering::Relaxed);
            std::thread::sleep(TICK);
        })
        .expect("spawn coarse clock ticker");
}

/// Current time at millisecond resolution.
///
/// Falls back to a precise instant until the ticker has been started.
pub fn now() -> Instant {
    if !TICKING.load(Ordering::Relaxed) {
        return Instant::now();
    }
    *ANCHOR + Duration::from_millis(ELAPSED_MS.load(Ordering::Relaxed))
}
