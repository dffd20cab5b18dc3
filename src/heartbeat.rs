//! Heartbeat monitor.
//!
//! Ticks for the supervisor's lifetime, pinging the broker through the
//! dispatcher so the probe exercises the same path as real traffic. One
//! failure is noise; five in a row mean the session is wedged in a way the
//! serve loop cannot see (e.g. traffic silently black-holed), so the
//! monitor closes the multiplexer and lets the supervisor reconnect.

use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::dispatch::Tunnel;

const ENDPOINT: &str = "/api/v1/minion/ping";
const PING_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Allowed configuration window; out-of-range values clamp to the minimum.
pub(crate) const MIN_INTERVAL: Duration = Duration::from_secs(60);
pub(crate) const MAX_INTERVAL: Duration = Duration::from_secs(20 * 60);

/// Zero disables the monitor; anything outside `[1 min, 20 min]` becomes
/// 1 min.
pub(crate) fn clamp_interval(interval: Duration) -> Option<Duration> {
    if interval.is_zero() {
        return None;
    }
    if interval < MIN_INTERVAL || interval > MAX_INTERVAL {
        return Some(MIN_INTERVAL);
    }
    Some(interval)
}

pub(crate) async fn run(tunnel: Tunnel, interval: Duration, token: CancellationToken) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut failures: u32 = 0;

    loop {
        tokio::select! {
            () = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if token.is_cancelled() {
            break;
        }

        match tunnel
            .oneway(ENDPOINT, Bytes::new(), None, Some(PING_TIMEOUT))
            .await
        {
            Ok(()) => {
                if failures > 0 {
                    debug!(failures, "heartbeat recovered");
                }
                failures = 0;
            }
            Err(e) => {
                failures += 1;
                warn!(error = %e, failures, "heartbeat failed");
                if failures >= MAX_CONSECUTIVE_FAILURES {
                    warn!("heartbeat exhausted, closing session to force reconnect");
                    failures = 0;
                    if let Some(session) = tunnel.current_session() {
                        session.mux.close();
                    }
                }
            }
        }
    }
}
