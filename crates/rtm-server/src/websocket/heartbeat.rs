//! Heartbeat pings and idle-connection detection.

use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use tokio_util::sync::CancellationToken;

use super::connection::ClientConnection;

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// No inbound frame within the idle timeout.
    TimedOut,
    /// The heartbeat was cancelled externally.
    Cancelled,
}

/// Ping the client every `interval` and watch for inbound activity.
///
/// At each tick the alive flag is checked and reset. Any inbound frame (pong,
/// text, binary) sets it again. After `idle_timeout / interval` consecutive
/// silent ticks (at least one) the loop returns
/// [`HeartbeatResult::TimedOut`].
pub async fn run_heartbeat(
    connection: Arc<ClientConnection>,
    interval: Duration,
    idle_timeout: Duration,
    cancel: CancellationToken,
) -> HeartbeatResult {
    let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
    let interval_ms = interval.as_millis().max(1);
    let max_missed = u32::try_from(idle_timeout.as_millis() / interval_ms)
        .unwrap_or(u32::MAX)
        .max(1);
    let mut missed: u32 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if connection.check_alive() {
                    missed = 0;
                } else {
                    missed += 1;
                    if missed >= max_missed {
                        return HeartbeatResult::TimedOut;
                    }
                }
                let _ = connection.ping();
            }
            () = cancel.cancelled() => {
                return HeartbeatResult::Cancelled;
            }
        }
    }
}
