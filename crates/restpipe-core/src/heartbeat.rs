use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use restpipe_proto::{Heartbeat, Message};
use tracing::{debug, warn};

use crate::error::PipeError;
use crate::exchange::Exchange;

/// Shared record of the most recent heartbeat received on a connection.
///
/// Stored as milliseconds since construction (offset by one so zero can
/// mean "never"), which keeps `record` lock-free for the message loop.
pub struct Liveness {
    started: Instant,
    last_beat_ms: AtomicU64,
}

impl Liveness {
    pub fn new() -> Self {
        Self { started: Instant::now(), last_beat_ms: AtomicU64::new(0) }
    }

    pub fn record(&self) {
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        self.last_beat_ms.store(elapsed_ms + 1, Ordering::Relaxed);
    }

    /// Time since the last recorded heartbeat, or `None` if none was ever
    /// recorded.
    pub fn since_last(&self) -> Option<Duration> {
        let stamp = self.last_beat_ms.load(Ordering::Relaxed);
        if stamp == 0 {
            return None;
        }

        let now_ms = self.started.elapsed().as_millis() as u64;
        Some(Duration::from_millis(now_ms.saturating_sub(stamp - 1)))
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

/// Client-side heartbeat originator.
///
/// Each beat is scheduled `interval` after the previous successful reply
/// and waits at most `timeout` for its reply. Any failure tears the whole
/// connection down; reconnecting is the controller's job.
pub async fn run_heartbeat_pacemaker(
    exchange: Arc<Exchange>,
    interval: Duration,
    timeout: Duration,
) -> Result<(), PipeError> {
    debug!(
        "heartbeat pacemaker starting: peer={}, interval={}s",
        exchange.peer_addr(),
        interval.as_secs()
    );

    loop {
        let closed_token = exchange.closed_token();
        tokio::select! {
            _ = closed_token.cancelled() => return Err(PipeError::Closed),
            _ = tokio::time::sleep(interval) => {}
        }

        match exchange
            .send_and_await(Message::Heartbeat(Heartbeat::new()), timeout)
            .await
        {
            Ok(Message::HeartbeatReply(_)) => {
                debug!("heartbeat reply received: peer={}", exchange.peer_addr());
            }
            Ok(other) => {
                warn!(
                    "unexpected heartbeat reply kind, closing connection: peer={}, type={:?}",
                    exchange.peer_addr(),
                    other.message_type()
                );
                exchange.close().await;
                return Err(PipeError::Malformed(
                    "unexpected heartbeat reply kind".to_string(),
                ));
            }
            Err(err) => {
                warn!(
                    "heartbeat failed, closing connection: peer={}, error={}",
                    exchange.peer_addr(),
                    err
                );
                exchange.close().await;
                return Err(err);
            }
        }
    }
}

/// Server-side liveness enforcer.
///
/// Wakes every `2 × heartbeat_interval`; a connection that has never
/// produced a heartbeat, or whose last heartbeat is older than the
/// threshold, is force-closed.
pub async fn run_heartbeat_watchdog(
    exchange: Arc<Exchange>,
    liveness: Arc<Liveness>,
    heartbeat_interval: Duration,
) {
    let alarm_threshold = heartbeat_interval * 2;
    debug!(
        "heartbeat watchdog starting: peer={}, alarm_threshold={}s",
        exchange.peer_addr(),
        alarm_threshold.as_secs()
    );

    loop {
        let closed_token = exchange.closed_token();
        tokio::select! {
            _ = closed_token.cancelled() => return,
            _ = tokio::time::sleep(alarm_threshold) => {}
        }

        match liveness.since_last() {
            None => {
                warn!(
                    "heartbeat miss: no heartbeats have occurred yet, terminating connection: peer={}",
                    exchange.peer_addr()
                );
                exchange.close().await;
                return;
            }
            Some(since_last) if since_last > alarm_threshold => {
                warn!(
                    "heartbeat miss: terminating connection: peer={}, since_last={}s, threshold={}s",
                    exchange.peer_addr(),
                    since_last.as_secs(),
                    alarm_threshold.as_secs()
                );
                exchange.close().await;
                return;
            }
            Some(since_last) => {
                debug!(
                    "heartbeats are still timely: peer={}, since_last={}s, threshold={}s",
                    exchange.peer_addr(),
                    since_last.as_secs(),
                    alarm_threshold.as_secs()
                );
            }
        }
    }
}
