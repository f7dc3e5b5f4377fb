use std::sync::Arc;
use std::time::Duration;

use restpipe_proto::{HeartbeatReply, Message, correlation_id_str};
use tracing::{debug, info, warn};

use crate::dispatcher::{ConnectionContext, EventDispatcher};
use crate::error::PipeError;
use crate::exchange::Exchange;
use crate::heartbeat::Liveness;
use crate::stats::{MESSAGE_RECEIVE_TICK, StatsSink};

/// Default poll cadence of the loop's `recv`.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct MessageLoopOptions {
    /// Server mode: an unknown message type ends the loop so the client
    /// reestablishes the connection instead of blocking on a reply that
    /// will never come.
    pub exit_on_unknown: bool,
    pub read_timeout: Duration,
}

impl Default for MessageLoopOptions {
    fn default() -> Self {
        Self { exit_on_unknown: false, read_timeout: DEFAULT_READ_TIMEOUT }
    }
}

/// Drives the exchange on behalf of one connection until it closes.
///
/// Heartbeats are answered inline and stamp `liveness`; events are handed
/// to the dispatcher on a fresh task, which sends the correlated reply
/// itself. The exchange is always closed on the way out.
pub async fn run_message_loop(
    exchange: Arc<Exchange>,
    dispatcher: Arc<EventDispatcher>,
    ctx: ConnectionContext,
    liveness: Arc<Liveness>,
    stats: StatsSink,
    options: MessageLoopOptions,
) {
    debug!("message loop starting: peer={}", exchange.peer_addr());

    loop {
        let (header, message) =
            match exchange.recv(Some(options.read_timeout)).await {
                Ok(frame) => frame,
                Err(PipeError::Timeout) => {
                    if exchange.is_closed() {
                        break;
                    }
                    continue;
                }
                Err(_) => break,
            };

        stats.incr(MESSAGE_RECEIVE_TICK);

        match message {
            Message::Heartbeat(_) => {
                liveness.record();
                debug!(
                    "responding to heartbeat: peer={}, correlation_id={}",
                    exchange.peer_addr(),
                    correlation_id_str(header.correlation_id)
                );

                let reply = Message::HeartbeatReply(HeartbeatReply::new());
                if exchange
                    .send(reply, false, Some(header.correlation_id))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Message::Event(event) => {
                info!(
                    "received event: peer={}, verb={}, noun={}",
                    exchange.peer_addr(),
                    event.verb,
                    event.noun
                );

                let dispatcher = dispatcher.clone();
                let exchange = exchange.clone();
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    dispatcher
                        .dispatch(&exchange, &ctx, header.correlation_id, event)
                        .await;
                });
            }
            other => {
                warn!(
                    "received unhandled message type: peer={}, type={:?}",
                    exchange.peer_addr(),
                    other.message_type()
                );

                if options.exit_on_unknown {
                    warn!(
                        "leaving message loop: peer={}; the client will reestablish the connection",
                        exchange.peer_addr()
                    );
                    break;
                }
            }
        }
    }

    exchange.close().await;
    debug!("message loop finished: peer={}", exchange.peer_addr());
}
