use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use restpipe_proto::{
    FrameHeader, Message, correlation_id_str, mint_correlation_id,
};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::PipeError;
use crate::socket::{FrameReader, FrameWriter};

const OUTGOING_QUEUE_CAPACITY: usize = 64;
const INBOUND_QUEUE_CAPACITY: usize = 64;

type Frame = (FrameHeader, Message);

struct OutboundFrame {
    header: FrameHeader,
    payload: Vec<u8>,
}

/// Correlation state. A pending entry is removed on exactly one of reply
/// delivery, waiter timeout, or exchange close.
#[derive(Default)]
struct PendingReplies {
    closed: bool,
    slots: HashMap<u32, oneshot::Sender<Frame>>,
    waiters: HashMap<u32, oneshot::Receiver<Frame>>,
}

impl PendingReplies {
    fn contains(&self, correlation_id: u32) -> bool {
        self.slots.contains_key(&correlation_id)
            || self.waiters.contains_key(&correlation_id)
    }
}

/// The per-connection send/receive multiplexer.
///
/// Internally a reader task and a writer task; the reader routes replies
/// to their pending correlation slot and everything else to the inbound
/// queue consumed by [`recv`](Self::recv). Submission order is preserved
/// on the wire because all writes funnel through the single writer task.
///
/// The exchange is terminal: once closed, every public operation fails
/// with [`PipeError::Closed`].
pub struct Exchange {
    peer_addr: SocketAddr,
    outgoing_tx: mpsc::Sender<OutboundFrame>,
    inbound_rx: Mutex<mpsc::Receiver<Frame>>,
    pending: Mutex<PendingReplies>,
    closed: CancellationToken,
}

impl std::fmt::Debug for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange")
            .field("peer_addr", &self.peer_addr)
            .finish_non_exhaustive()
    }
}

impl Exchange {
    /// Starts the reader and writer tasks and returns the shared handle.
    pub fn spawn(
        reader: FrameReader,
        writer: FrameWriter,
        peer_addr: SocketAddr,
    ) -> Arc<Self> {
        let (outgoing_tx, outgoing_rx) = mpsc::channel(OUTGOING_QUEUE_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);

        let exchange = Arc::new(Self {
            peer_addr,
            outgoing_tx,
            inbound_rx: Mutex::new(inbound_rx),
            pending: Mutex::new(PendingReplies::default()),
            closed: CancellationToken::new(),
        });

        debug!("message exchange running: peer={}", peer_addr);
        tokio::spawn(run_reader(exchange.clone(), reader, inbound_tx));
        tokio::spawn(run_writer(exchange.clone(), writer, outgoing_rx));

        exchange
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Token observed by companion tasks (pacemaker, watchdog) to learn
    /// when the exchange has been torn down.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Enqueues a frame for transmission and returns its correlation ID.
    ///
    /// A reply reuses the original frame's ID via `reply_to` and carries
    /// the reply flag; otherwise a fresh ID is minted, unique among the
    /// currently pending ones. When `expect_reply` is set the pending slot
    /// is allocated before the frame is enqueued, so the reply cannot race
    /// ahead of its waiter.
    pub async fn send(
        &self,
        message: Message,
        expect_reply: bool,
        reply_to: Option<u32>,
    ) -> Result<u32, PipeError> {
        let payload = message.encode_payload();
        let payload_len = u32::try_from(payload.len())
            .map_err(|_| PipeError::Malformed("payload too large".to_string()))?;

        let correlation_id =
            self.allocate_correlation_id(expect_reply, reply_to).await?;

        let header = FrameHeader::new(
            message.message_type(),
            payload_len,
            correlation_id,
            reply_to.is_some(),
        );

        if self
            .outgoing_tx
            .send(OutboundFrame { header, payload })
            .await
            .is_err()
        {
            self.discard_pending(correlation_id).await;
            return Err(PipeError::Closed);
        }

        Ok(correlation_id)
    }

    /// Returns the next non-reply message, in arrival order. `timeout`
    /// bounds the wait; `None` blocks until a message arrives or the
    /// exchange closes.
    pub async fn recv(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Frame, PipeError> {
        let mut inbound_rx = self.inbound_rx.lock().await;

        let received = match timeout {
            Some(window) => {
                match tokio::time::timeout(window, inbound_rx.recv()).await {
                    Ok(received) => received,
                    Err(_) => return Err(PipeError::Timeout),
                }
            }
            None => inbound_rx.recv().await,
        };

        received.ok_or(PipeError::Closed)
    }

    /// Blocks until the reply for `correlation_id` arrives, the timeout
    /// elapses, or the exchange closes.
    pub async fn await_reply(
        &self,
        correlation_id: u32,
        timeout: Duration,
    ) -> Result<Frame, PipeError> {
        let waiter = {
            let mut pending = self.pending.lock().await;
            pending.waiters.remove(&correlation_id)
        };
        let Some(waiter) = waiter else {
            return Err(PipeError::Closed);
        };

        match tokio::time::timeout(timeout, waiter).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(PipeError::Closed),
            Err(_) => {
                self.discard_pending(correlation_id).await;
                debug!(
                    "reply wait timed out: peer={}, correlation_id={}",
                    self.peer_addr,
                    correlation_id_str(correlation_id)
                );
                Err(PipeError::Timeout)
            }
        }
    }

    /// Sends a message and waits for its correlated reply.
    pub async fn send_and_await(
        &self,
        message: Message,
        timeout: Duration,
    ) -> Result<Message, PipeError> {
        let correlation_id = self.send(message, true, None).await?;
        let (_, reply) = self.await_reply(correlation_id, timeout).await?;
        Ok(reply)
    }

    /// Tears the exchange down: stops the reader and writer, discards the
    /// outbound queue, and wakes every pending waiter with `Closed`.
    /// Idempotent.
    pub async fn close(&self) {
        self.closed.cancel();

        let mut pending = self.pending.lock().await;
        if !pending.closed {
            debug!("message exchange terminating: peer={}", self.peer_addr);
        }
        pending.closed = true;
        pending.slots.clear();
        pending.waiters.clear();
    }

    /// Picks the frame's correlation ID, registering a pending slot first
    /// when a reply is expected. Allocation and the closed check share the
    /// pending lock so no slot can be created after `close` has swept.
    async fn allocate_correlation_id(
        &self,
        expect_reply: bool,
        reply_to: Option<u32>,
    ) -> Result<u32, PipeError> {
        let mut pending = self.pending.lock().await;
        if pending.closed || self.closed.is_cancelled() {
            return Err(PipeError::Closed);
        }

        let correlation_id = match reply_to {
            Some(correlation_id) => correlation_id,
            None => {
                let mut correlation_id = mint_correlation_id();
                while expect_reply && pending.contains(correlation_id) {
                    correlation_id = mint_correlation_id();
                }
                correlation_id
            }
        };

        if expect_reply {
            let (slot_tx, waiter_rx) = oneshot::channel();
            pending.slots.insert(correlation_id, slot_tx);
            pending.waiters.insert(correlation_id, waiter_rx);
        }

        Ok(correlation_id)
    }

    async fn discard_pending(&self, correlation_id: u32) {
        let mut pending = self.pending.lock().await;
        pending.slots.remove(&correlation_id);
        pending.waiters.remove(&correlation_id);
    }

    /// Hands a reply to its pending waiter. An unmatched reply (e.g. one
    /// whose waiter already timed out) is given back to the caller so it
    /// reaches the message loop as an ordinary inbound frame.
    async fn try_deliver_reply(&self, frame: Frame) -> Option<Frame> {
        let correlation_id = frame.0.correlation_id;
        let slot = {
            let mut pending = self.pending.lock().await;
            pending.slots.remove(&correlation_id)
        };

        match slot {
            Some(slot_tx) => {
                let _ = slot_tx.send(frame);
                None
            }
            None => {
                debug!(
                    "reply did not match a pending waiter: peer={}, correlation_id={}",
                    self.peer_addr,
                    correlation_id_str(correlation_id)
                );
                Some(frame)
            }
        }
    }
}

async fn run_reader(
    exchange: Arc<Exchange>,
    mut reader: FrameReader,
    inbound_tx: mpsc::Sender<Frame>,
) {
    loop {
        let frame = tokio::select! {
            _ = exchange.closed.cancelled() => break,
            frame = reader.read_frame() => frame,
        };

        match frame {
            Ok((header, message)) => {
                let unmatched = if header.is_reply() {
                    exchange.try_deliver_reply((header, message)).await
                } else {
                    Some((header, message))
                };

                if let Some(frame) = unmatched {
                    let delivered = tokio::select! {
                        _ = exchange.closed.cancelled() => false,
                        sent = inbound_tx.send(frame) => sent.is_ok(),
                    };
                    if !delivered {
                        break;
                    }
                }
            }
            Err(PipeError::Malformed(detail)) => {
                warn!(
                    "malformed frame, closing stream: peer={}, error={}",
                    exchange.peer_addr, detail
                );
                break;
            }
            Err(err) => {
                debug!(
                    "reader stopping: peer={}, error={}",
                    exchange.peer_addr, err
                );
                break;
            }
        }
    }

    exchange.close().await;
}

async fn run_writer(
    exchange: Arc<Exchange>,
    mut writer: FrameWriter,
    mut outgoing_rx: mpsc::Receiver<OutboundFrame>,
) {
    loop {
        let outbound = tokio::select! {
            _ = exchange.closed.cancelled() => break,
            maybe_frame = outgoing_rx.recv() => match maybe_frame {
                Some(outbound) => outbound,
                None => break,
            },
        };

        if let Err(err) =
            writer.write_frame(&outbound.header, &outbound.payload).await
        {
            debug!(
                "writer stopping: peer={}, error={}",
                exchange.peer_addr, err
            );
            break;
        }

        debug!(
            "frame sent: peer={}, correlation_id={}",
            exchange.peer_addr,
            correlation_id_str(outbound.header.correlation_id)
        );
    }

    exchange.close().await;
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::sync::Arc;
    use std::time::Duration;

    use restpipe_proto::{Event, EventReply, Message, PROTOCOL_VERSION};
    use tokio::time::timeout;

    use super::Exchange;
    use crate::error::PipeError;
    use crate::socket::split_stream;

    fn test_addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)), port)
    }

    fn pair() -> (Arc<Exchange>, Arc<Exchange>) {
        let (near, far) = tokio::io::duplex(64 * 1024);
        let (near_reader, near_writer) = split_stream(near);
        let (far_reader, far_writer) = split_stream(far);

        let near = Exchange::spawn(near_reader, near_writer, test_addr(1));
        let far = Exchange::spawn(far_reader, far_writer, test_addr(2));
        (near, far)
    }

    fn event(noun: &str) -> Message {
        Message::Event(Event {
            version: PROTOCOL_VERSION,
            verb: "GET".to_string(),
            noun: noun.to_string(),
            mimetype: String::new(),
            data: Vec::new(),
        })
    }

    /// Echo peer: answers every inbound event with a reply whose data is
    /// the event's noun.
    fn spawn_echo(exchange: Arc<Exchange>) {
        tokio::spawn(async move {
            while let Ok((header, message)) = exchange.recv(None).await {
                let Message::Event(event) = message else {
                    continue;
                };
                let reply = Message::EventReply(EventReply {
                    version: PROTOCOL_VERSION,
                    code: 0,
                    mimetype: String::new(),
                    data: event.noun.into_bytes(),
                });
                if exchange
                    .send(reply, false, Some(header.correlation_id))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });
    }

    #[tokio::test]
    async fn concurrent_waiters_each_get_their_own_reply() {
        let (near, far) = pair();
        spawn_echo(far);

        let mut tasks = Vec::new();
        for index in 0..16 {
            let near = near.clone();
            tasks.push(tokio::spawn(async move {
                let noun = format!("noun/{index}");
                let reply = near
                    .send_and_await(event(&noun), Duration::from_secs(5))
                    .await
                    .expect("reply");
                (noun, reply)
            }));
        }

        for task in tasks {
            let (noun, reply) = task.await.expect("task join");
            match reply {
                Message::EventReply(reply) => {
                    assert_eq!(reply.data, noun.into_bytes());
                }
                other => panic!("unexpected reply: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn non_reply_messages_arrive_in_submission_order() {
        let (near, far) = pair();

        for index in 0..5 {
            near.send(event(&format!("noun/{index}")), false, None)
                .await
                .expect("send");
        }

        for index in 0..5 {
            let (_, message) = far
                .recv(Some(Duration::from_secs(5)))
                .await
                .expect("recv");
            match message {
                Message::Event(event) => {
                    assert_eq!(event.noun, format!("noun/{index}"));
                }
                other => panic!("unexpected message: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn await_reply_times_out_without_a_reply() {
        let (near, _far) = pair();

        let err = near
            .send_and_await(event("never"), Duration::from_millis(50))
            .await
            .expect_err("must time out");
        assert!(matches!(err, PipeError::Timeout));

        // The connection stays usable after a timeout.
        assert!(!near.is_closed());
    }

    #[tokio::test]
    async fn close_wakes_pending_waiters_with_closed() {
        let (near, _far) = pair();

        let waiter = {
            let near = near.clone();
            tokio::spawn(async move {
                near.send_and_await(event("blocked"), Duration::from_secs(30))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        near.close().await;

        let result = timeout(Duration::from_secs(2), waiter)
            .await
            .expect("waiter finishes")
            .expect("join");
        assert!(matches!(result, Err(PipeError::Closed)));
    }

    #[tokio::test]
    async fn peer_eof_closes_the_exchange() {
        let (near, far) = pair();
        far.close().await;

        let err = near
            .recv(Some(Duration::from_secs(5)))
            .await
            .expect_err("recv must fail");
        assert!(matches!(err, PipeError::Closed | PipeError::Timeout));

        // The reader observes EOF shortly after the peer goes away.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(near.is_closed());
    }

    #[tokio::test]
    async fn operations_after_close_fail_with_closed() {
        let (near, _far) = pair();
        near.close().await;

        // Give the reader task a beat to observe the cancellation and
        // drop its inbound sender.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = near
            .send(event("late"), false, None)
            .await
            .expect_err("send must fail");
        assert!(matches!(err, PipeError::Closed));

        let err = near
            .recv(Some(Duration::from_millis(50)))
            .await
            .expect_err("recv must fail");
        assert!(matches!(err, PipeError::Closed));

        let err = near
            .await_reply(1_234_567_890, Duration::from_millis(50))
            .await
            .expect_err("await_reply must fail");
        assert!(matches!(err, PipeError::Closed));
    }
}
