use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::debug;

pub const CLIENT_CONNECT_NEW_TICK: &str = "client.connect.new.tick";
pub const CLIENT_CONNECT_CONNECTED_TICK: &str = "client.connect.connected.tick";
pub const CLIENT_CONNECT_BROKEN_TICK: &str = "client.connect.broken.tick";
pub const MESSAGE_SEND_TICK: &str = "message.send.tick";
pub const MESSAGE_RECEIVE_TICK: &str = "message.receive.tick";
pub const MESSAGE_RECEIVE_HANDLE_TIMING: &str = "message.receive.handle.timing";

/// Fire-and-forget StatsD sink over UDP datagrams.
///
/// Without a configured address every emission is a no-op; send failures
/// are ignored (metrics must never take a connection down).
#[derive(Clone, Default)]
pub struct StatsSink {
    socket: Option<Arc<UdpSocket>>,
}

impl StatsSink {
    pub fn disabled() -> Self {
        Self { socket: None }
    }

    pub fn connect(addr: &str) -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .context("failed to bind statsd socket")?;
        socket
            .connect(addr)
            .with_context(|| format!("failed to set statsd target {addr}"))?;
        socket
            .set_nonblocking(true)
            .context("failed to make statsd socket non-blocking")?;

        debug!("statsd sink configured: addr={addr}");
        Ok(Self { socket: Some(Arc::new(socket)) })
    }

    pub fn from_optional_addr(addr: Option<&str>) -> Result<Self> {
        match addr {
            Some(addr) => Self::connect(addr),
            None => Ok(Self::disabled()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.socket.is_some()
    }

    pub fn incr(&self, name: &str) {
        if let Some(socket) = &self.socket {
            let _ = socket.send(format!("{name}:1|c").as_bytes());
        }
    }

    pub fn timing(&self, name: &str, elapsed: Duration) {
        if let Some(socket) = &self.socket {
            let datagram = format!("{name}:{}|ms", elapsed.as_millis());
            let _ = socket.send(datagram.as_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::UdpSocket;
    use std::time::Duration;

    use super::StatsSink;

    #[test]
    fn disabled_sink_is_silent() {
        let sink = StatsSink::disabled();
        assert!(!sink.enabled());
        sink.incr("message.receive.tick");
        sink.timing("message.receive.handle.timing", Duration::from_millis(3));
    }

    #[test]
    fn counters_and_timers_reach_the_collector() {
        let collector = UdpSocket::bind("127.0.0.1:0").expect("bind collector");
        let addr = collector.local_addr().expect("collector addr");
        collector
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("read timeout");

        let sink =
            StatsSink::connect(&addr.to_string()).expect("connect sink");
        assert!(sink.enabled());

        sink.incr("client.connect.new.tick");
        let mut buf = [0u8; 256];
        let n = collector.recv(&mut buf).expect("counter datagram");
        assert_eq!(&buf[..n], b"client.connect.new.tick:1|c");

        sink.timing("message.send.timing", Duration::from_millis(42));
        let n = collector.recv(&mut buf).expect("timer datagram");
        assert_eq!(&buf[..n], b"message.send.timing:42|ms");
    }
}
