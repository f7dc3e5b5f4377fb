use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use restpipe_core::exchange::Exchange;
use restpipe_core::state_change::StateChangeEvent;
use restpipe_core::PipeError;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const WAIT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const IDLE_NOTIFY_INTERVAL: Duration = Duration::from_secs(60);

/// One live client connection as the catalog sees it.
#[derive(Debug)]
pub struct PeerConnection {
    pub ip: IpAddr,
    pub peer_addr: SocketAddr,
    pub exchange: Arc<Exchange>,
}

/// IP-keyed directory of live client connections.
///
/// At most one entry exists per IP. On a duplicate registration the *new*
/// connection loses: the previous entry may simply not have been detected
/// as dead yet, and evicting it here would tear down the replacement when
/// its cleanup runs. The client's heartbeat and reconnect policy converge
/// on the fresh connection eventually.
pub struct ConnectionCatalog {
    connections: Mutex<HashMap<IpAddr, Arc<PeerConnection>>>,
    state_change: Arc<dyn StateChangeEvent>,
}

impl ConnectionCatalog {
    pub fn new(state_change: Arc<dyn StateChangeEvent>) -> Self {
        Self { connections: Mutex::new(HashMap::new()), state_change }
    }

    pub async fn register(
        &self,
        conn: Arc<PeerConnection>,
    ) -> Result<(), PipeError> {
        let count = {
            let mut connections = self.connections.lock().await;
            if connections.contains_key(&conn.ip) {
                return Err(PipeError::Duplicate(conn.ip));
            }

            debug!("registering client: ip={}", conn.ip);
            connections.insert(conn.ip, conn.clone());
            connections.len()
        };

        self.state_change.client_added(count).await;
        Ok(())
    }

    /// Removes the entry. Deregistering a connection that is not present
    /// is a caller bug and surfaces as an error.
    pub async fn deregister(
        &self,
        conn: &PeerConnection,
    ) -> Result<(), PipeError> {
        let count = {
            let mut connections = self.connections.lock().await;
            if connections.remove(&conn.ip).is_none() {
                return Err(PipeError::NoConnection(conn.ip));
            }

            debug!("deregistering client: ip={}", conn.ip);
            connections.len()
        };

        self.state_change.client_removed(count).await;
        Ok(())
    }

    pub async fn get(&self, ip: IpAddr) -> Option<Arc<PeerConnection>> {
        self.connections.lock().await.get(&ip).cloned()
    }

    pub async fn count(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// Waits for a client from `ip` to be present, polling once a second.
    /// Useful when a request arrives while the client is mid-reconnect.
    pub async fn wait_for(
        &self,
        ip: IpAddr,
        timeout: Duration,
    ) -> Result<Arc<PeerConnection>, PipeError> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if let Some(conn) = self.get(ip).await {
                return Ok(conn);
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(PipeError::NoConnection(ip));
            }

            tokio::time::sleep((deadline - now).min(WAIT_POLL_INTERVAL)).await;
        }
    }

    /// Emits an idleness state-change event every minute while the
    /// catalog is empty.
    pub async fn run_idle_monitor(&self, shutdown: CancellationToken) {
        info!("catalog idle monitor started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("catalog idle monitor stopping");
                    return;
                }
                _ = tokio::time::sleep(IDLE_NOTIFY_INTERVAL) => {}
            }

            if self.connections.lock().await.is_empty() {
                self.state_change.catalog_idle().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::sync::Arc;
    use std::time::Duration;

    use restpipe_core::exchange::Exchange;
    use restpipe_core::socket::split_stream;
    use restpipe_core::state_change::NoopStateChange;
    use restpipe_core::PipeError;

    use super::{ConnectionCatalog, PeerConnection};

    fn test_conn(last_octet: u8) -> Arc<PeerConnection> {
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, last_octet));
        let peer_addr = SocketAddr::new(ip, 40_000 + u16::from(last_octet));

        let (near, _far) = tokio::io::duplex(1024);
        let (reader, writer) = split_stream(near);
        let exchange = Exchange::spawn(reader, writer, peer_addr);

        Arc::new(PeerConnection { ip, peer_addr, exchange })
    }

    fn catalog() -> ConnectionCatalog {
        ConnectionCatalog::new(Arc::new(NoopStateChange))
    }

    #[tokio::test]
    async fn register_get_deregister() {
        let catalog = catalog();
        let conn = test_conn(7);

        catalog.register(conn.clone()).await.expect("register");
        assert_eq!(catalog.count().await, 1);

        let found = catalog.get(conn.ip).await.expect("present");
        assert_eq!(found.peer_addr, conn.peer_addr);

        catalog.deregister(&conn).await.expect("deregister");
        assert!(catalog.get(conn.ip).await.is_none());
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let catalog = catalog();
        let first = test_conn(7);
        let second = test_conn(7);

        catalog.register(first).await.expect("first register");

        match catalog.register(second).await {
            Err(PipeError::Duplicate(ip)) => {
                assert_eq!(ip, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)));
            }
            other => panic!("expected Duplicate, got {other:?}"),
        }

        // The original entry survives.
        assert_eq!(catalog.count().await, 1);
    }

    #[tokio::test]
    async fn double_deregister_is_an_error() {
        let catalog = catalog();
        let conn = test_conn(9);

        catalog.register(conn.clone()).await.expect("register");
        catalog.deregister(&conn).await.expect("first deregister");

        match catalog.deregister(&conn).await {
            Err(PipeError::NoConnection(_)) => {}
            other => panic!("expected NoConnection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn wait_for_expires_without_a_connection() {
        let catalog = catalog();

        let err = catalog
            .wait_for(
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 99)),
                Duration::from_millis(50),
            )
            .await
            .expect_err("must expire");
        assert!(matches!(err, PipeError::NoConnection(_)));
    }

    #[tokio::test]
    async fn wait_for_sees_a_late_registration() {
        let catalog = Arc::new(catalog());
        let conn = test_conn(7);
        let ip = conn.ip;

        let register = {
            let catalog = catalog.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                catalog.register(conn).await.expect("register");
            })
        };

        let found = catalog
            .wait_for(ip, Duration::from_secs(5))
            .await
            .expect("connection appears");
        assert_eq!(found.ip, ip);

        register.await.expect("join");
    }
}
