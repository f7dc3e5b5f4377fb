use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};
use restpipe_core::PipeError;
use restpipe_core::dispatcher::{ConnectionContext, EventDispatcher};
use restpipe_core::exchange::Exchange;
use restpipe_core::heartbeat::{Liveness, run_heartbeat_pacemaker};
use restpipe_core::message_loop::{MessageLoopOptions, run_message_loop};
use restpipe_core::socket::split_stream;
use restpipe_core::state_change::StateChangeEvent;
use restpipe_core::stats::{
    CLIENT_CONNECT_BROKEN_TICK, CLIENT_CONNECT_CONNECTED_TICK,
    CLIENT_CONNECT_NEW_TICK, StatsSink,
};
use restpipe_core::tls::client_connector;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ClientConfig;

/// The client's single server connection, shared between the reconnect
/// controller (writer) and the HTTP ingress workers (readers).
#[derive(Clone, Default)]
pub struct ActiveConnection {
    inner: Arc<tokio::sync::RwLock<Option<Arc<Exchange>>>>,
}

impl ActiveConnection {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self) -> Option<Arc<Exchange>> {
        self.inner.read().await.clone()
    }

    pub(crate) async fn set(&self, exchange: Arc<Exchange>) {
        *self.inner.write().await = Some(exchange);
    }

    pub(crate) async fn clear(&self) {
        *self.inner.write().await = None;
    }
}

/// How long to pause before the next attempt: the configured floor minus
/// the time the failed attempt already consumed.
fn reattempt_wait(floor: Duration, attempt_elapsed: Duration) -> Duration {
    floor.saturating_sub(attempt_elapsed)
}

/// The connect → serve → back-off → retry cycle.
///
/// Never gives up on its own; only the shutdown token ends it. The server
/// is passive in reconnects, so this loop is what guarantees eventual
/// convergence after any failure, including a duplicate-IP rejection on
/// the server side.
pub async fn run_reconnect_controller(
    config: Arc<ClientConfig>,
    dispatcher: Arc<EventDispatcher>,
    state_change: Arc<dyn StateChangeEvent>,
    stats: StatsSink,
    active: ActiveConnection,
    shutdown: CancellationToken,
) -> Result<()> {
    let connector = client_connector(&config.tls_material())
        .context("failed to load client TLS material")?;
    let server_name = ServerName::try_from(config.target_hostname.clone())
        .with_context(|| {
            format!("invalid target hostname: {}", config.target_hostname)
        })?;

    let heartbeat_interval =
        Duration::from_secs(config.heartbeat_interval_secs);
    let heartbeat_timeout = Duration::from_secs(config.heartbeat_timeout_secs);
    let min_reattempt_wait =
        Duration::from_secs(config.min_reattempt_wait_secs);
    let options = MessageLoopOptions {
        exit_on_unknown: false,
        read_timeout: Duration::from_secs(config.read_timeout_secs),
    };

    let mut retry_attempts: u32 = 0;
    let mut last_disconnected_at: Option<SystemTime> = None;

    loop {
        if shutdown.is_cancelled() {
            info!("reconnect controller stopping");
            return Ok(());
        }

        stats.incr(CLIENT_CONNECT_NEW_TICK);
        let attempt_start = Instant::now();

        info!(
            "connecting to server: target={}:{}, retry_attempts={}",
            config.target_hostname, config.target_port, retry_attempts
        );

        match open_connection(&connector, &server_name, &config).await {
            Ok(exchange) => {
                stats.incr(CLIENT_CONNECT_CONNECTED_TICK);
                state_change
                    .connect_success(retry_attempts, last_disconnected_at)
                    .await;
                retry_attempts = 0;
                last_disconnected_at = None;

                active.set(exchange.clone()).await;

                let pacemaker = tokio::spawn(run_heartbeat_pacemaker(
                    exchange.clone(),
                    heartbeat_interval,
                    heartbeat_timeout,
                ));

                let ctx = ConnectionContext { peer_addr: exchange.peer_addr() };
                run_message_loop(
                    exchange.clone(),
                    dispatcher.clone(),
                    ctx,
                    Arc::new(Liveness::new()),
                    stats.clone(),
                    options.clone(),
                )
                .await;

                active.clear().await;
                let _ = pacemaker.await;

                warn!(
                    "connection lost: target={}:{}",
                    config.target_hostname, config.target_port
                );
            }
            Err(err) => {
                warn!(
                    "connection attempt failed: target={}:{}, error={}",
                    config.target_hostname, config.target_port, err
                );
            }
        }

        if shutdown.is_cancelled() {
            info!("reconnect controller stopping");
            return Ok(());
        }

        stats.incr(CLIENT_CONNECT_BROKEN_TICK);
        if retry_attempts == 0 {
            last_disconnected_at = Some(SystemTime::now());
        }
        state_change.connect_fail(retry_attempts, last_disconnected_at).await;

        let wait = reattempt_wait(min_reattempt_wait, attempt_start.elapsed());
        if !wait.is_zero() {
            info!(
                "waiting before reconnect: wait={}s, retry_attempts={}",
                wait.as_secs(),
                retry_attempts
            );
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("reconnect controller stopping");
                    return Ok(());
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }

        retry_attempts += 1;
    }
}

/// Dials the server with mutual-TLS material. Socket and handshake
/// failures are retry conditions, not process errors.
async fn open_connection(
    connector: &TlsConnector,
    server_name: &ServerName<'static>,
    config: &ClientConfig,
) -> Result<Arc<Exchange>, PipeError> {
    let addr = format!("{}:{}", config.target_hostname, config.target_port);

    let tcp = TcpStream::connect(&addr)
        .await
        .map_err(|err| PipeError::ConnectionFail(err.to_string()))?;
    let peer_addr = tcp
        .peer_addr()
        .map_err(|err| PipeError::ConnectionFail(err.to_string()))?;
    tcp.set_nodelay(true).ok();

    let tls_stream = connector
        .connect(server_name.clone(), tcp)
        .await
        .map_err(|err| PipeError::ConnectionFail(err.to_string()))?;

    let (reader, writer) = split_stream(tls_stream);
    Ok(Exchange::spawn(reader, writer, peer_addr))
}
