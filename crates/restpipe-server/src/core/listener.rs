use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use restpipe_core::dispatcher::{ConnectionContext, EventDispatcher};
use restpipe_core::exchange::Exchange;
use restpipe_core::heartbeat::{Liveness, run_heartbeat_watchdog};
use restpipe_core::message_loop::{MessageLoopOptions, run_message_loop};
use restpipe_core::socket::split_stream;
use restpipe_core::tls::server_acceptor;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

use crate::app::AppState;
use crate::config::ServerConfig;
use crate::core::PeerConnection;

/// Runs the TLS accept loop and serves one pipe per connected client.
///
/// The loop exits only when the shared shutdown token is cancelled.
pub async fn run_pipe_listener(
    config: &ServerConfig,
    state: AppState,
    dispatcher: Arc<EventDispatcher>,
) -> Result<()> {
    let acceptor = server_acceptor(&config.tls_material())
        .context("failed to load server TLS material")?;

    let bind_addr = format!("{}:{}", config.bind_interface, config.bind_port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind pipe listener on {bind_addr}"))?;

    info!("pipe listener active: bind={}", bind_addr);

    let options = MessageLoopOptions {
        exit_on_unknown: true,
        read_timeout: Duration::from_secs(config.read_timeout_secs),
    };
    let heartbeat_interval =
        Duration::from_secs(config.heartbeat_interval_secs);

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                info!("pipe listener stopping");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = accepted.context("tcp accept failed")?;
                let acceptor = acceptor.clone();
                let state = state.clone();
                let dispatcher = dispatcher.clone();
                let options = options.clone();

                tokio::spawn(async move {
                    let served = serve_connection(
                        acceptor,
                        stream,
                        peer,
                        state,
                        dispatcher,
                        options,
                        heartbeat_interval,
                    )
                    .await;

                    if let Err(err) = served {
                        warn!(
                            "client connection failed: peer={}, error={}",
                            peer,
                            err
                        );
                    }
                });
            }
        }
    }

    Ok(())
}

/// Handshakes, registers, and drives one client connection to completion.
async fn serve_connection(
    acceptor: TlsAcceptor,
    stream: TcpStream,
    peer: SocketAddr,
    state: AppState,
    dispatcher: Arc<EventDispatcher>,
    options: MessageLoopOptions,
    heartbeat_interval: Duration,
) -> Result<()> {
    let tls_stream = acceptor
        .accept(stream)
        .await
        .context("tls handshake failed")?;

    let (reader, writer) = split_stream(tls_stream);
    let exchange = Exchange::spawn(reader, writer, peer);
    let conn = Arc::new(PeerConnection {
        ip: peer.ip(),
        peer_addr: peer,
        exchange: exchange.clone(),
    });

    // Duplicate IP: the new connection is the one that loses. See the
    // catalog for the rationale.
    if let Err(err) = state.catalog.register(conn.clone()).await {
        warn!("rejecting connection: peer={}, error={}", peer, err);
        exchange.close().await;
        return Ok(());
    }

    let liveness = Arc::new(Liveness::new());
    let watchdog = tokio::spawn(run_heartbeat_watchdog(
        exchange.clone(),
        liveness.clone(),
        heartbeat_interval,
    ));

    let ctx = ConnectionContext { peer_addr: peer };
    run_message_loop(
        exchange.clone(),
        dispatcher,
        ctx,
        liveness,
        state.stats.clone(),
        options,
    )
    .await;

    if let Err(err) = state.catalog.deregister(&conn).await {
        warn!("deregister failed: peer={}, error={}", peer, err);
    }

    let _ = watchdog.await;
    info!("connection closed: peer={}", peer);
    Ok(())
}
