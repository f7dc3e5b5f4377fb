mod app;
mod config;
mod core;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use app::AppState;
use config::ServerConfig;
use restpipe_core::dispatcher::{EventDispatcher, HandlerTable, ReplyCodes};
use restpipe_core::state_change::state_change_from_name;
use restpipe_core::stats::StatsSink;
use restpipe_helpers::{logging, shutdown};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::core::{
    ConnectionCatalog, provider_from_name, resolver_from_name, router,
    run_pipe_listener,
};

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    logging::init_logging(
        "restpipe_server=info,restpipe_core=info",
        "RESTPIPE_LOG",
        "restpipe-server",
    );

    let config = ServerConfig::load().context("failed to load configuration")?;

    let stats = StatsSink::from_optional_addr(config.statsd_addr.as_deref())
        .context("failed to configure statsd sink")?;

    let state_change = state_change_from_name(&config.state_change)
        .with_context(|| {
            format!("unknown state-change sink: {}", config.state_change)
        })?;

    let provider =
        provider_from_name(&config.event_handler).with_context(|| {
            format!("unknown event-handler provider: {}", config.event_handler)
        })?;
    let mut table = HandlerTable::new();
    provider.install(&mut table);
    info!("event handlers installed: selectors={:?}", table.selector_names());

    let dispatcher = Arc::new(EventDispatcher::new(
        table,
        ReplyCodes {
            unhandled_event: config.unhandled_event_code,
            unhandled_exception: config.unhandled_exception_code,
        },
        stats.clone(),
    ));

    let resolver = resolver_from_name(&config.hostname_resolver)
        .with_context(|| {
            format!("unknown hostname resolver: {}", config.hostname_resolver)
        })?;

    let shutdown_token = CancellationToken::new();
    let catalog = Arc::new(ConnectionCatalog::new(state_change));

    let state = AppState {
        catalog: catalog.clone(),
        resolver,
        stats,
        connection_wait_timeout: Duration::from_secs(
            config.connection_wait_timeout_secs,
        ),
        event_timeout: Duration::from_secs(config.event_timeout_secs),
        shutdown: shutdown_token.clone(),
    };

    info!(
        "server starting: pipe={}:{}, http={}",
        config.bind_interface, config.bind_port, config.http_bind
    );

    tokio::spawn(shutdown::listen_shutdown(shutdown_token.clone()));

    {
        let catalog = catalog.clone();
        let shutdown_token = shutdown_token.clone();
        tokio::spawn(async move {
            catalog.run_idle_monitor(shutdown_token).await;
        });
    }

    let http_listener = tokio::net::TcpListener::bind(&config.http_bind)
        .await
        .with_context(|| {
            format!("failed to bind http ingress on {}", config.http_bind)
        })?;
    let http_router = router(state.clone());
    {
        let shutdown_token = shutdown_token.clone();
        tokio::spawn(async move {
            let serving = axum::serve(http_listener, http_router)
                .with_graceful_shutdown(shutdown_token.cancelled_owned())
                .await;
            if let Err(err) = serving {
                error!("http ingress failed: error={err}");
            }
        });
    }

    run_pipe_listener(&config, state, dispatcher).await
}
