mod config;
mod core;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use config::ClientConfig;
use restpipe_core::dispatcher::{EventDispatcher, HandlerTable, ReplyCodes};
use restpipe_core::state_change::state_change_from_name;
use restpipe_core::stats::StatsSink;
use restpipe_helpers::{logging, shutdown};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::core::{
    ActiveConnection, HttpState, provider_from_name, router,
    run_reconnect_controller,
};

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    logging::init_logging(
        "restpipe_client=info,restpipe_core=info",
        "RESTPIPE_LOG",
        "restpipe-client",
    );

    let config = Arc::new(
        ClientConfig::load().context("failed to load configuration")?,
    );

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

    let shutdown_token = CancellationToken::new();
    let active = ActiveConnection::new();

    info!(
        "client starting: target={}:{}, http={}",
        config.target_hostname, config.target_port, config.http_bind
    );

    tokio::spawn(shutdown::listen_shutdown(shutdown_token.clone()));

    let http_listener = tokio::net::TcpListener::bind(&config.http_bind)
        .await
        .with_context(|| {
            format!("failed to bind http ingress on {}", config.http_bind)
        })?;
    let http_router = router(HttpState {
        active: active.clone(),
        stats: stats.clone(),
        event_timeout: Duration::from_secs(config.event_timeout_secs),
    });
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

    run_reconnect_controller(
        config,
        dispatcher,
        state_change,
        stats,
        active,
        shutdown_token,
    )
    .await
}
