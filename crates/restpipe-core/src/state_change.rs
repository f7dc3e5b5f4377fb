use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use tracing::info;

/// Sink for connection-lifecycle notifications.
///
/// The client controller reports connect successes and failures; the
/// server catalog reports membership changes and idleness. Implementations
/// are wired at process construction and selected by name from
/// [`state_change_from_name`].
#[async_trait]
pub trait StateChangeEvent: Send + Sync {
    async fn connect_success(
        &self,
        _retry_attempts: u32,
        _last_disconnected_at: Option<SystemTime>,
    ) {
    }

    async fn connect_fail(
        &self,
        _retry_attempts: u32,
        _last_disconnected_at: Option<SystemTime>,
    ) {
    }

    async fn client_added(&self, _count: usize) {}

    async fn client_removed(&self, _count: usize) {}

    async fn catalog_idle(&self) {}
}

/// Default sink: one log line per transition.
pub struct LogStateChange;

#[async_trait]
impl StateChangeEvent for LogStateChange {
    async fn connect_success(
        &self,
        retry_attempts: u32,
        last_disconnected_at: Option<SystemTime>,
    ) {
        info!(
            "connection established: retry_attempts={}, last_disconnected_at={:?}",
            retry_attempts, last_disconnected_at
        );
    }

    async fn connect_fail(
        &self,
        retry_attempts: u32,
        last_disconnected_at: Option<SystemTime>,
    ) {
        info!(
            "connection broken: retry_attempts={}, last_disconnected_at={:?}",
            retry_attempts, last_disconnected_at
        );
    }

    async fn client_added(&self, count: usize) {
        info!("client connected: connection_count={}", count);
    }

    async fn client_removed(&self, count: usize) {
        info!("client disconnected: connection_count={}", count);
    }

    async fn catalog_idle(&self) {
        info!("no client connections");
    }
}

pub struct NoopStateChange;

#[async_trait]
impl StateChangeEvent for NoopStateChange {}

/// Registry lookup for the configured sink name.
pub fn state_change_from_name(
    name: &str,
) -> Option<Arc<dyn StateChangeEvent>> {
    match name {
        "log" => Some(Arc::new(LogStateChange)),
        "noop" => Some(Arc::new(NoopStateChange)),
        _ => None,
    }
}
