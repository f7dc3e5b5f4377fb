use std::sync::Arc;
use std::time::Duration;

use restpipe_core::stats::StatsSink;
use tokio_util::sync::CancellationToken;

use crate::core::{ConnectionCatalog, HostnameResolver};

#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<ConnectionCatalog>,
    pub resolver: Arc<dyn HostnameResolver>,
    pub stats: StatsSink,
    pub connection_wait_timeout: Duration,
    pub event_timeout: Duration,
    pub shutdown: CancellationToken,
}
