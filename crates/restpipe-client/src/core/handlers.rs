use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use restpipe_core::dispatcher::{
    ConnectionContext, EventHandler, HandlerError, HandlerProvider,
    HandlerReply, HandlerRequest, HandlerTable,
};
use serde_json::json;

/// `GET time` → `{"t": <unix seconds>}`.
struct GetTime;

#[async_trait]
impl EventHandler for GetTime {
    async fn call(
        &self,
        _ctx: &ConnectionContext,
        _request: HandlerRequest,
        _args: &[String],
    ) -> Result<HandlerReply, HandlerError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs_f64())
            .unwrap_or(0.0);
        Ok(HandlerReply::json(json!({ "t": now })))
    }
}

/// The stock handler set installed when no application-specific provider
/// is configured.
pub struct DefaultClientHandlers;

impl HandlerProvider for DefaultClientHandlers {
    fn install(&self, table: &mut HandlerTable) {
        table.register("GET", "time", Arc::new(GetTime));
    }
}

/// Registry lookup for the configured handler-provider name.
pub fn provider_from_name(name: &str) -> Option<Box<dyn HandlerProvider>> {
    match name {
        "default" => Some(Box::new(DefaultClientHandlers)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use restpipe_core::dispatcher::HandlerTable;

    use super::provider_from_name;

    #[test]
    fn default_provider_installs_get_time() {
        let provider = provider_from_name("default").expect("provider");

        let mut table = HandlerTable::new();
        provider.install(&mut table);
        assert_eq!(table.selector_names(), vec!["get_time"]);
    }
}
