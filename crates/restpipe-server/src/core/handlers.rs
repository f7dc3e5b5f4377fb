use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use restpipe_core::dispatcher::{
    ConnectionContext, EventHandler, HandlerError, HandlerProvider,
    HandlerReply, HandlerRequest, HandlerTable,
};
use serde_json::json;

/// `GET cat//a/b` → `{"r": "ab"}`. Exists to exercise parameterized
/// routes end to end.
struct GetCat;

#[async_trait]
impl EventHandler for GetCat {
    async fn call(
        &self,
        _ctx: &ConnectionContext,
        _request: HandlerRequest,
        args: &[String],
    ) -> Result<HandlerReply, HandlerError> {
        Ok(HandlerReply::json(json!({ "r": args.concat() })))
    }
}

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
pub struct DefaultServerHandlers;

impl HandlerProvider for DefaultServerHandlers {
    fn install(&self, table: &mut HandlerTable) {
        table.register("GET", "cat", Arc::new(GetCat));
        table.register("GET", "time", Arc::new(GetTime));
    }
}

/// Registry lookup for the configured handler-provider name.
pub fn provider_from_name(name: &str) -> Option<Box<dyn HandlerProvider>> {
    match name {
        "default" => Some(Box::new(DefaultServerHandlers)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use restpipe_core::dispatcher::HandlerTable;

    use super::provider_from_name;

    #[test]
    fn default_provider_installs_the_demo_handlers() {
        let provider = provider_from_name("default").expect("provider");

        let mut table = HandlerTable::new();
        provider.install(&mut table);
        assert_eq!(table.selector_names(), vec!["get_cat", "get_time"]);
    }

    #[test]
    fn unknown_provider_is_rejected() {
        assert!(provider_from_name("acme").is_none());
    }
}
