use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use restpipe_proto::{
    Event, EventReply, Message, PROTOCOL_VERSION, correlation_id_str,
};
use thiserror::Error;
use tracing::{debug, warn};

use crate::exchange::Exchange;
use crate::stats::{MESSAGE_RECEIVE_HANDLE_TIMING, StatsSink};

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_TEXT: &str = "text/plain";

/// Per-connection context passed to event handlers.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pub peer_addr: SocketAddr,
}

/// An inbound event body, decoded according to its mimetype.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Empty,
    Raw(Vec<u8>),
    Json(serde_json::Value),
}

#[derive(Debug, Clone)]
pub struct HandlerRequest {
    pub mimetype: String,
    pub body: RequestBody,
}

/// What a handler hands back. The mimetype defaults to
/// `application/json`; the code defaults to zero (success).
#[derive(Debug, Clone)]
pub struct HandlerReply {
    pub mimetype: Option<String>,
    pub code: i32,
    pub payload: ReplyPayload,
}

#[derive(Debug, Clone)]
pub enum ReplyPayload {
    Empty,
    Raw(Vec<u8>),
    Text(String),
    Json(serde_json::Value),
}

impl HandlerReply {
    pub fn empty() -> Self {
        Self { mimetype: None, code: 0, payload: ReplyPayload::Empty }
    }

    pub fn json(value: serde_json::Value) -> Self {
        Self { mimetype: None, code: 0, payload: ReplyPayload::Json(value) }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            mimetype: Some(CONTENT_TYPE_TEXT.to_string()),
            code: 0,
            payload: ReplyPayload::Text(text.into()),
        }
    }

    pub fn raw(mimetype: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            mimetype: Some(mimetype.into()),
            code: 0,
            payload: ReplyPayload::Raw(data),
        }
    }

    pub fn with_code(mut self, code: i32) -> Self {
        self.code = code;
        self
    }
}

#[derive(Debug, Error)]
pub enum HandlerError {
    /// A declared domain error; the reply carries the handler-chosen code.
    #[error("{message}")]
    Failure { code: i32, message: String },
    /// Anything else; the reply carries the unhandled-exception code and a
    /// JSON description of what went wrong.
    #[error("{class}: {message}")]
    Unexpected { class: String, message: String, trace: String },
}

impl HandlerError {
    pub fn failure(code: i32, message: impl Into<String>) -> Self {
        Self::Failure { code, message: message.into() }
    }

    pub fn unexpected(
        class: impl Into<String>,
        message: impl Into<String>,
        trace: impl Into<String>,
    ) -> Self {
        Self::Unexpected {
            class: class.into(),
            message: message.into(),
            trace: trace.into(),
        }
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::Unexpected {
            class: "Error".to_string(),
            message: err.to_string(),
            trace: format!("{err:?}"),
        }
    }
}

/// A single registered event handler.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn call(
        &self,
        ctx: &ConnectionContext,
        request: HandlerRequest,
        args: &[String],
    ) -> Result<HandlerReply, HandlerError>;
}

/// Explicit handler lookup table keyed on `(verb_lowercase, name)`,
/// populated at start-up. Replaces attribute-style handler discovery and
/// makes the handler surface enumerable.
#[derive(Default)]
pub struct HandlerTable {
    entries: HashMap<(String, String), Arc<dyn EventHandler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        verb: &str,
        name: &str,
        handler: Arc<dyn EventHandler>,
    ) {
        self.entries
            .insert((verb.to_lowercase(), name.to_string()), handler);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Selector names in `verb_name` form, sorted, for logs and tests.
    pub fn selector_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .keys()
            .map(|(verb, name)| format!("{verb}_{name}"))
            .collect();
        names.sort();
        names
    }

    fn get(&self, verb_lower: &str, name: &str) -> Option<&Arc<dyn EventHandler>> {
        self.entries
            .get(&(verb_lower.to_string(), name.to_string()))
    }
}

/// Installs handlers into the table at process construction. Selected by
/// name from a registry; this replaces configuring fully-qualified class
/// names.
pub trait HandlerProvider: Send + Sync {
    fn install(&self, table: &mut HandlerTable);
}

/// Derives the handler name and positional arguments from a noun.
///
/// The noun splits on `//`: the left part, with `/` replaced by `_`, is
/// the name; the right part, if any, splits on `/` into arguments.
/// `cat//3/4` names `cat` with arguments `["3", "4"]`.
pub fn parse_selector(noun: &str) -> (String, Vec<String>) {
    let mut parts = noun.split("//");
    let name = parts.next().unwrap_or_default().replace('/', "_");
    let args = parts
        .next()
        .map(|raw| raw.split('/').map(str::to_string).collect())
        .unwrap_or_default();
    (name, args)
}

/// Reserved reply codes, configurable through the environment.
#[derive(Debug, Clone, Copy)]
pub struct ReplyCodes {
    pub unhandled_event: i32,
    pub unhandled_exception: i32,
}

impl Default for ReplyCodes {
    fn default() -> Self {
        Self { unhandled_event: -1, unhandled_exception: -2 }
    }
}

/// Maps inbound events to handlers and encodes their replies.
pub struct EventDispatcher {
    table: HandlerTable,
    codes: ReplyCodes,
    stats: StatsSink,
}

impl EventDispatcher {
    pub fn new(table: HandlerTable, codes: ReplyCodes, stats: StatsSink) -> Self {
        Self { table, codes, stats }
    }

    pub fn codes(&self) -> ReplyCodes {
        self.codes
    }

    /// Processes one event and sends the correlated EVENT_REPLY.
    pub async fn dispatch(
        &self,
        exchange: &Exchange,
        ctx: &ConnectionContext,
        correlation_id: u32,
        event: Event,
    ) {
        let started = Instant::now();
        let reply = self.process(ctx, &event).await;
        self.stats.timing(MESSAGE_RECEIVE_HANDLE_TIMING, started.elapsed());

        debug!(
            "responding to event: peer={}, correlation_id={}, code={}",
            ctx.peer_addr,
            correlation_id_str(correlation_id),
            reply.code
        );

        if let Err(err) = exchange
            .send(Message::EventReply(reply), false, Some(correlation_id))
            .await
        {
            warn!(
                "failed to send event reply: peer={}, correlation_id={}, error={}",
                ctx.peer_addr,
                correlation_id_str(correlation_id),
                err
            );
        }
    }

    /// Resolves the handler and produces the reply without touching the
    /// exchange.
    pub async fn process(
        &self,
        ctx: &ConnectionContext,
        event: &Event,
    ) -> EventReply {
        let (name, args) = parse_selector(&event.noun);
        let verb_lower = event.verb.to_lowercase();

        let Some(handler) = self.table.get(&verb_lower, &name) else {
            warn!("event is not handled: selector={verb_lower}_{name}");
            return EventReply {
                version: PROTOCOL_VERSION,
                code: self.codes.unhandled_event,
                mimetype: CONTENT_TYPE_TEXT.to_string(),
                data: Vec::new(),
            };
        };

        let request = match build_request(event) {
            Ok(request) => request,
            Err(err) => return self.exception_reply(&err),
        };

        match handler.call(ctx, request, &args).await {
            Ok(reply) => match encode_reply(reply) {
                Ok(reply) => reply,
                Err(err) => self.exception_reply(&err),
            },
            Err(HandlerError::Failure { code, message }) => EventReply {
                version: PROTOCOL_VERSION,
                code,
                mimetype: CONTENT_TYPE_TEXT.to_string(),
                data: message.into_bytes(),
            },
            Err(err) => self.exception_reply(&err),
        }
    }

    fn exception_reply(&self, err: &HandlerError) -> EventReply {
        let (class, message, trace) = match err {
            HandlerError::Unexpected { class, message, trace } => {
                (class.as_str(), message.as_str(), trace.as_str())
            }
            HandlerError::Failure { message, .. } => {
                ("Error", message.as_str(), message.as_str())
            }
        };

        warn!("unhandled error during event: class={class}, message={message}");

        let body = serde_json::json!({
            "exception": {
                "message": message,
                "traceback": trace,
                "class": class,
            }
        });

        EventReply {
            version: PROTOCOL_VERSION,
            code: self.codes.unhandled_exception,
            mimetype: CONTENT_TYPE_JSON.to_string(),
            data: serde_json::to_vec(&body).unwrap_or_default(),
        }
    }
}

fn build_request(event: &Event) -> Result<HandlerRequest, HandlerError> {
    let body = if event.data.is_empty() {
        RequestBody::Empty
    } else if event.mimetype == CONTENT_TYPE_JSON {
        let value = serde_json::from_slice(&event.data).map_err(|err| {
            HandlerError::unexpected(
                "JsonDecodeError",
                err.to_string(),
                format!("failed to decode {CONTENT_TYPE_JSON} request body: {err}"),
            )
        })?;
        RequestBody::Json(value)
    } else {
        RequestBody::Raw(event.data.clone())
    };

    Ok(HandlerRequest { mimetype: event.mimetype.clone(), body })
}

fn encode_reply(reply: HandlerReply) -> Result<EventReply, HandlerError> {
    let mimetype =
        reply.mimetype.unwrap_or_else(|| CONTENT_TYPE_JSON.to_string());

    let data = match reply.payload {
        ReplyPayload::Empty => Vec::new(),
        ReplyPayload::Raw(bytes) => bytes,
        ReplyPayload::Text(text) => text.into_bytes(),
        ReplyPayload::Json(value) => {
            if mimetype != CONTENT_TYPE_JSON {
                return Err(HandlerError::unexpected(
                    "ValueError",
                    format!("structured reply cannot be encoded as {mimetype}"),
                    format!(
                        "structured replies require {CONTENT_TYPE_JSON}, got {mimetype}"
                    ),
                ));
            }
            serde_json::to_vec(&value).map_err(|err| {
                HandlerError::unexpected(
                    "JsonEncodeError",
                    err.to_string(),
                    format!("failed to encode reply body: {err}"),
                )
            })?
        }
    };

    Ok(EventReply { version: PROTOCOL_VERSION, code: reply.code, mimetype, data })
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::sync::Arc;

    use async_trait::async_trait;
    use restpipe_proto::{Event, PROTOCOL_VERSION};
    use serde_json::json;

    use super::{
        CONTENT_TYPE_JSON, ConnectionContext, EventDispatcher, EventHandler,
        HandlerError, HandlerReply, HandlerRequest, HandlerTable, ReplyCodes,
        RequestBody, parse_selector,
    };
    use crate::stats::StatsSink;

    fn ctx() -> ConnectionContext {
        ConnectionContext {
            peer_addr: SocketAddr::new(
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)),
                4321,
            ),
        }
    }

    fn event(verb: &str, noun: &str, mimetype: &str, data: &[u8]) -> Event {
        Event {
            version: PROTOCOL_VERSION,
            verb: verb.to_string(),
            noun: noun.to_string(),
            mimetype: mimetype.to_string(),
            data: data.to_vec(),
        }
    }

    struct ConcatArgs;

    #[async_trait]
    impl EventHandler for ConcatArgs {
        async fn call(
            &self,
            _ctx: &ConnectionContext,
            _request: HandlerRequest,
            args: &[String],
        ) -> Result<HandlerReply, HandlerError> {
            Ok(HandlerReply::json(json!({ "r": args.concat() })))
        }
    }

    struct EchoJsonBody;

    #[async_trait]
    impl EventHandler for EchoJsonBody {
        async fn call(
            &self,
            _ctx: &ConnectionContext,
            request: HandlerRequest,
            _args: &[String],
        ) -> Result<HandlerReply, HandlerError> {
            match request.body {
                RequestBody::Json(value) => Ok(HandlerReply::json(value)),
                other => Err(HandlerError::unexpected(
                    "BodyError",
                    format!("expected a JSON body, got {other:?}"),
                    "expected a JSON body".to_string(),
                )),
            }
        }
    }

    struct AlwaysPanics;

    #[async_trait]
    impl EventHandler for AlwaysPanics {
        async fn call(
            &self,
            _ctx: &ConnectionContext,
            _request: HandlerRequest,
            _args: &[String],
        ) -> Result<HandlerReply, HandlerError> {
            Err(HandlerError::unexpected(
                "ZeroDivisionError",
                "x",
                "handler failed dividing by zero\n  at get_boom",
            ))
        }
    }

    struct StructuredButNotJson;

    #[async_trait]
    impl EventHandler for StructuredButNotJson {
        async fn call(
            &self,
            _ctx: &ConnectionContext,
            _request: HandlerRequest,
            _args: &[String],
        ) -> Result<HandlerReply, HandlerError> {
            let mut reply = HandlerReply::json(json!({"k": 1}));
            reply.mimetype = Some("text/csv".to_string());
            Ok(reply)
        }
    }

    fn dispatcher() -> EventDispatcher {
        let mut table = HandlerTable::new();
        table.register("GET", "cat", Arc::new(ConcatArgs));
        table.register("POST", "echo", Arc::new(EchoJsonBody));
        table.register("GET", "boom", Arc::new(AlwaysPanics));
        table.register("GET", "csv", Arc::new(StructuredButNotJson));
        EventDispatcher::new(table, ReplyCodes::default(), StatsSink::disabled())
    }

    #[test]
    fn selector_derivation() {
        assert_eq!(parse_selector("cat//3/4"), (
            "cat".to_string(),
            vec!["3".to_string(), "4".to_string()],
        ));
        assert_eq!(parse_selector("time"), ("time".to_string(), vec![]));
        assert_eq!(parse_selector("a/b/c"), ("a_b_c".to_string(), vec![]));
        assert_eq!(parse_selector("a/b//x"), (
            "a_b".to_string(),
            vec!["x".to_string()],
        ));
    }

    #[test]
    fn table_is_enumerable() {
        let mut table = HandlerTable::new();
        table.register("GET", "cat", Arc::new(ConcatArgs));
        table.register("post", "echo", Arc::new(EchoJsonBody));
        assert_eq!(table.selector_names(), vec!["get_cat", "post_echo"]);
    }

    #[tokio::test]
    async fn parameterized_route_concatenates_args() {
        let reply = dispatcher()
            .process(&ctx(), &event("GET", "cat//a/b", "", b""))
            .await;

        assert_eq!(reply.code, 0);
        assert_eq!(reply.mimetype, CONTENT_TYPE_JSON);
        let body: serde_json::Value =
            serde_json::from_slice(&reply.data).expect("json body");
        assert_eq!(body, json!({"r": "ab"}));
    }

    #[tokio::test]
    async fn json_bodies_are_decoded_before_the_handler() {
        let reply = dispatcher()
            .process(
                &ctx(),
                &event("POST", "echo", CONTENT_TYPE_JSON, b"{\"x\": 3}"),
            )
            .await;

        assert_eq!(reply.code, 0);
        let body: serde_json::Value =
            serde_json::from_slice(&reply.data).expect("json body");
        assert_eq!(body, json!({"x": 3}));
    }

    #[tokio::test]
    async fn missing_handler_yields_the_unhandled_event_code() {
        let dispatcher = dispatcher();
        let reply = dispatcher
            .process(&ctx(), &event("POST", "unknown", "", b""))
            .await;

        assert_eq!(reply.code, dispatcher.codes().unhandled_event);
        assert!(reply.data.is_empty());
    }

    #[tokio::test]
    async fn handler_error_yields_the_exception_body() {
        let dispatcher = dispatcher();
        let reply =
            dispatcher.process(&ctx(), &event("GET", "boom", "", b"")).await;

        assert_eq!(reply.code, dispatcher.codes().unhandled_exception);
        assert_eq!(reply.mimetype, CONTENT_TYPE_JSON);

        let body: serde_json::Value =
            serde_json::from_slice(&reply.data).expect("json body");
        assert_eq!(body["exception"]["class"], "ZeroDivisionError");
        assert_eq!(body["exception"]["message"], "x");
        assert!(
            !body["exception"]["traceback"]
                .as_str()
                .expect("traceback string")
                .is_empty()
        );
    }

    #[tokio::test]
    async fn undecodable_json_body_yields_the_exception_body() {
        let dispatcher = dispatcher();
        let reply = dispatcher
            .process(
                &ctx(),
                &event("POST", "echo", CONTENT_TYPE_JSON, b"{not json"),
            )
            .await;

        assert_eq!(reply.code, dispatcher.codes().unhandled_exception);
        let body: serde_json::Value =
            serde_json::from_slice(&reply.data).expect("json body");
        assert_eq!(body["exception"]["class"], "JsonDecodeError");
    }

    #[tokio::test]
    async fn structured_reply_with_non_json_mimetype_is_an_error() {
        let dispatcher = dispatcher();
        let reply =
            dispatcher.process(&ctx(), &event("GET", "csv", "", b"")).await;

        assert_eq!(reply.code, dispatcher.codes().unhandled_exception);
        let body: serde_json::Value =
            serde_json::from_slice(&reply.data).expect("json body");
        assert_eq!(body["exception"]["class"], "ValueError");
    }

    #[tokio::test]
    async fn domain_failure_carries_the_handler_code() {
        struct Teapot;

        #[async_trait]
        impl EventHandler for Teapot {
            async fn call(
                &self,
                _ctx: &ConnectionContext,
                _request: HandlerRequest,
                _args: &[String],
            ) -> Result<HandlerReply, HandlerError> {
                Err(HandlerError::failure(418, "short and stout"))
            }
        }

        let mut table = HandlerTable::new();
        table.register("GET", "teapot", Arc::new(Teapot));
        let dispatcher = EventDispatcher::new(
            table,
            ReplyCodes::default(),
            StatsSink::disabled(),
        );

        let reply =
            dispatcher.process(&ctx(), &event("GET", "teapot", "", b"")).await;
        assert_eq!(reply.code, 418);
        assert_eq!(reply.data, b"short and stout");
    }
}
