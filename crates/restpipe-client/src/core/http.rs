use std::time::Duration;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use restpipe_core::event::{HEADER_EVENT_RETURN_CODE, emit};
use restpipe_core::stats::{MESSAGE_SEND_TICK, StatsSink};
use restpipe_proto::EventReply;
use tracing::{info, warn};

use crate::core::controller::ActiveConnection;

#[derive(Clone)]
pub struct HttpState {
    pub active: ActiveConnection,
    pub stats: StatsSink,
    pub event_timeout: Duration,
}

/// HTTP ingress: any method on `/{noun...}` forwards to the server over
/// the single pipe connection.
pub fn router(state: HttpState) -> Router {
    Router::new().route("/{*noun}", any(forward_event)).with_state(state)
}

async fn forward_event(
    State(state): State<HttpState>,
    Path(noun): Path<String>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    info!("client received request: verb={}, noun={}", method, noun);

    let Some(exchange) = state.active.get().await else {
        warn!("request while disconnected: noun={}", noun);
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "no server connection".to_string(),
        )
            .into_response();
    };

    let mimetype = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok());

    state.stats.incr(MESSAGE_SEND_TICK);
    match emit(
        &exchange,
        method.as_str(),
        &noun,
        mimetype,
        body.to_vec(),
        state.event_timeout,
    )
    .await
    {
        Ok(reply) => reply_response(reply),
        Err(err) => {
            warn!("event emit failed: noun={}, error={}", noun, err);
            (StatusCode::BAD_GATEWAY, format!("pipe failure: {err}"))
                .into_response()
        }
    }
}

fn reply_response(reply: EventReply) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(HEADER_EVENT_RETURN_CODE, reply.code);

    if !reply.mimetype.is_empty() {
        builder = builder.header(CONTENT_TYPE, reply.mimetype);
    }

    match builder.body(Body::from(reply.data)) {
        Ok(response) => response,
        Err(err) => {
            warn!("failed to render event reply: error={err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
