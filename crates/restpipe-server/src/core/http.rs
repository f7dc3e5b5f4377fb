use std::net::IpAddr;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use restpipe_core::event::{HEADER_EVENT_RETURN_CODE, emit};
use restpipe_core::stats::MESSAGE_SEND_TICK;
use restpipe_proto::EventReply;
use tracing::{info, warn};

use crate::app::AppState;
use crate::core::resolver::{HostnameResolver, ResolveError};

/// HTTP ingress: `/{client_host}/{noun...}` forwards any method to the
/// addressed client over its pipe connection.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/{client_host}/{*noun}", any(forward_event))
        .with_state(state)
}

async fn forward_event(
    State(state): State<AppState>,
    Path((client_host, noun)): Path<(String, String)>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    info!(
        "server received request for client: client_host={}, verb={}, noun={}",
        client_host, method, noun
    );

    let ip = match resolve_client_ip(state.resolver.as_ref(), &client_host)
        .await
    {
        Ok(ip) => ip,
        Err((status, message)) => return plain_response(status, message),
    };

    let conn = match state
        .catalog
        .wait_for(ip, state.connection_wait_timeout)
        .await
    {
        Ok(conn) => conn,
        Err(err) => {
            warn!("client connection unavailable: ip={}, error={}", ip, err);
            return plain_response(
                StatusCode::SERVICE_UNAVAILABLE,
                format!("client connection unavailable: {client_host}"),
            );
        }
    };

    let mimetype = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok());

    state.stats.incr(MESSAGE_SEND_TICK);
    match emit(
        &conn.exchange,
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
            warn!("event emit failed: ip={}, noun={}, error={}", ip, noun, err);
            plain_response(
                StatusCode::BAD_GATEWAY,
                format!("pipe failure: {err}"),
            )
        }
    }
}

/// Dotted-quad hosts short-circuit; everything else goes through the
/// pluggable resolver. Lookup misses map to 404, resolver faults to 500.
async fn resolve_client_ip(
    resolver: &dyn HostnameResolver,
    client_host: &str,
) -> Result<IpAddr, (StatusCode, String)> {
    if let Ok(ip) = client_host.parse::<IpAddr>() {
        return Ok(ip);
    }

    match resolver.lookup(client_host).await {
        Ok(ip) => Ok(ip),
        Err(ResolveError::NotFound(hostname)) => Err((
            StatusCode::NOT_FOUND,
            format!("hostname not resolvable: {hostname}"),
        )),
        Err(err) => {
            warn!("hostname resolution failed: host={client_host}, error={err}");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("hostname resolution error: {client_host}"),
            ))
        }
    }
}

/// Renders an event reply to HTTP: the body passes through verbatim, the
/// mimetype becomes `Content-Type`, and the handler's code travels in the
/// return-code header for the caller to interpret.
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

fn plain_response(status: StatusCode, message: String) -> Response {
    (status, message).into_response()
}
