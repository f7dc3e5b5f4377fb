use std::time::Duration;

use restpipe_proto::{Event, EventReply, Message, PROTOCOL_VERSION};
use tracing::info;

use crate::error::PipeError;
use crate::exchange::Exchange;

/// Response header carrying the remote handler's return code back to the
/// HTTP caller.
pub const HEADER_EVENT_RETURN_CODE: &str = "X-Event-Return-Code";

/// Originates an EVENT on `exchange` and waits for its correlated reply.
///
/// The mimetype is truncated at the first `;` (charset parameters are not
/// part of the pipe contract). A reply of any other kind is a protocol
/// violation.
pub async fn emit(
    exchange: &Exchange,
    verb: &str,
    noun: &str,
    mimetype: Option<&str>,
    data: Vec<u8>,
    timeout: Duration,
) -> Result<EventReply, PipeError> {
    let mimetype = mimetype
        .unwrap_or_default()
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_string();

    info!(
        "emitting event: peer={}, verb={}, noun={}, bytes={}",
        exchange.peer_addr(),
        verb,
        noun,
        data.len()
    );

    let message = Message::Event(Event {
        version: PROTOCOL_VERSION,
        verb: verb.to_uppercase(),
        noun: noun.to_string(),
        mimetype,
        data,
    });

    match exchange.send_and_await(message, timeout).await? {
        Message::EventReply(reply) => Ok(reply),
        other => Err(PipeError::Malformed(format!(
            "unexpected reply kind {:?} to an event",
            other.message_type()
        ))),
    }
}
