use std::net::IpAddr;

use restpipe_proto::ProtoError;
use thiserror::Error;

/// Connection-plane errors. `Closed`, `Malformed`, and `ConnectionFail`
/// are connection-fatal; `Timeout` leaves the connection usable unless the
/// caller is the heartbeat pacemaker.
#[derive(Debug, Error)]
pub enum PipeError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("connection closed")]
    Closed,
    #[error("timed out waiting on the pipe")]
    Timeout,
    #[error("connection attempt failed: {0}")]
    ConnectionFail(String),
    #[error("a connection is already registered for {0}")]
    Duplicate(IpAddr),
    #[error("no live connection for {0}")]
    NoConnection(IpAddr),
}

impl From<ProtoError> for PipeError {
    fn from(err: ProtoError) -> Self {
        Self::Malformed(err.to_string())
    }
}
