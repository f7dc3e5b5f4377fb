mod catalog;
mod handlers;
mod http;
mod listener;
mod resolver;

pub use catalog::{ConnectionCatalog, PeerConnection};
pub use handlers::provider_from_name;
pub use http::router;
pub use listener::run_pipe_listener;
pub use resolver::{DnsResolver, HostnameResolver, ResolveError, resolver_from_name};
