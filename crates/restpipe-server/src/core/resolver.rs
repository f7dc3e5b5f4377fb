use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::lookup_host;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("hostname not resolvable: {0}")]
    NotFound(String),
    #[error("hostname resolution failed for {hostname}: {detail}")]
    Other { hostname: String, detail: String },
}

/// Derives IPs from hostnames when routing events from the server to a
/// particular client. Pluggable so deployments can resolve against their
/// own inventory instead of DNS.
#[async_trait]
pub trait HostnameResolver: Send + Sync {
    async fn lookup(&self, hostname: &str) -> Result<IpAddr, ResolveError>;
}

/// Resolver backed by the system's name service.
pub struct DnsResolver;

#[async_trait]
impl HostnameResolver for DnsResolver {
    async fn lookup(&self, hostname: &str) -> Result<IpAddr, ResolveError> {
        let addrs = lookup_host((hostname, 0))
            .await
            .map_err(|_| ResolveError::NotFound(hostname.to_string()))?;

        addrs
            .map(|addr| addr.ip())
            .next()
            .ok_or_else(|| ResolveError::NotFound(hostname.to_string()))
    }
}

/// Registry lookup for the configured resolver name.
pub fn resolver_from_name(name: &str) -> Option<Arc<dyn HostnameResolver>> {
    match name {
        "dns" => Some(Arc::new(DnsResolver)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::resolver_from_name;

    #[test]
    fn registry_knows_the_dns_resolver() {
        assert!(resolver_from_name("dns").is_some());
        assert!(resolver_from_name("consul").is_none());
    }
}
