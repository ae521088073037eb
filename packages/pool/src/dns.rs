//! Address resolution.
//!
//! The establisher resolves through a [`Resolve`] implementation so callers
//! can supply their own lookup logic (the `lookup` option). The default is
//! the system resolver via `tokio::net::lookup_host`; a hickory-dns backed
//! resolver is available for deployments that want to bypass getaddrinfo.

use std::fmt;
use std::net::SocketAddr;

use futures::future::BoxFuture;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::{Resolver, TokioResolver};
use tracing::debug;

use crate::error::{Error, Result};

/// Hostname to socket-address resolution.
pub trait Resolve: fmt::Debug + Send + Sync {
    /// Resolve `host` to the addresses to attempt, in order.
    fn resolve(&self, host: &str, port: u16) -> BoxFuture<'static, Result<Vec<SocketAddr>>>;
}

/// System resolver (getaddrinfo) through tokio's blocking pool.
#[derive(Clone, Copy, Debug, Default)]
pub struct GaiResolver;

impl Resolve for GaiResolver {
    fn resolve(&self, host: &str, port: u16) -> BoxFuture<'static, Result<Vec<SocketAddr>>> {
        let host = host.to_owned();
        Box::pin(async move {
            let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), port))
                .await
                .map_err(Error::dns)?
                .collect();
            if addrs.is_empty() {
                return Err(Error::dns(format!("no addresses found for {host}")));
            }
            debug!(host = %host, count = addrs.len(), "resolved");
            Ok(addrs)
        })
    }
}

/// hickory-dns backed resolver using the default upstream configuration.
#[derive(Clone)]
pub struct HickoryResolver {
    resolver: TokioResolver,
}

impl HickoryResolver {
    pub fn new() -> Self {
        let resolver = Resolver::builder_with_config(
            ResolverConfig::default(),
            TokioConnectionProvider::default(),
        )
        .with_options(ResolverOpts::default())
        .build();
        Self { resolver }
    }
}

impl Default for HickoryResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HickoryResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HickoryResolver").finish()
    }
}

impl Resolve for HickoryResolver {
    fn resolve(&self, host: &str, port: u16) -> BoxFuture<'static, Result<Vec<SocketAddr>>> {
        let resolver = self.resolver.clone();
        let host = host.to_owned();
        Box::pin(async move {
            let lookup = resolver.lookup_ip(host.clone()).await.map_err(Error::dns)?;
            let addrs: Vec<SocketAddr> = lookup
                .iter()
                .map(|ip| SocketAddr::new(ip, port))
                .collect();
            if addrs.is_empty() {
                return Err(Error::dns(format!("no addresses found for {host}")));
            }
            debug!(host = %host, count = addrs.len(), "resolved");
            Ok(addrs)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn gai_resolves_localhost() {
        let addrs = GaiResolver.resolve("localhost", 4433).await.unwrap();
        assert!(!addrs.is_empty());
        assert!(addrs.iter().all(|addr| addr.port() == 4433));
    }

    #[tokio::test]
    async fn gai_fails_on_nonexistent_host() {
        let result = GaiResolver
            .resolve("nonexistent.invalid", 443)
            .await;
        assert!(result.unwrap_err().is_dns());
    }
}
