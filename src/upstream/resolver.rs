//! Name resolution.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::DnsConfig;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no addresses found for {0}")]
    NotFound(String),

    #[error("lookup of {host} failed: {source}")]
    Lookup {
        host: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    /// Put IPv4 addresses ahead of IPv6 ones.
    pub prefer_ipv4: bool,
}

#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(
        &self,
        name: &str,
        port: u16,
        options: &ResolveOptions,
    ) -> Result<Vec<SocketAddr>, ResolveError>;
}

fn order(mut addrs: Vec<SocketAddr>, options: &ResolveOptions) -> Vec<SocketAddr> {
    if options.prefer_ipv4 {
        // Stable: keeps resolver order within each family.
        addrs.sort_by_key(|a| !a.is_ipv4());
    }
    addrs
}

/// Operating-system resolver via `tokio::net::lookup_host`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(
        &self,
        name: &str,
        port: u16,
        options: &ResolveOptions,
    ) -> Result<Vec<SocketAddr>, ResolveError> {
        if let Ok(ip) = name.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>() {
            return Ok(vec![SocketAddr::new(ip, port)]);
        }
        let found: Vec<SocketAddr> = tokio::net::lookup_host((name, port))
            .await
            .map_err(|source| ResolveError::Lookup {
                host: name.to_string(),
                source,
            })?
            .collect();
        if found.is_empty() {
            return Err(ResolveError::NotFound(name.to_string()));
        }
        Ok(order(found, options))
    }
}

/// Static host table consulted before a fallback resolver.
pub struct StaticResolver {
    hosts: HashMap<String, Vec<IpAddr>>,
    fallback: Option<Arc<dyn Resolver>>,
}

impl StaticResolver {
    pub fn new(fallback: Option<Arc<dyn Resolver>>) -> Self {
        Self {
            hosts: HashMap::new(),
            fallback,
        }
    }

    /// Host table from config over the system resolver. Unparseable entries
    /// are rejected by config validation and skipped here.
    pub fn from_config(config: &DnsConfig) -> Self {
        let mut resolver = Self::new(Some(Arc::new(SystemResolver)));
        for (host, ips) in &config.hosts {
            let parsed: Vec<IpAddr> = ips.iter().filter_map(|ip| ip.parse().ok()).collect();
            resolver.insert(host, parsed);
        }
        resolver
    }

    pub fn insert(&mut self, host: &str, ips: Vec<IpAddr>) {
        self.hosts.insert(host.to_ascii_lowercase(), ips);
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve(
        &self,
        name: &str,
        port: u16,
        options: &ResolveOptions,
    ) -> Result<Vec<SocketAddr>, ResolveError> {
        if let Some(ips) = self.hosts.get(&name.to_ascii_lowercase()) {
            if !ips.is_empty() {
                let addrs = ips.iter().map(|ip| SocketAddr::new(*ip, port)).collect();
                return Ok(order(addrs, options));
            }
        }
        match &self.fallback {
            Some(fallback) => fallback.resolve(name, port, options).await,
            None => Err(ResolveError::NotFound(name.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_table_wins_and_orders_families() {
        let mut resolver = StaticResolver::new(None);
        resolver.insert(
            "Origin.Test",
            vec!["::1".parse().unwrap(), "127.0.0.1".parse().unwrap()],
        );
        let options = ResolveOptions { prefer_ipv4: true };
        let addrs = resolver.resolve("origin.test", 8080, &options).await.unwrap();
        assert_eq!(addrs[0], "127.0.0.1:8080".parse().unwrap());
        assert_eq!(addrs.len(), 2);
    }

    #[tokio::test]
    async fn unknown_without_fallback_is_not_found() {
        let resolver = StaticResolver::new(None);
        let err = resolver
            .resolve("missing.test", 80, &ResolveOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::NotFound(_)));
    }

    #[tokio::test]
    async fn system_resolver_passes_literals_through() {
        let addrs = SystemResolver
            .resolve("127.0.0.1", 9000, &ResolveOptions::default())
            .await
            .unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:9000".parse().unwrap()]);
    }
}
