//! Mail server lookup for a recipient domain.
//!
//! MX records ordered by preference, falling back to the domain's own A/AAAA
//! records when it publishes no MX (RFC 5321 section 5.1). Answers are cached
//! for their DNS TTL, clamped to the configured bounds.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use hickory_resolver::{TokioResolver, config::ResolverOpts, name_server::TokioConnectionProvider};
use postern_common::{config::seconds, internal};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DnsError {
    /// No MX, A, or AAAA records.
    #[error("No mail servers found for domain: {0}")]
    NoMailServers(String),

    #[error("DNS lookup failed: {0}")]
    LookupFailed(#[from] hickory_resolver::ResolveError),

    /// NXDOMAIN.
    #[error("Domain does not exist: {0}")]
    DomainNotFound(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Per-query timeout.
    #[serde(default = "defaults::timeout", with = "seconds")]
    pub timeout: Duration,

    #[serde(default = "defaults::min_cache_ttl", with = "seconds")]
    pub min_cache_ttl: Duration,

    #[serde(default = "defaults::max_cache_ttl", with = "seconds")]
    pub max_cache_ttl: Duration,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            timeout: defaults::timeout(),
            min_cache_ttl: defaults::min_cache_ttl(),
            max_cache_ttl: defaults::max_cache_ttl(),
        }
    }
}

mod defaults {
    use std::time::Duration;

    pub const fn timeout() -> Duration {
        Duration::from_secs(5)
    }

    pub const fn min_cache_ttl() -> Duration {
        Duration::from_secs(60)
    }

    pub const fn max_cache_ttl() -> Duration {
        Duration::from_secs(3600)
    }
}

/// One host to try, in the order returned by [`MxResolver::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailServer {
    pub host: String,
    /// MX preference; 0 for the implicit A/AAAA fallback.
    pub priority: u16,
    pub port: u16,
}

impl MailServer {
    #[must_use]
    pub fn new(host: impl Into<String>, priority: u16, port: u16) -> Self {
        Self {
            host: host.into(),
            priority,
            port,
        }
    }
}

impl std::fmt::Display for MailServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

struct Cached {
    servers: Arc<[MailServer]>,
    expires_at: Instant,
}

pub struct MxResolver {
    resolver: TokioResolver,
    cache: DashMap<String, Cached>,
    config: DnsConfig,
    port: u16,
}

impl std::fmt::Debug for MxResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MxResolver")
            .field("config", &self.config)
            .field("port", &self.port)
            .field("cached", &self.cache.len())
            .finish_non_exhaustive()
    }
}

impl MxResolver {
    /// Build a resolver from the system configuration. Every server returned
    /// uses `port`.
    ///
    /// # Errors
    /// If the system resolver configuration cannot be loaded
    pub fn new(config: DnsConfig, port: u16) -> Result<Self, DnsError> {
        let mut opts = ResolverOpts::default();
        opts.timeout = config.timeout;

        let resolver = TokioResolver::builder(TokioConnectionProvider::default())?
            .with_options(opts)
            .build();

        Ok(Self {
            resolver,
            cache: DashMap::new(),
            config,
            port,
        })
    }

    /// Mail servers for `domain`, most preferred first.
    ///
    /// # Errors
    /// [`DnsError::NoMailServers`] and [`DnsError::DomainNotFound`] are
    /// answers; [`DnsError::LookupFailed`] is worth retrying
    pub async fn resolve(&self, domain: &str) -> Result<Arc<[MailServer]>, DnsError> {
        let domain = domain.to_ascii_lowercase();

        if let Some(cached) = self.cache.get(&domain)
            && cached.expires_at > Instant::now()
        {
            return Ok(Arc::clone(&cached.servers));
        }

        let (servers, ttl) = self.lookup(&domain).await?;
        let servers: Arc<[MailServer]> = servers.into();
        let ttl = Duration::from_secs(u64::from(ttl))
            .clamp(self.config.min_cache_ttl, self.config.max_cache_ttl);

        internal!(
            level = DEBUG,
            "Resolved {} mail server(s) for {domain}, caching for {ttl:?}",
            servers.len()
        );

        self.cache.insert(
            domain,
            Cached {
                servers: Arc::clone(&servers),
                expires_at: Instant::now() + ttl,
            },
        );

        Ok(servers)
    }

    async fn lookup(&self, domain: &str) -> Result<(Vec<MailServer>, u32), DnsError> {
        match self.resolver.mx_lookup(domain).await {
            Ok(lookup) => {
                let ttl = lookup
                    .as_lookup()
                    .records()
                    .iter()
                    .map(hickory_resolver::proto::rr::Record::ttl)
                    .min()
                    .unwrap_or(300);

                let servers = by_preference(
                    lookup
                        .iter()
                        .map(|mx| {
                            let host = mx.exchange().to_utf8();
                            MailServer::new(host.trim_end_matches('.'), mx.preference(), self.port)
                        })
                        .collect(),
                );

                if servers.is_empty() {
                    self.fallback(domain).await
                } else {
                    Ok((servers, ttl))
                }
            }
            Err(err) if err.is_nx_domain() => Err(DnsError::DomainNotFound(domain.to_string())),
            Err(err) if err.is_no_records_found() => self.fallback(domain).await,
            Err(err) => {
                internal!(level = WARN, "MX lookup failed for {domain}: {err}");
                Err(err.into())
            }
        }
    }

    /// The domain itself as an implicit MX.
    async fn fallback(&self, domain: &str) -> Result<(Vec<MailServer>, u32), DnsError> {
        match self.resolver.lookup_ip(domain).await {
            Ok(lookup) => {
                #[allow(clippy::redundant_closure_for_method_calls)]
                let ttl = lookup
                    .as_lookup()
                    .records()
                    .iter()
                    .map(|record| record.ttl())
                    .min()
                    .unwrap_or(300);

                let servers: Vec<MailServer> = lookup
                    .iter()
                    .map(|ip| MailServer::new(ip.to_string(), 0, self.port))
                    .collect();

                if servers.is_empty() {
                    Err(DnsError::NoMailServers(domain.to_string()))
                } else {
                    Ok((servers, ttl))
                }
            }
            Err(err) if err.is_nx_domain() => Err(DnsError::DomainNotFound(domain.to_string())),
            Err(err) if err.is_no_records_found() => {
                Err(DnsError::NoMailServers(domain.to_string()))
            }
            Err(err) => {
                internal!(level = WARN, "A/AAAA lookup failed for {domain}: {err}");
                Err(err.into())
            }
        }
    }
}

/// Stable sort, so equal preferences keep the order the resolver gave.
fn by_preference(mut servers: Vec<MailServer>) -> Vec<MailServer> {
    servers.sort_by_key(|server| server.priority);
    servers
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn preference_order() {
        let servers = by_preference(vec![
            MailServer::new("mx3.example.com", 30, 25),
            MailServer::new("mx1.example.com", 10, 25),
            MailServer::new("mx1b.example.com", 10, 25),
            MailServer::new("mx2.example.com", 20, 25),
        ]);

        let hosts: Vec<&str> = servers.iter().map(|s| s.host.as_str()).collect();
        assert_eq!(
            hosts,
            ["mx1.example.com", "mx1b.example.com", "mx2.example.com", "mx3.example.com"]
        );
    }

    #[test]
    fn display() {
        assert_eq!(MailServer::new("mail.example.com", 10, 25).to_string(), "mail.example.com:25");
        assert_eq!(MailServer::new("::1", 0, 2525).to_string(), "[::1]:2525");
    }

    #[test]
    fn config_in_seconds() {
        let config: DnsConfig = ron::from_str("(timeout: 2.5)").unwrap();
        assert_eq!(config.timeout, Duration::from_millis(2500));
        assert_eq!(config.max_cache_ttl, Duration::from_secs(3600));
    }

    #[tokio::test]
    #[ignore = "Requires network access"]
    async fn resolves_real_domain() {
        let resolver = MxResolver::new(DnsConfig::default(), 25).unwrap();
        let servers = resolver.resolve("gmail.com").await.unwrap();
        assert!(!servers.is_empty());
        assert!(servers.windows(2).all(|w| w[0].priority <= w[1].priority));
    }
}
