//! DNSBL lookup client.
//!
//! Standard DNSBL pattern: reverse the IPv4 octets and query the result
//! under the blocklist zone as an A record. Checking `1.2.3.4` against
//! `zen.spamhaus.org` queries `4.3.2.1.zen.spamhaus.org.`
//!
//! - NXDOMAIN (or an empty answer) means the address is not listed.
//! - An A record such as `127.0.0.2` is the listing code.
//! - The provider's non-determinative answer (`127.255.255.254` for
//!   Spamhaus) is retried with exponential backoff.

use super::{DnsResolver, LookupError, ResolveOutcome};
use crate::config::DnsblConfig;
use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfig, ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::xfer::Protocol;
use hickory_resolver::TokioResolver;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Reverse an IPv4 address for DNSBL lookup.
///
/// Converts `1.2.3.4` into `4.3.2.1` (without zone suffix).
pub fn reverse_ipv4(ip: &Ipv4Addr) -> String {
    let octets = ip.octets();
    format!("{}.{}.{}.{}", octets[3], octets[2], octets[1], octets[0])
}

/// Build the fully qualified DNSBL query name for an address under a zone.
///
/// `build_query_name("10.0.0.1", "zen.spamhaus.org")` gives
/// `"1.0.0.10.zen.spamhaus.org."`.
pub fn build_query_name(ip: &str, zone: &str) -> Result<String, LookupError> {
    let addr: Ipv4Addr = ip
        .parse()
        .map_err(|_| LookupError::InvalidAddress(ip.to_string()))?;
    Ok(format!("{}.{}.", reverse_ipv4(&addr), zone.trim_end_matches('.')))
}

/// Recover the address from a DNSBL query name.
pub fn parse_query_name(query: &str, zone: &str) -> Result<Ipv4Addr, LookupError> {
    let zone = zone.trim_end_matches('.');
    let prefix = query
        .trim_end_matches('.')
        .strip_suffix(zone)
        .and_then(|s| s.strip_suffix('.'))
        .ok_or_else(|| LookupError::InvalidAddress(query.to_string()))?;

    let mut octets: Vec<&str> = prefix.split('.').collect();
    if octets.len() != 4 {
        return Err(LookupError::InvalidAddress(query.to_string()));
    }
    octets.reverse();

    octets
        .join(".")
        .parse()
        .map_err(|_| LookupError::InvalidAddress(query.to_string()))
}

/// Resolver pinned to one upstream server over UDP.
pub struct HickoryResolver {
    resolver: TokioResolver,
    upstream: SocketAddr,
}

impl HickoryResolver {
    /// Create a resolver that only talks to `upstream`.
    ///
    /// System resolver configuration is ignored and answer caching is off,
    /// so every query reaches the upstream.
    pub fn new(upstream: SocketAddr, timeout: Duration) -> Self {
        let mut config = ResolverConfig::new();
        config.add_name_server(NameServerConfig::new(upstream, Protocol::Udp));

        let mut opts = ResolverOpts::default();
        opts.cache_size = 0;
        opts.attempts = 1;
        opts.timeout = timeout;

        let resolver =
            TokioResolver::builder_with_config(config, TokioConnectionProvider::default())
                .with_options(opts)
                .build();

        Self { resolver, upstream }
    }
}

#[async_trait]
impl DnsResolver for HickoryResolver {
    async fn resolve_a(&self, name: &str) -> Result<ResolveOutcome, LookupError> {
        match self.resolver.ipv4_lookup(name).await {
            Ok(lookup) => Ok(lookup
                .iter()
                .next()
                .map_or(ResolveOutcome::NotFound, |a| ResolveOutcome::Listed(a.0))),
            // Covers NXDOMAIN as well as NOERROR with no A records.
            Err(e) if e.is_no_records_found() => Ok(ResolveOutcome::NotFound),
            Err(e) => Err(LookupError::Resolver(e.to_string())),
        }
    }

    fn upstream(&self) -> String {
        self.upstream.to_string()
    }
}

/// DNSBL lookup client with retry on non-determinative answers.
pub struct DnsblClient {
    config: DnsblConfig,
    resolver: Arc<dyn DnsResolver>,
}

impl DnsblClient {
    /// Create a client backed by a hickory resolver pinned to the configured server.
    pub fn new(config: DnsblConfig) -> anyhow::Result<Self> {
        let upstream = config.resolver_addr()?;
        let resolver = HickoryResolver::new(upstream, Duration::from_millis(config.query_timeout_ms));
        Ok(Self::with_resolver(config, Arc::new(resolver)))
    }

    /// Create a client with a caller-provided resolver.
    pub fn with_resolver(config: DnsblConfig, resolver: Arc<dyn DnsResolver>) -> Self {
        Self { config, resolver }
    }

    /// Response code stored for addresses that are not listed.
    pub fn not_listed(&self) -> &str {
        &self.config.not_listed
    }

    /// Look up `ip` and return its response code.
    ///
    /// Returns the not-listed sentinel on NXDOMAIN. Non-determinative
    /// answers are retried up to `max_attempts` total queries; resolver
    /// errors are returned immediately.
    pub async fn lookup(&self, ip: &str, cancel: &CancellationToken) -> Result<String, LookupError> {
        let name = build_query_name(ip, &self.config.zone)?;
        let max_attempts = self.config.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                let delay = self.backoff_delay(attempt - 1);
                debug!(ip = %ip, attempt, delay_ms = delay.as_millis() as u64, "Backing off");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(LookupError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            debug!(ip = %ip, query = %name, attempt, upstream = %self.resolver.upstream(), "Querying DNSBL");

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(LookupError::Cancelled),
                result = self.resolver.resolve_a(&name) => result?,
            };

            match outcome {
                ResolveOutcome::NotFound => {
                    debug!(ip = %ip, "Not listed");
                    return Ok(self.config.not_listed.clone());
                }
                ResolveOutcome::Listed(addr) => {
                    let code = addr.to_string();
                    if code != self.config.non_determinative {
                        debug!(ip = %ip, code = %code, "Listed");
                        return Ok(code);
                    }
                    debug!(ip = %ip, attempt, "Non-determinative answer");
                }
            }
        }

        warn!(ip = %ip, attempts = max_attempts, "DNSBL answer still non-determinative");
        Err(LookupError::NonDeterminative {
            attempts: max_attempts,
        })
    }

    /// Delay before the `retry`-th retry (1-based): base, 2x base, 4x base, ...
    fn backoff_delay(&self, retry: u32) -> Duration {
        let factor = 1u64 << retry.saturating_sub(1).min(32);
        Duration::from_millis(self.config.backoff_base_ms.saturating_mul(factor))
    }
}
