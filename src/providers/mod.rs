//! Reputation lookup providers.
//!
//! A provider turns an IPv4 address into a DNSBL response code. The network
//! side sits behind [`DnsResolver`] so the retry logic in
//! [`dnsbl::DnsblClient`] can be driven without touching the network.

pub mod dnsbl;

use async_trait::async_trait;
use std::net::Ipv4Addr;
use thiserror::Error;

/// Answer from a single resolver query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// The name resolved; carries the first A record.
    Listed(Ipv4Addr),
    /// NXDOMAIN or an empty answer.
    NotFound,
}

/// Error from a reputation lookup.
#[derive(Debug, Clone, Error)]
pub enum LookupError {
    /// Input was not a dotted-quad IPv4 address.
    #[error("invalid IPv4 address '{0}'")]
    InvalidAddress(String),

    /// Resolver failed with something other than "not found".
    #[error("resolver error: {0}")]
    Resolver(String),

    /// Every attempt came back with the non-determinative sentinel.
    #[error("received non-determinative response after {attempts} attempts")]
    NonDeterminative { attempts: u32 },

    /// The caller cancelled the lookup or its deadline passed.
    #[error("lookup cancelled")]
    Cancelled,
}

impl LookupError {
    /// Whether this error came from cancellation rather than the lookup itself.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, LookupError::Cancelled)
    }
}

/// Forward A-record resolution against a fixed upstream.
#[async_trait]
pub trait DnsResolver: Send + Sync {
    /// Resolve `name` as an A record.
    async fn resolve_a(&self, name: &str) -> Result<ResolveOutcome, LookupError>;

    /// Upstream description for logging.
    fn upstream(&self) -> String;
}
