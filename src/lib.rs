//! DNSBL reputation lookups with a persistent result cache.
//!
//! Checks IPv4 addresses against a DNS-based blocklist and stores each
//! answer in SQLite so callers can read it back without another query.
//!
//! # Features
//!
//! - **DNSBL Client** - Reversed-octet queries against one pinned UDP resolver
//! - **Retry** - Exponential backoff on the provider's non-determinative answer
//! - **Result Store** - One row per address, idempotent upserts
//! - **Batch Lookups** - One task per address, results in input order
//! - **Cancellation** - Caller tokens and batch deadlines abort queries and backoff
//!
//! # Example Configuration
//!
//! ```yaml
//! dnsbl:
//!   zone: "zen.spamhaus.org"
//!   resolver: "1.1.1.1:53"
//!   max_attempts: 5
//!   backoff_base_ms: 1000
//!
//! store:
//!   path: "./database/ip_details.sqlite"
//!
//! batch:
//!   timeout_ms: 60000
//! ```

pub mod batch;
pub mod config;
pub mod providers;
pub mod store;

pub use batch::BatchOrchestrator;
pub use config::Config;
pub use providers::dnsbl::DnsblClient;
pub use providers::LookupError;
pub use store::{ReputationRecord, ResultStore, StoreError};
