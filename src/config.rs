//! Configuration types for the DNSBL reputation service.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// DNSBL lookup settings.
    #[serde(default)]
    pub dnsbl: DnsblConfig,

    /// Result store settings.
    #[serde(default)]
    pub store: StoreConfig,

    /// Batch lookup settings.
    #[serde(default)]
    pub batch: BatchConfig,
}

/// DNSBL lookup configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DnsblConfig {
    /// Blocklist zone appended to the reversed address.
    #[serde(default = "default_zone")]
    pub zone: String,

    /// The one DNS server every query goes to (UDP).
    #[serde(default = "default_resolver")]
    pub resolver: String,

    /// Answer the provider uses for "try again later".
    #[serde(default = "default_non_determinative")]
    pub non_determinative: String,

    /// Response code recorded for addresses that are not listed.
    #[serde(default = "default_not_listed")]
    pub not_listed: String,

    /// Total query attempts while the answer is non-determinative.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First backoff delay; doubles before every further retry.
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,

    /// Timeout for a single DNS query.
    #[serde(default = "default_query_timeout")]
    pub query_timeout_ms: u64,
}

impl Default for DnsblConfig {
    fn default() -> Self {
        Self {
            zone: default_zone(),
            resolver: default_resolver(),
            non_determinative: default_non_determinative(),
            not_listed: default_not_listed(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base(),
            query_timeout_ms: default_query_timeout(),
        }
    }
}

impl DnsblConfig {
    /// Parsed resolver socket address.
    pub fn resolver_addr(&self) -> anyhow::Result<SocketAddr> {
        self.resolver
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid resolver address '{}': {}", self.resolver, e))
    }
}

fn default_zone() -> String {
    "zen.spamhaus.org".to_string()
}

fn default_resolver() -> String {
    "1.1.1.1:53".to_string()
}

fn default_non_determinative() -> String {
    "127.255.255.254".to_string()
}

fn default_not_listed() -> String {
    "NXDOMAIN".to_string()
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_base() -> u64 {
    1000
}

fn default_query_timeout() -> u64 {
    5000
}

/// Result store configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    /// SQLite database file, created if missing.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    /// Connection pool size.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            max_connections: default_max_connections(),
        }
    }
}

fn default_store_path() -> PathBuf {
    PathBuf::from("./database/ip_details.sqlite")
}

fn default_max_connections() -> u32 {
    5
}

/// Batch lookup configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BatchConfig {
    /// Deadline for a whole batch. No deadline when unset.
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Addresses looked up per batch; the rest get an error record.
    #[serde(default = "default_max_addresses")]
    pub max_addresses: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: None,
            max_addresses: default_max_addresses(),
        }
    }
}

fn default_max_addresses() -> usize {
    256
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let expanded = expand_env_vars(&content);
        let config: Config = serde_yaml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        let dnsbl = &self.dnsbl;

        if dnsbl.zone.trim_end_matches('.').is_empty() {
            anyhow::bail!("dnsbl.zone must not be empty");
        }
        if dnsbl.zone.trim_end_matches('.').split('.').any(str::is_empty) {
            anyhow::bail!("dnsbl.zone has an empty label: {}", dnsbl.zone);
        }

        dnsbl.resolver_addr()?;

        if dnsbl.max_attempts == 0 {
            anyhow::bail!("dnsbl.max_attempts must be at least 1");
        }

        if dnsbl.non_determinative.is_empty() || dnsbl.not_listed.is_empty() {
            anyhow::bail!("dnsbl sentinels must not be empty");
        }
        if dnsbl.non_determinative == dnsbl.not_listed {
            anyhow::bail!(
                "dnsbl.non_determinative and dnsbl.not_listed must differ (both '{}')",
                dnsbl.not_listed
            );
        }

        if self.store.max_connections == 0 {
            anyhow::bail!("store.max_connections must be at least 1");
        }

        if self.batch.max_addresses == 0 {
            anyhow::bail!("batch.max_addresses must be at least 1");
        }

        Ok(())
    }

    /// Generate example configuration YAML.
    pub fn example() -> String {
        r#"# DNSBL Reputation Configuration

dnsbl:
  zone: "zen.spamhaus.org"
  resolver: "1.1.1.1:53"            # every query goes here over UDP
  non_determinative: "127.255.255.254"
  not_listed: "NXDOMAIN"            # stored for addresses that are not listed
  max_attempts: 5                   # total attempts on non-determinative answers
  backoff_base_ms: 1000             # 1s, 2s, 4s, 8s between attempts
  query_timeout_ms: 5000

store:
  path: "${DB_PATH}"
  max_connections: 5

batch:
  timeout_ms: 60000                 # omit for no deadline
  max_addresses: 256
"#
        .to_string()
    }
}

/// Expand environment variables in the format ${VAR_NAME}.
fn expand_env_vars(content: &str) -> String {
    let mut result = content.to_string();
    let re = regex::Regex::new(r"\$\{([^}]+)\}").expect("static pattern");

    for cap in re.captures_iter(content) {
        let var_name = &cap[1];
        let var_value = std::env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
