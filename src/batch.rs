//! Concurrent batch lookups with result caching.

use crate::config::BatchConfig;
use crate::providers::dnsbl::DnsblClient;
use crate::store::{ReputationRecord, ResultStore, StoreError};
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Runs DNSBL lookups for a batch of addresses and caches the answers.
pub struct BatchOrchestrator {
    client: Arc<DnsblClient>,
    store: Arc<ResultStore>,
    config: BatchConfig,
}

impl BatchOrchestrator {
    /// Create a new orchestrator.
    pub fn new(client: Arc<DnsblClient>, store: Arc<ResultStore>, config: BatchConfig) -> Self {
        Self {
            client,
            store,
            config,
        }
    }

    /// Cached record for a single address, if any.
    pub async fn cached(&self, ip: &str) -> Result<Option<ReputationRecord>, StoreError> {
        self.store.get(ip).await
    }

    /// Look up every address concurrently and store each successful answer.
    ///
    /// The result always has one record per input, in input order. Failed
    /// lookups and failed writes are reported in that record's
    /// `response_code` and are not stored.
    pub async fn lookup_and_cache_all(
        &self,
        ips: &[String],
        cancel: &CancellationToken,
    ) -> Vec<ReputationRecord> {
        let started = Instant::now();
        let batch_cancel = cancel.child_token();
        // Cancels the deadline timer once the batch returns.
        let _batch_guard = batch_cancel.clone().drop_guard();

        if let Some(timeout_ms) = self.config.timeout_ms {
            let deadline = batch_cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = deadline.cancelled() => {}
                    _ = tokio::time::sleep(Duration::from_millis(timeout_ms)) => {
                        debug!(timeout_ms, "Batch deadline reached");
                        deadline.cancel();
                    }
                }
            });
        }

        let tasks = ips.iter().enumerate().map(|(index, ip)| {
            let ip = ip.clone();

            if index >= self.config.max_addresses {
                return Slot::Rejected(ip);
            }

            let client = self.client.clone();
            let store = self.store.clone();
            let cancel = batch_cancel.clone();
            let handle = tokio::spawn({
                let ip = ip.clone();
                async move { lookup_and_cache(&client, &store, ip, &cancel).await }
            });
            Slot::Running(ip, handle)
        });
        let slots: Vec<Slot> = tasks.collect();

        let results = join_all(slots.into_iter().map(Slot::finish)).await;

        let failed = results.iter().filter(|r| is_error_record(r)).count();
        info!(
            addresses = results.len(),
            failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Batch lookup finished"
        );

        results
    }
}

/// Output slot for one input address.
enum Slot {
    Running(String, tokio::task::JoinHandle<ReputationRecord>),
    Rejected(String),
}

impl Slot {
    async fn finish(self) -> ReputationRecord {
        match self {
            Slot::Running(ip, handle) => match handle.await {
                Ok(record) => record,
                Err(e) => {
                    warn!(ip = %ip, error = %e, "Lookup task failed");
                    error_record(&ip, format!("Error: lookup task failed: {e}"))
                }
            },
            Slot::Rejected(ip) => error_record(&ip, "Error: batch size limit exceeded".to_string()),
        }
    }
}

async fn lookup_and_cache(
    client: &DnsblClient,
    store: &ResultStore,
    ip: String,
    cancel: &CancellationToken,
) -> ReputationRecord {
    let code = match client.lookup(&ip, cancel).await {
        Ok(code) => code,
        Err(e) => {
            warn!(ip = %ip, error = %e, "DNSBL lookup failed");
            return error_record(&ip, format!("Error: {e}"));
        }
    };

    let record = ReputationRecord::new(&ip, code);
    match store.upsert(&record).await {
        Ok(()) => record,
        Err(e) => {
            warn!(ip = %ip, error = %e, "Failed to store lookup result");
            error_record(&ip, format!("Error updating: {e}"))
        }
    }
}

fn error_record(ip: &str, message: String) -> ReputationRecord {
    ReputationRecord::new(ip, message)
}

/// Whether a batch result describes a failure rather than a DNSBL answer.
pub fn is_error_record(record: &ReputationRecord) -> bool {
    record.response_code.starts_with("Error")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DnsblConfig;
    use crate::providers::dnsbl::build_query_name;
    use crate::providers::test_support::ScriptedResolver;
    use crate::providers::{LookupError, ResolveOutcome};
    use std::net::Ipv4Addr;

    const ZONE: &str = "zen.spamhaus.org";
    const NON_DETERMINATIVE: Ipv4Addr = Ipv4Addr::new(127, 255, 255, 254);

    fn query(ip: &str) -> String {
        build_query_name(ip, ZONE).unwrap()
    }

    fn listed(code: [u8; 4]) -> Result<ResolveOutcome, LookupError> {
        Ok(ResolveOutcome::Listed(Ipv4Addr::from(code)))
    }

    fn ips(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    async fn orchestrator(
        resolver: ScriptedResolver,
        config: BatchConfig,
    ) -> (BatchOrchestrator, Arc<ResultStore>) {
        let dnsbl = DnsblConfig {
            backoff_base_ms: 1,
            ..DnsblConfig::default()
        };
        let client = Arc::new(DnsblClient::with_resolver(dnsbl, Arc::new(resolver)));
        let store = Arc::new(ResultStore::open_in_memory().await.unwrap());
        (
            BatchOrchestrator::new(client, store.clone(), config),
            store,
        )
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_order() {
        let resolver = ScriptedResolver::new()
            .script(&query("192.0.2.1"), vec![listed([127, 0, 0, 2])])
            .script(
                &query("192.0.2.2"),
                vec![Err(LookupError::Resolver("SERVFAIL".to_string()))],
            )
            .script(&query("192.0.2.3"), vec![Ok(ResolveOutcome::NotFound)]);
        let (batch, store) = orchestrator(resolver, BatchConfig::default()).await;

        let results = batch
            .lookup_and_cache_all(
                &ips(&["192.0.2.1", "192.0.2.2", "192.0.2.3"]),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].ip_address, "192.0.2.1");
        assert_eq!(results[0].response_code, "127.0.0.2");
        assert_eq!(results[1].ip_address, "192.0.2.2");
        assert_eq!(results[1].response_code, "Error: resolver error: SERVFAIL");
        assert!(is_error_record(&results[1]));
        assert_eq!(results[2].ip_address, "192.0.2.3");
        assert_eq!(results[2].response_code, "NXDOMAIN");

        assert_eq!(store.count().await.unwrap(), 2);
        assert!(store.get("192.0.2.2").await.unwrap().is_none());
        assert_eq!(
            store.get("192.0.2.1").await.unwrap().unwrap(),
            results[0]
        );
    }

    #[tokio::test]
    async fn test_order_matches_input() {
        let addresses: Vec<String> = (1..=20).map(|i| format!("198.51.100.{i}")).collect();
        let resolver = addresses.iter().fold(
            ScriptedResolver::new().with_latency(Duration::from_millis(5)),
            |resolver, ip| {
                let last = ip.rsplit('.').next().unwrap().parse::<u8>().unwrap();
                resolver.script(&query(ip), vec![listed([127, 0, 0, last])])
            },
        );
        let (batch, store) = orchestrator(resolver, BatchConfig::default()).await;

        let results = batch
            .lookup_and_cache_all(&addresses, &CancellationToken::new())
            .await;

        for (ip, record) in addresses.iter().zip(&results) {
            let last = ip.rsplit('.').next().unwrap();
            assert_eq!(&record.ip_address, ip);
            assert_eq!(record.response_code, format!("127.0.0.{last}"));
        }
        assert_eq!(store.count().await.unwrap(), 20);
    }

    #[tokio::test]
    async fn test_non_determinative_not_stored() {
        let resolver = ScriptedResolver::new().script(
            &query("203.0.113.9"),
            vec![Ok(ResolveOutcome::Listed(NON_DETERMINATIVE)); 5],
        );
        let (batch, store) = orchestrator(resolver, BatchConfig::default()).await;

        let results = batch
            .lookup_and_cache_all(&ips(&["203.0.113.9"]), &CancellationToken::new())
            .await;

        assert_eq!(
            results[0].response_code,
            "Error: received non-determinative response after 5 attempts"
        );
        assert!(store.get("203.0.113.9").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalid_address_reported_per_item() {
        let resolver =
            ScriptedResolver::new().script(&query("192.0.2.10"), vec![listed([127, 0, 0, 4])]);
        let (batch, store) = orchestrator(resolver, BatchConfig::default()).await;

        let results = batch
            .lookup_and_cache_all(&ips(&["bogus", "192.0.2.10"]), &CancellationToken::new())
            .await;

        assert_eq!(results[0].response_code, "Error: invalid IPv4 address 'bogus'");
        assert_eq!(results[1].response_code, "127.0.0.4");
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_padded_address_rejected() {
        let resolver =
            ScriptedResolver::new().script(&query("192.0.2.1"), vec![listed([127, 0, 0, 2])]);
        let (batch, store) = orchestrator(resolver, BatchConfig::default()).await;

        let results = batch
            .lookup_and_cache_all(&ips(&[" 192.0.2.1 "]), &CancellationToken::new())
            .await;

        assert_eq!(
            results[0].response_code,
            "Error: invalid IPv4 address ' 192.0.2.1 '"
        );
        assert_eq!(store.count().await.unwrap(), 0);
        assert!(store.get("192.0.2.1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_store_failure_reported_per_item() {
        let resolver =
            ScriptedResolver::new().script(&query("192.0.2.20"), vec![listed([127, 0, 0, 2])]);
        let (batch, store) = orchestrator(resolver, BatchConfig::default()).await;
        store.close().await.unwrap();

        let results = batch
            .lookup_and_cache_all(&ips(&["192.0.2.20"]), &CancellationToken::new())
            .await;

        assert_eq!(results[0].response_code, "Error updating: store is closed");
    }

    #[tokio::test]
    async fn test_cancellation() {
        let resolver = ScriptedResolver::new()
            .with_latency(Duration::from_secs(30))
            .script(&query("192.0.2.30"), vec![listed([127, 0, 0, 2])])
            .script(&query("192.0.2.31"), vec![listed([127, 0, 0, 2])]);
        let (batch, store) = orchestrator(resolver, BatchConfig::default()).await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let results = batch
            .lookup_and_cache_all(&ips(&["192.0.2.30", "192.0.2.31"]), &cancel)
            .await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(results.len(), 2);
        for record in &results {
            assert_eq!(record.response_code, "Error: lookup cancelled");
        }
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_batch_deadline() {
        let resolver = ScriptedResolver::new()
            .with_latency(Duration::from_secs(30))
            .script(&query("192.0.2.40"), vec![listed([127, 0, 0, 2])]);
        let config = BatchConfig {
            timeout_ms: Some(20),
            ..BatchConfig::default()
        };
        let (batch, _store) = orchestrator(resolver, config).await;

        let cancel = CancellationToken::new();
        let results = batch
            .lookup_and_cache_all(&ips(&["192.0.2.40"]), &cancel)
            .await;

        assert_eq!(results[0].response_code, "Error: lookup cancelled");
        // The deadline only cancels the batch's own token.
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_batch_size_limit() {
        let resolver = ScriptedResolver::new()
            .script(&query("192.0.2.50"), vec![listed([127, 0, 0, 2])])
            .script(&query("192.0.2.51"), vec![listed([127, 0, 0, 3])]);
        let config = BatchConfig {
            max_addresses: 1,
            ..BatchConfig::default()
        };
        let (batch, store) = orchestrator(resolver, config).await;

        let results = batch
            .lookup_and_cache_all(&ips(&["192.0.2.50", "192.0.2.51"]), &CancellationToken::new())
            .await;

        assert_eq!(results[0].response_code, "127.0.0.2");
        assert_eq!(results[1].response_code, "Error: batch size limit exceeded");
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cached() {
        let resolver =
            ScriptedResolver::new().script(&query("192.0.2.60"), vec![listed([127, 0, 0, 10])]);
        let (batch, _store) = orchestrator(resolver, BatchConfig::default()).await;

        assert!(batch.cached("192.0.2.60").await.unwrap().is_none());

        batch
            .lookup_and_cache_all(&ips(&["192.0.2.60"]), &CancellationToken::new())
            .await;

        let cached = batch.cached("192.0.2.60").await.unwrap().unwrap();
        assert_eq!(cached.response_code, "127.0.0.10");
        assert!(batch.cached("").await.is_err());
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let (batch, _store) = orchestrator(ScriptedResolver::new(), BatchConfig::default()).await;
        let results = batch
            .lookup_and_cache_all(&[], &CancellationToken::new())
            .await;
        assert!(results.is_empty());
    }
}
