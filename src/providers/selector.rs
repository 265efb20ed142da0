//! Provider selector: ordered fallback across configured
//! upstreams, with per-provider stats and an optional per-domain
//! "last successful provider" reordering hint.

use super::{Provider, ProviderStats};
use crate::constants::{PROVIDER_HINT_TTL, PROVIDER_HOUR_SECS, PROVIDER_TIMEOUT};
use crate::dns::Packet;
use crate::error::{ProxyError, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

struct SuccessHint {
    provider: String,
    recorded_at: Instant,
}

pub struct ProviderSelector {
    providers: Vec<Arc<dyn Provider>>,
    stats: DashMap<String, Mutex<ProviderStats>>,
    hints: DashMap<String, SuccessHint>,
}

impl ProviderSelector {
    pub fn new(providers: Vec<Arc<dyn Provider>>) -> Arc<Self> {
        let stats = DashMap::new();
        for provider in &providers {
            stats.insert(provider.name().to_string(), Mutex::new(ProviderStats::default()));
        }
        Arc::new(Self {
            providers,
            stats,
            hints: DashMap::new(),
        })
    }

    pub fn stats_snapshot(&self) -> Vec<(String, ProviderStats)> {
        self.stats
            .iter()
            .map(|e| (e.key().clone(), *e.value().lock()))
            .collect()
    }

    fn record_attempt(&self, provider: &str, success: bool) {
        if let Some(entry) = self.stats.get(provider) {
            let mut stats = entry.lock();
            let now = now_unix();
            if now - stats.last_hour_reset_at > PROVIDER_HOUR_SECS {
                stats.hourly_queries = 0;
                stats.last_hour_reset_at = now;
            }
            stats.total_queries += 1;
            stats.hourly_queries += 1;
            stats.last_query_at = now;
            if !success {
                stats.failures += 1;
            }
        }
    }

    /// Ordering for this attempt: the domain's cached successful provider
    /// first (a hint, not a contract), then declaration order.
    fn ordered_providers(&self, domain: &str) -> Vec<Arc<dyn Provider>> {
        let hinted_name = self.hints.get(domain).and_then(|hint| {
            if hint.recorded_at.elapsed() < PROVIDER_HINT_TTL {
                Some(hint.provider.clone())
            } else {
                None
            }
        });

        match hinted_name {
            Some(name) => {
                let mut ordered: Vec<Arc<dyn Provider>> = Vec::with_capacity(self.providers.len());
                ordered.extend(self.providers.iter().filter(|p| p.name() == name).cloned());
                ordered.extend(self.providers.iter().filter(|p| p.name() != name).cloned());
                ordered
            }
            None => self.providers.clone(),
        }
    }

    /// Attempt providers in order until one returns a parseable response.
    /// Returns `AllProvidersFailed` once every provider has been tried; the
    /// resolver pipeline turns that into a SERVFAIL shell.
    pub async fn resolve(&self, query: &Packet) -> Result<Packet> {
        let query_bytes = query.encode();
        let domain = query.question.name.clone();

        for provider in self.ordered_providers(&domain) {
            let attempt = tokio::time::timeout(PROVIDER_TIMEOUT, provider.resolve(&query_bytes)).await;
            let outcome = match attempt {
                Ok(Ok(bytes)) => Packet::decode(&bytes).map_err(|e| {
                    ProxyError::UpstreamParse(format!("{}: {e}", provider.name()))
                }),
                Ok(Err(err)) => Err(err),
                Err(_) => Err(ProxyError::UpstreamTimeout(PROVIDER_TIMEOUT)),
            };

            match outcome {
                Ok(mut response) => {
                    self.record_attempt(provider.name(), true);
                    self.hints.insert(
                        domain.clone(),
                        SuccessHint {
                            provider: provider.name().to_string(),
                            recorded_at: Instant::now(),
                        },
                    );
                    response.reassign_id(query.header.id);
                    return Ok(response);
                }
                Err(err) => {
                    self.record_attempt(provider.name(), false);
                    warn!(provider = provider.name(), %err, "upstream attempt failed");
                }
            }
        }

        debug!(domain, "all configured providers exhausted");
        Err(ProxyError::AllProvidersFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::{Header, Question, RData, Record, RecordClass, RecordType, ResponseCode};
    use async_trait::async_trait;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sample_query() -> Packet {
        Packet {
            header: Header {
                id: 0x1234,
                qr: false,
                opcode: 0,
                aa: false,
                tc: false,
                rd: true,
                ra: false,
                rcode: ResponseCode::NoError,
                qdcount: 1,
                ancount: 0,
                nscount: 0,
                arcount: 0,
            },
            question: Question::new("example.com", RecordType::A, RecordClass::IN),
            answers: vec![],
            authority: vec![],
            additional: vec![],
        }
    }

    struct FailingProvider {
        name: &'static str,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Provider for FailingProvider {
        fn name(&self) -> &str {
            self.name
        }

        async fn resolve(&self, _query_bytes: &[u8]) -> Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ProxyError::UpstreamTransport("boom".into()))
        }
    }

    struct SucceedingProvider {
        name: &'static str,
    }

    #[async_trait]
    impl Provider for SucceedingProvider {
        fn name(&self) -> &str {
            self.name
        }

        async fn resolve(&self, query_bytes: &[u8]) -> Result<Vec<u8>> {
            let query = Packet::decode(query_bytes)?;
            let mut response = Packet::response_shell(&query, ResponseCode::NoError);
            response.answers.push(Record::new(
                &query.question.name,
                RecordClass::IN,
                120,
                RData::A(Ipv4Addr::new(93, 184, 216, 34)),
            ));
            Ok(response.encode())
        }
    }

    #[tokio::test]
    async fn falls_over_to_the_secondary_on_primary_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let primary = Arc::new(FailingProvider {
            name: "primary",
            calls: calls.clone(),
        });
        let secondary = Arc::new(SucceedingProvider { name: "secondary" });
        let selector = ProviderSelector::new(vec![primary, secondary]);

        let response = selector.resolve(&sample_query()).await.unwrap();
        assert_eq!(response.header.id, 0x1234);
        assert_eq!(response.answers.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let stats = selector.stats_snapshot();
        let primary_stats = stats.iter().find(|(name, _)| name == "primary").unwrap().1;
        assert_eq!(primary_stats.failures, 1);
        assert_eq!(primary_stats.total_queries, 1);
    }

    #[tokio::test]
    async fn exhausting_all_providers_reports_all_providers_failed() {
        let calls = Arc::new(AtomicUsize::new(0));
        let provider = Arc::new(FailingProvider {
            name: "only",
            calls,
        });
        let selector = ProviderSelector::new(vec![provider]);
        let err = selector.resolve(&sample_query()).await.unwrap_err();
        assert!(matches!(err, ProxyError::AllProvidersFailed));
    }
}
