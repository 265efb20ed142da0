//! The cache engine: wraps a `CacheDriver` with single-flight
//! deduplication of concurrent misses and TTL clamping. The driver itself
//! only ever sees expiry-gated reads and plain writes; every other
//! invariant (negative-TTL derivation, the SOA floor/ceiling, dedup) lives
//! here so all three backends get it uniformly.

use crate::constants::{
    MAX_TTL_SECS, MIN_TTL_SECS, NEG_CAP_TTL_SECS, NEG_DEFAULT_TTL_SECS, SINGLE_FLIGHT_WAIT,
};
use crate::dns::{Packet, ResponseCode};
use crate::drivers::cache_driver::{now_ms, CachedResponse};
use crate::drivers::CacheDriver;
use crate::error::Result;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

/// Whether a lookup was served from cache or required a fresh upstream
/// dispatch, surfaced so the resolver pipeline can log/emit the right
/// processing info.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Cache,
    Upstream,
}

/// TTL a positive or negative answer should be cached for: clamp positive
/// answers to `[MIN_TTL_SECS, MAX_TTL_SECS]`; derive negative answers from
/// the SOA minimum, clamped to `[MIN_TTL_SECS, NEG_CAP_TTL_SECS]`, falling
/// back to `NEG_DEFAULT_TTL_SECS` when no SOA record is present.
pub fn effective_ttl(packet: &Packet) -> u32 {
    if packet.is_negative() {
        packet
            .soa_minimum()
            .unwrap_or(NEG_DEFAULT_TTL_SECS)
            .clamp(MIN_TTL_SECS, NEG_CAP_TTL_SECS)
    } else {
        packet
            .min_answer_ttl()
            .unwrap_or(NEG_DEFAULT_TTL_SECS)
            .clamp(MIN_TTL_SECS, MAX_TTL_SECS)
    }
}

pub struct CacheEngine {
    driver: Arc<dyn CacheDriver>,
    inflight: DashMap<String, Arc<Notify>>,
}

impl CacheEngine {
    pub fn new(driver: Arc<dyn CacheDriver>) -> Arc<Self> {
        Arc::new(Self {
            driver,
            inflight: DashMap::new(),
        })
    }

    pub async fn get(&self, key: &str) -> Result<Option<Packet>> {
        match self.driver.get(key).await? {
            Some(entry) => {
                let remaining_ttl = entry.remaining_ttl_secs(now_ms());
                let mut packet = entry.packet()?;
                for answer in &mut packet.answers {
                    answer.ttl = remaining_ttl;
                }
                for authority in &mut packet.authority {
                    authority.ttl = remaining_ttl;
                }
                for additional in &mut packet.additional {
                    additional.ttl = remaining_ttl;
                }
                Ok(Some(packet))
            }
            None => Ok(None),
        }
    }

    pub async fn invalidate(&self, key: &str) -> Result<()> {
        self.driver.remove(key).await
    }

    /// Answer `key` from cache, or run `resolve` exactly once per concurrent
    /// burst of misses: concurrent misses on the same key within the
    /// single-flight window share one upstream dispatch. Waiters that time
    /// out waiting for the in-flight leader fall through
    /// and become the leader themselves rather than returning an error, so
    /// a stuck upstream dispatch never wedges every other waiter.
    pub async fn get_or_resolve<F, Fut>(&self, key: &str, resolve: F) -> Result<(Packet, Origin)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Packet>>,
    {
        if let Some(packet) = self.get(key).await? {
            return Ok((packet, Origin::Cache));
        }

        loop {
            let existing = self.inflight.get(key).map(|e| e.clone());
            match existing {
                Some(notify) => {
                    let _ = tokio::time::timeout(SINGLE_FLIGHT_WAIT, notify.notified()).await;
                    if let Some(packet) = self.get(key).await? {
                        return Ok((packet, Origin::Cache));
                    }
                    debug!(key, "single-flight leader produced no cacheable result, retrying");
                    continue;
                }
                None => {
                    let notify = Arc::new(Notify::new());
                    match self.inflight.entry(key.to_string()) {
                        Entry::Vacant(v) => {
                            v.insert(notify.clone());
                        }
                        Entry::Occupied(_) => continue,
                    }

                    let result = resolve().await;
                    if let Ok(packet) = &result {
                        if packet.header.rcode == ResponseCode::ServFail {
                            debug!(key, "servfail response, not caching");
                        } else {
                            let ttl = effective_ttl(packet);
                            let entry = CachedResponse::new(packet, ttl, now_ms());
                            if let Err(err) = self.driver.set(key.to_string(), entry).await {
                                debug!(key, %err, "failed to persist resolved answer");
                            }
                        }
                    }
                    self.inflight.remove(key);
                    notify.notify_waiters();
                    return result.map(|p| (p, Origin::Upstream));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::{Header, Question, RData, Record, RecordClass, RecordType, ResponseCode};
    use crate::drivers::cache_driver::MemoryCacheDriver;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sample_response(ttl: u32) -> Packet {
        let question = Question::new("example.com", RecordType::A, RecordClass::IN);
        Packet {
            header: Header {
                id: 1,
                qr: true,
                opcode: 0,
                aa: false,
                tc: false,
                rd: true,
                ra: true,
                rcode: ResponseCode::NoError,
                qdcount: 1,
                ancount: 1,
                nscount: 0,
                arcount: 0,
            },
            question,
            answers: vec![Record::new(
                "example.com",
                RecordClass::IN,
                ttl,
                RData::A(Ipv4Addr::new(93, 184, 216, 34)),
            )],
            authority: vec![],
            additional: vec![],
        }
    }

    #[test]
    fn positive_ttl_is_clamped_to_the_ceiling() {
        let packet = sample_response(MAX_TTL_SECS + 1000);
        assert_eq!(effective_ttl(&packet), MAX_TTL_SECS);
    }

    #[test]
    fn positive_ttl_is_clamped_to_the_floor() {
        let packet = sample_response(0);
        assert_eq!(effective_ttl(&packet), MIN_TTL_SECS);
    }

    #[tokio::test]
    async fn second_miss_reuses_the_cached_answer_without_resolving_again() {
        let engine = CacheEngine::new(MemoryCacheDriver::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let calls2 = calls.clone();
        let (packet, origin) = engine
            .get_or_resolve("example.com:A:IN", || async move {
                calls2.fetch_add(1, Ordering::SeqCst);
                Ok(sample_response(120))
            })
            .await
            .unwrap();
        assert_eq!(origin, Origin::Upstream);
        assert_eq!(packet.question.name, "example.com");

        let calls2 = calls.clone();
        let (_, origin) = engine
            .get_or_resolve("example.com:A:IN", || async move {
                calls2.fetch_add(1, Ordering::SeqCst);
                Ok(sample_response(120))
            })
            .await
            .unwrap();
        assert_eq!(origin, Origin::Cache);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn get_rewrites_record_ttls_to_the_remaining_lifetime() {
        let driver = MemoryCacheDriver::new();
        let packet = sample_response(120);
        let cached_at = now_ms() - 20_000;
        driver
            .set("example.com:A:IN".into(), CachedResponse::new(&packet, 120, cached_at))
            .await
            .unwrap();

        let engine = CacheEngine::new(driver);
        let hit = engine.get("example.com:A:IN").await.unwrap().unwrap();

        let ttl = hit.answers[0].ttl;
        assert!(ttl > 0 && ttl < 120, "expected a decremented TTL, got {ttl}");
    }

    #[tokio::test]
    async fn servfail_upstream_result_is_not_persisted() {
        let driver = MemoryCacheDriver::new();
        let engine = CacheEngine::new(driver.clone());

        let mut servfail = sample_response(120);
        servfail.header.rcode = ResponseCode::ServFail;
        let (_, origin) = engine
            .get_or_resolve("flaky.example:A:IN", || async { Ok(servfail) })
            .await
            .unwrap();
        assert_eq!(origin, Origin::Upstream);

        assert!(driver.get("flaky.example:A:IN").await.unwrap().is_none());
    }
}
