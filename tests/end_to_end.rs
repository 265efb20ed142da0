//! End-to-end resolver pipeline scenarios built from stub providers rather
//! than live upstreams.

use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use warden_dns::cache::CacheEngine;
use warden_dns::dns::{Header, Packet, Question, RData, Record, RecordClass, RecordType, ResponseCode};
use warden_dns::drivers::cache_driver::MemoryCacheDriver;
use warden_dns::drivers::logs::{ClientInfo, MemoryLogsDriver, Transport};
use warden_dns::drivers::policy_driver::MemoryPolicyDriver;
use warden_dns::drivers::PolicyDriver;
use warden_dns::error::{ProxyError, Result as ProxyResult};
use warden_dns::events::{EventBus, EventPayload};
use warden_dns::providers::{Provider, ProviderSelector};
use warden_dns::resolver::ResolverPipeline;

fn client() -> ClientInfo {
    ClientInfo {
        addr: "127.0.0.1".into(),
        port: 5353,
        transport: Transport::Udp,
    }
}

fn query_bytes(id: u16, name: &str) -> Vec<u8> {
    let packet = Packet {
        header: Header {
            id,
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
        question: Question::new(name, RecordType::A, RecordClass::IN),
        answers: vec![],
        authority: vec![],
        additional: vec![],
    };
    packet.encode()
}

struct CountingProvider {
    name: &'static str,
    calls: Arc<AtomicUsize>,
    answer: Ipv4Addr,
    ttl: u32,
}

#[async_trait]
impl Provider for CountingProvider {
    fn name(&self) -> &str {
        self.name
    }

    async fn resolve(&self, query_bytes: &[u8]) -> ProxyResult<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let query = Packet::decode(query_bytes)?;
        let mut response = Packet::response_shell(&query, ResponseCode::NoError);
        response.answers.push(Record::new(
            &query.question.name,
            RecordClass::IN,
            self.ttl,
            RData::A(self.answer),
        ));
        Ok(response.encode())
    }
}

struct ServfailProvider {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Provider for ServfailProvider {
    fn name(&self) -> &str {
        "flaky-upstream"
    }

    async fn resolve(&self, query_bytes: &[u8]) -> ProxyResult<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let query = Packet::decode(query_bytes)?;
        Ok(Packet::response_shell(&query, ResponseCode::ServFail).encode())
    }
}

struct FlakyProvider {
    name: &'static str,
}

#[async_trait]
impl Provider for FlakyProvider {
    fn name(&self) -> &str {
        self.name
    }

    async fn resolve(&self, _query_bytes: &[u8]) -> ProxyResult<Vec<u8>> {
        Err(ProxyError::UpstreamTransport("HTTP 503".into()))
    }
}

fn build_pipeline(selector: Arc<ProviderSelector>, events: Arc<EventBus>) -> Arc<ResolverPipeline> {
    let cache = CacheEngine::new(MemoryCacheDriver::new());
    let denylist = MemoryPolicyDriver::new() as Arc<dyn PolicyDriver>;
    let allowlist = MemoryPolicyDriver::new() as Arc<dyn PolicyDriver>;
    let logs = MemoryLogsDriver::new(64);
    ResolverPipeline::new(cache, denylist, allowlist, false, selector, logs, events)
}

#[tokio::test]
async fn cold_cache_hits_the_primary_provider() {
    let calls = Arc::new(AtomicUsize::new(0));
    let primary = Arc::new(CountingProvider {
        name: "cloudflare",
        calls: calls.clone(),
        answer: Ipv4Addr::new(93, 184, 216, 34),
        ttl: 120,
    });
    let selector = ProviderSelector::new(vec![primary]);
    let pipeline = build_pipeline(selector, Arc::new(EventBus::new()));

    let bytes = query_bytes(0x1234, "example.com");
    let response_bytes = pipeline.handle(&bytes, client()).await;
    let response = Packet::decode(&response_bytes).unwrap();

    assert_eq!(response.header.id, 0x1234);
    assert_eq!(response.header.rcode, ResponseCode::NoError);
    assert_eq!(response.answers.len(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn warm_cache_does_not_redispatch_upstream() {
    let calls = Arc::new(AtomicUsize::new(0));
    let primary = Arc::new(CountingProvider {
        name: "cloudflare",
        calls: calls.clone(),
        answer: Ipv4Addr::new(93, 184, 216, 34),
        ttl: 120,
    });
    let selector = ProviderSelector::new(vec![primary]);
    let pipeline = build_pipeline(selector, Arc::new(EventBus::new()));

    let first = query_bytes(1, "example.com");
    let first_response = pipeline.handle(&first, client()).await;
    assert_eq!(Packet::decode(&first_response).unwrap().answers.len(), 1);

    tokio::time::sleep(Duration::from_millis(1100)).await;

    let second = query_bytes(2, "example.com");
    let second_response_bytes = pipeline.handle(&second, client()).await;
    let second_response = Packet::decode(&second_response_bytes).unwrap();

    assert_eq!(second_response.header.id, 2);
    assert_eq!(second_response.answers.len(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1, "second query must be served from cache");

    let remaining_ttl = second_response.answers[0].ttl;
    assert!(
        remaining_ttl > 0 && remaining_ttl < 120,
        "remaining TTL {remaining_ttl} should be decremented from the original 120"
    );
}

#[tokio::test]
async fn servfail_upstream_response_is_not_cached() {
    let calls = Arc::new(AtomicUsize::new(0));
    let provider = Arc::new(ServfailProvider { calls: calls.clone() });
    let selector = ProviderSelector::new(vec![provider]);
    let pipeline = build_pipeline(selector, Arc::new(EventBus::new()));

    let first = query_bytes(1, "flaky.example");
    let first_response = Packet::decode(&pipeline.handle(&first, client()).await).unwrap();
    assert_eq!(first_response.header.rcode, ResponseCode::ServFail);

    let second = query_bytes(2, "flaky.example");
    let second_response = Packet::decode(&pipeline.handle(&second, client()).await).unwrap();
    assert_eq!(second_response.header.rcode, ResponseCode::ServFail);

    assert_eq!(
        calls.load(Ordering::SeqCst),
        2,
        "a SERVFAIL answer must not be cached, so the second query re-dispatches upstream"
    );
}

#[tokio::test]
async fn primary_failure_falls_over_to_secondary_and_updates_stats() {
    let primary = Arc::new(FlakyProvider { name: "cloudflare" });
    let calls = Arc::new(AtomicUsize::new(0));
    let secondary = Arc::new(CountingProvider {
        name: "google",
        calls: calls.clone(),
        answer: Ipv4Addr::new(8, 8, 8, 8),
        ttl: 300,
    });
    let selector = ProviderSelector::new(vec![primary, secondary]);
    let pipeline = build_pipeline(selector.clone(), Arc::new(EventBus::new()));

    let bytes = query_bytes(7, "example.org");
    let response_bytes = pipeline.handle(&bytes, client()).await;
    let response = Packet::decode(&response_bytes).unwrap();

    assert_eq!(response.header.rcode, ResponseCode::NoError);
    assert_eq!(response.answers[0].rdata, RData::A(Ipv4Addr::new(8, 8, 8, 8)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let stats = selector.stats_snapshot();
    let primary_stats = stats.iter().find(|(name, _)| name == "cloudflare").unwrap().1;
    let secondary_stats = stats.iter().find(|(name, _)| name == "google").unwrap().1;
    assert_eq!(primary_stats.failures, 1);
    assert_eq!(secondary_stats.failures, 0);
    assert!(secondary_stats.failures <= secondary_stats.total_queries);
}

#[tokio::test]
async fn all_upstreams_failing_yields_servfail_and_an_error_log_event() {
    let selector = ProviderSelector::new(vec![
        Arc::new(FlakyProvider { name: "cloudflare" }),
        Arc::new(FlakyProvider { name: "google" }),
    ]);
    let events = Arc::new(EventBus::new());
    let mut subscriber = events.subscribe();
    let pipeline = build_pipeline(selector, events);

    let bytes = query_bytes(99, "example.net");
    let response_bytes = pipeline.handle(&bytes, client()).await;
    let response = Packet::decode(&response_bytes).unwrap();

    assert_eq!(response.header.id, 99);
    assert_eq!(response.header.rcode, ResponseCode::ServFail);

    let published = tokio::time::timeout(Duration::from_secs(1), subscriber.recv())
        .await
        .expect("event bus should publish promptly")
        .expect("event channel should not have closed");

    match published.payload {
        EventPayload::Log(warden_dns::drivers::LogEntry::Dns { processing, .. }) => {
            assert!(!processing.success);
            assert!(processing.error.is_some());
        }
        other => panic!("expected a dns log entry, got {other:?}"),
    }
}

#[tokio::test]
async fn denylisted_domain_short_circuits_without_an_upstream_call() {
    let calls = Arc::new(AtomicUsize::new(0));
    let primary = Arc::new(CountingProvider {
        name: "cloudflare",
        calls: calls.clone(),
        answer: Ipv4Addr::new(1, 1, 1, 1),
        ttl: 60,
    });
    let selector = ProviderSelector::new(vec![primary]);
    let pipeline = build_pipeline(selector, Arc::new(EventBus::new()));

    let denylist = pipeline_denylist(&pipeline);
    denylist
        .add(warden_dns::drivers::policy_driver::PolicyEntry::new("ads.example", 0))
        .await
        .unwrap();

    let bytes = query_bytes(0xABCD, "ads.example");
    let response_bytes = pipeline.handle(&bytes, client()).await;
    let response = Packet::decode(&response_bytes).unwrap();

    assert_eq!(response.header.rcode, ResponseCode::NxDomain);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

// The pipeline keeps its driver fields private behind swap-friendly locks;
// tests reach the denylist the same way the supervisor does, through a swap.
fn pipeline_denylist(pipeline: &Arc<ResolverPipeline>) -> Arc<dyn PolicyDriver> {
    let driver = MemoryPolicyDriver::new() as Arc<dyn PolicyDriver>;
    pipeline.swap_denylist(driver.clone());
    driver
}
