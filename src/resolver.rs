//! The resolver pipeline: the per-query state machine gluing the wire
//! codec, policy matcher, cache engine and provider selector together.
//! `handle` always returns well-formed response bytes: decode failures,
//! policy-driver errors, cache-driver errors and exhausted providers are
//! all absorbed into a DNS-shaped error response rather than propagated
//! to the caller, so a DNS client always receives a syntactically valid
//! response.

use crate::cache::{CacheEngine, Origin};
use crate::dns::{Header, Packet, ResponseCode};
use crate::drivers::logs::{ClientInfo, DnsEventKind, LogEntry, LogLevel, ProcessingInfo};
use crate::drivers::{LogsDriver, PolicyDriver};
use crate::error::ProxyError;
use crate::events::EventBus;
use crate::policy;
use crate::providers::ProviderSelector;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;
use uuid::Uuid;

/// Response shape for a blocked name. Defaults to NXDOMAIN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockMode {
    NxDomain,
    ZeroAddress,
}

/// The four driver-plane roles a pipeline holds, each behind a `RwLock` so
/// the supervisor can swap a backend in place without reconstructing the
/// pipeline or racing an in-flight lookup.
pub struct ResolverPipeline {
    cache: RwLock<Arc<CacheEngine>>,
    denylist: RwLock<Arc<dyn PolicyDriver>>,
    allowlist: RwLock<Arc<dyn PolicyDriver>>,
    allowlist_enabled: AtomicBool,
    selector: Arc<ProviderSelector>,
    logs: RwLock<Arc<dyn LogsDriver>>,
    events: Arc<EventBus>,
    block_mode: BlockMode,
}

impl ResolverPipeline {
    pub fn new(
        cache: Arc<CacheEngine>,
        denylist: Arc<dyn PolicyDriver>,
        allowlist: Arc<dyn PolicyDriver>,
        allowlist_enabled: bool,
        selector: Arc<ProviderSelector>,
        logs: Arc<dyn LogsDriver>,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cache: RwLock::new(cache),
            denylist: RwLock::new(denylist),
            allowlist: RwLock::new(allowlist),
            allowlist_enabled: AtomicBool::new(allowlist_enabled),
            selector,
            logs: RwLock::new(logs),
            events,
            block_mode: BlockMode::NxDomain,
        })
    }

    pub fn set_allowlist_enabled(&self, enabled: bool) {
        self.allowlist_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn swap_cache(&self, cache: Arc<CacheEngine>) {
        *self.cache.write() = cache;
    }

    pub fn swap_denylist(&self, driver: Arc<dyn PolicyDriver>) {
        *self.denylist.write() = driver;
    }

    pub fn swap_allowlist(&self, driver: Arc<dyn PolicyDriver>) {
        *self.allowlist.write() = driver;
    }

    pub fn swap_logs(&self, driver: Arc<dyn LogsDriver>) {
        *self.logs.write() = driver;
    }

    pub fn selector(&self) -> Arc<ProviderSelector> {
        self.selector.clone()
    }

    /// RECEIVED -> ... -> DONE. Never fails: every branch produces encoded
    /// response bytes, even the ones that began with a decode error.
    ///
    /// Everything past the decode step runs under a per-query deadline
    /// (`QUERY_DEADLINE`); a query that blows through it is answered
    /// SERVFAIL and logged as an error rather than left to hang.
    pub async fn handle(&self, query_bytes: &[u8], client: ClientInfo) -> Vec<u8> {
        let received_at = Instant::now();

        let query = match Packet::decode(query_bytes) {
            Ok(q) => q,
            Err(err) => {
                self.emit(
                    DnsEventKind::Error,
                    LogLevel::Error,
                    "<undecodable>",
                    &client,
                    ProcessingInfo {
                        success: false,
                        error: Some(err.to_string()),
                        ..Default::default()
                    },
                )
                .await;
                return format_error_response(query_bytes);
            }
        };

        let name = query.question.name.clone();
        match tokio::time::timeout(
            crate::constants::QUERY_DEADLINE,
            self.resolve_checked(&query, &client, received_at),
        )
        .await
        {
            Ok(bytes) => bytes,
            Err(_) => {
                let processing = ProcessingInfo {
                    success: false,
                    error: Some(ProxyError::QueryDeadlineExceeded.to_string()),
                    response_time_ms: Some(received_at.elapsed().as_millis() as u64),
                    ..Default::default()
                };
                self.emit(DnsEventKind::Error, LogLevel::Error, &name, &client, processing)
                    .await;
                Packet::response_shell(&query, ResponseCode::ServFail).encode()
            }
        }
    }

    /// CHECKED -> MISS/SERVE_CACHED -> UPSTREAM_DONE -> RESPONDED, run under
    /// the caller's per-query deadline.
    async fn resolve_checked(&self, query: &Packet, client: &ClientInfo, received_at: Instant) -> Vec<u8> {
        let name = query.question.name.clone();
        let key = query.question.cache_key();
        let mut processing = ProcessingInfo::default();

        // PARSED -> CHECKED: allowlist short-circuits denylist.
        let allowlist_enabled = self.allowlist_enabled.load(Ordering::Relaxed);
        let mut whitelisted = false;
        let mut blocked = false;

        if allowlist_enabled {
            let allowlist = self.allowlist.read().clone();
            match policy::is_listed(&allowlist, &name).await {
                Ok(true) => whitelisted = true,
                Ok(false) => {}
                Err(err) => self.log_policy_driver_failure(&err),
            }
        }

        if !whitelisted {
            let denylist = self.denylist.read().clone();
            match policy::is_listed(&denylist, &name).await {
                Ok(true) => blocked = true,
                Ok(false) => {}
                Err(err) => self.log_policy_driver_failure(&err),
            }
        }

        processing.whitelisted = whitelisted;
        processing.blocked = blocked;

        if blocked {
            let response = self.synthesize_block(query);
            processing.success = true;
            processing.response_time_ms = Some(received_at.elapsed().as_millis() as u64);
            self.emit(DnsEventKind::Response, LogLevel::Info, &name, client, processing)
                .await;
            return response.encode();
        }

        // CHECKED -> MISS/SERVE_CACHED -> UPSTREAM_DONE.
        let cache = self.cache.read().clone();
        let result = cache
            .get_or_resolve(&key, || async { self.selector.resolve(query).await })
            .await;

        let response = match result {
            Ok((mut response, origin)) => {
                response.reassign_id(query.header.id);
                processing.cached = origin == Origin::Cache;
                processing.success = true;
                response
            }
            Err(err) => {
                processing.success = false;
                processing.error = Some(err.to_string());
                if matches!(err, ProxyError::AllProvidersFailed) {
                    warn!(question = %name, "all upstream providers failed");
                }
                Packet::response_shell(query, ResponseCode::ServFail)
            }
        };

        processing.response_time_ms = Some(received_at.elapsed().as_millis() as u64);
        let (event, level) = if processing.success {
            (DnsEventKind::Response, LogLevel::Info)
        } else {
            (DnsEventKind::Error, LogLevel::Error)
        };
        self.emit(event, level, &name, client, processing).await;
        response.encode()
    }

    fn synthesize_block(&self, query: &Packet) -> Packet {
        match self.block_mode {
            BlockMode::NxDomain => Packet::response_shell(query, ResponseCode::NxDomain),
            BlockMode::ZeroAddress => {
                let mut response = Packet::response_shell(query, ResponseCode::NoError);
                response.answers.push(crate::dns::Record::new(
                    &query.question.name,
                    crate::dns::RecordClass::IN,
                    crate::constants::NEG_DEFAULT_TTL_SECS,
                    crate::dns::RData::A(std::net::Ipv4Addr::UNSPECIFIED),
                ));
                response
            }
        }
    }

    /// Fail-open on a policy-driver error: treat as no match and continue,
    /// only logging a warning.
    fn log_policy_driver_failure(&self, err: &ProxyError) {
        warn!(%err, "policy driver failure, treating as no-match");
    }

    async fn emit(
        &self,
        event: DnsEventKind,
        level: LogLevel,
        question: &str,
        client: &ClientInfo,
        processing: ProcessingInfo,
    ) {
        let entry = LogEntry::Dns {
            id: Uuid::new_v4().to_string(),
            timestamp: crate::drivers::cache_driver::now_ms(),
            event,
            level,
            question: question.to_string(),
            client: client.clone(),
            processing,
        };
        let logs = self.logs.read().clone();
        if let Err(err) = logs.append(entry.clone()).await {
            warn!(%err, "logs driver failure, falling back to console");
        }
        self.events.publish_log(entry);
    }
}

/// Best-effort FORMERR response for input that failed to decode at all.
/// The question section can't be echoed back since it was never
/// successfully parsed, so
/// this responds with `qdcount = 0` rather than routing through
/// `Packet::encode`, which always assumes exactly one question.
fn format_error_response(query_bytes: &[u8]) -> Vec<u8> {
    let id = if query_bytes.len() >= 2 {
        u16::from_be_bytes([query_bytes[0], query_bytes[1]])
    } else {
        0
    };
    let header = Header {
        id,
        qr: true,
        opcode: 0,
        aa: false,
        tc: false,
        rd: false,
        ra: true,
        rcode: ResponseCode::FormErr,
        qdcount: 0,
        ancount: 0,
        nscount: 0,
        arcount: 0,
    };
    let mut out = Vec::with_capacity(Header::WIRE_LEN);
    header.write(&mut out);
    out
}
