//! Default knobs for the resolver. All are plain `const`s so the supervisor
//! and config layer can override them per-instance without touching code.

use std::time::Duration;

/// Default UDP/TCP listen port when the config file omits one.
pub const DEFAULT_PORT: u16 = 5300;

/// Maximum size of a UDP datagram we attempt to parse as a DNS query.
pub const MAX_UDP_PACKET_SIZE: usize = 4096;

/// Length of the TCP DNS length prefix, in bytes (RFC 1035 4.2.2).
pub const TCP_LENGTH_PREFIX_BYTES: usize = 2;

/// Floor/ceiling applied to a positive answer's TTL before it is cached.
pub const MIN_TTL_SECS: u32 = 1;
pub const MAX_TTL_SECS: u32 = 86_400;

/// Negative-caching TTL used when the upstream response carries no SOA
/// minimum to derive one from.
pub const NEG_DEFAULT_TTL_SECS: u32 = 60;
/// Upper bound applied to a SOA-derived negative TTL.
pub const NEG_CAP_TTL_SECS: u32 = 900;

/// Per-attempt upstream timeout.
pub const PROVIDER_TIMEOUT: Duration = Duration::from_secs(5);

/// End-to-end per-query deadline; exceeding it cancels the pipeline and
/// synthesizes a SERVFAIL.
pub const QUERY_DEADLINE: Duration = Duration::from_secs(5);

/// Cap on concurrently in-flight handler tasks.
pub const MAX_CONCURRENT_QUERIES: usize = 1024;

/// Window within which repeated misses on the same key share one upstream
/// dispatch.
pub const SINGLE_FLIGHT_WAIT: Duration = Duration::from_secs(5);

/// Rolling window used to reset per-provider hourly counters.
pub const PROVIDER_HOUR_SECS: i64 = 3600;

/// TTL of the optional "last successful provider" reordering hint.
pub const PROVIDER_HINT_TTL: Duration = Duration::from_secs(300);

/// Grace period the supervisor waits for in-flight handlers to drain on stop.
pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(1);

/// Bounded size of each event-bus subscriber queue.
pub const EVENT_BUS_QUEUE_SIZE: usize = 256;

/// TTL stamped on answers synthesized by the system-resolver provider, which
/// has no TTL of its own to report.
pub const SYSTEM_PROVIDER_DEFAULT_TTL: u32 = 300;
