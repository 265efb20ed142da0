//! Upstream providers: pluggable clients that turn a wire-format query into
//! a wire-format response. `doh` and `system` are the two required
//! built-ins; `selector` coordinates ordered fallback between however many
//! a configuration installs.

pub mod doh;
pub mod selector;
pub mod system;

pub use doh::{DohProvider, DohVariant};
pub use selector::ProviderSelector;
pub use system::SystemProvider;

use crate::error::Result;
use async_trait::async_trait;

/// A single upstream resolver: exposes exactly `resolve(queryBytes) ->
/// responseBytes` plus a stable `name`. Implementations must not mutate
/// process-wide state beyond a rate-limit/back-off counter they own.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;
    async fn resolve(&self, query_bytes: &[u8]) -> Result<Vec<u8>>;
}

/// Per-provider counters. `failures <= total_queries` is maintained by the
/// selector, never by the provider itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProviderStats {
    pub total_queries: u64,
    pub hourly_queries: u64,
    pub failures: u64,
    pub last_query_at: i64,
    pub last_hour_reset_at: i64,
}
