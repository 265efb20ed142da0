//! The policy matcher: given a query name, decide whether it is
//! blocked, allowed, or neither. Pure with respect to its `PolicyDriver`
//! inputs: it never mutates a driver, only walks `get()`.

use crate::drivers::PolicyDriver;
use crate::error::Result;
use std::sync::Arc;

/// Ancestor walk is capped at this many labels so a pathological name (or a
/// spoofed, absurdly long one) can't turn a lookup into unbounded work.
const MAX_WALK_DEPTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    Blocked,
}

/// Walk `name` and each of its ancestor domains (`a.b.example.com`,
/// `b.example.com`, `example.com`, `com`) looking for a match in `driver`,
/// stopping at the first hit: a match on any ancestor domain counts as a
/// match on the queried name. Exposed directly so the resolver pipeline
/// can apply its own allowlist-short-circuits-denylist ordering rather
/// than through `classify`'s fixed policy.
pub async fn is_listed(driver: &Arc<dyn PolicyDriver>, name: &str) -> Result<bool> {
    let name = crate::dns::normalize(name);
    matches_any_ancestor(driver, &name).await
}

async fn matches_any_ancestor(driver: &Arc<dyn PolicyDriver>, name: &str) -> Result<bool> {
    let mut candidate = name;
    for _ in 0..MAX_WALK_DEPTH {
        if driver.get(candidate).await? {
            return Ok(true);
        }
        match candidate.split_once('.') {
            Some((_, rest)) if !rest.is_empty() => candidate = rest,
            _ => break,
        }
    }
    Ok(false)
}

/// Classify `name` against the allowlist and denylist drivers. The
/// allowlist takes priority: an allowlisted ancestor overrides a
/// denylisted one regardless of which is the more specific match:
/// allowlist membership always overrides a denylist match.
pub async fn classify(
    name: &str,
    denylist: &Arc<dyn PolicyDriver>,
    allowlist: &Arc<dyn PolicyDriver>,
) -> Result<Verdict> {
    let name = crate::dns::normalize(name);
    if matches_any_ancestor(allowlist, &name).await? {
        return Ok(Verdict::Allowed);
    }
    if matches_any_ancestor(denylist, &name).await? {
        return Ok(Verdict::Blocked);
    }
    Ok(Verdict::Allowed)
}
