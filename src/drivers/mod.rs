//! The driver plane: a uniform, swappable backend abstraction
//! for four roles: logs, cache, denylist, allowlist. Each role gets its own
//! trait rather than one `Value`-enum mega-trait: the value shapes genuinely
//! differ (`LogEntry` vs `CachedResponse` vs `PolicyEntry`), and a trait per
//! role lets each backend implement only the operations its role needs
//! while keeping the same `{memory, file, sql, console}` constructor
//! pattern across all four.

pub mod cache_driver;
pub mod logs;
pub mod policy_driver;

pub use cache_driver::{CacheDriver, CachedResponse};
pub use logs::{LogEntry, LogFilter, LogsDriver};
pub use policy_driver::{PolicyDriver, PolicyEntry, PolicyFilter};

/// The four roles a driver can be swapped into at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Logs,
    Cache,
    Denylist,
    Allowlist,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Role::Logs => "logs",
            Role::Cache => "cache",
            Role::Denylist => "denylist",
            Role::Allowlist => "allowlist",
        };
        write!(f, "{s}")
    }
}

/// Backend selection for a given role, as it appears in the configuration
/// file's `drivers: {logs, cache, blacklist, whitelist: {type, options}}`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DriverConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub options: std::collections::HashMap<String, String>,
}

impl DriverConfig {
    pub fn memory() -> Self {
        DriverConfig {
            kind: "memory".into(),
            options: Default::default(),
        }
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }
}
