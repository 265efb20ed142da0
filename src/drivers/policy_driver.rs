//! The `denylist`/`allowlist` driver roles: a set of `PolicyEntry` keyed
//! by domain, with `{memory, file, sql}`
//! backends. Both roles share this exact shape; the only difference is
//! which instance the supervisor installs under which role.

use crate::error::{ProxyError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyEntry {
    pub domain: String,
    pub added_at: i64,
    pub source: Option<String>,
    pub reason: Option<String>,
    pub category: Option<String>,
}

impl PolicyEntry {
    pub fn new(domain: impl Into<String>, added_at: i64) -> Self {
        PolicyEntry {
            domain: crate::dns::normalize(&domain.into()),
            added_at,
            source: None,
            reason: None,
            category: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PolicyFilter {
    pub category: Option<String>,
    pub limit: Option<usize>,
    pub offset: usize,
}

#[async_trait]
pub trait PolicyDriver: Send + Sync {
    /// Existence check in O(log n) or better.
    async fn get(&self, domain: &str) -> Result<bool>;
    /// Fails with `AlreadyExists` if the key is present.
    async fn add(&self, entry: PolicyEntry) -> Result<()>;
    async fn remove(&self, domain: &str) -> Result<()>;
    async fn clear(&self) -> Result<()>;
    async fn import(&self, entries: Vec<PolicyEntry>) -> Result<usize>;
    async fn export(&self) -> Result<Vec<PolicyEntry>>;
    async fn list(&self, filter: PolicyFilter) -> Result<Vec<PolicyEntry>>;
}

pub struct MemoryPolicyDriver {
    entries: DashMap<String, PolicyEntry>,
}

impl MemoryPolicyDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
        })
    }
}

#[async_trait]
impl PolicyDriver for MemoryPolicyDriver {
    async fn get(&self, domain: &str) -> Result<bool> {
        Ok(self.entries.contains_key(domain))
    }

    async fn add(&self, entry: PolicyEntry) -> Result<()> {
        if self.entries.contains_key(&entry.domain) {
            return Err(ProxyError::AlreadyExists(entry.domain));
        }
        self.entries.insert(entry.domain.clone(), entry);
        Ok(())
    }

    async fn remove(&self, domain: &str) -> Result<()> {
        self.entries.remove(domain);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.entries.clear();
        Ok(())
    }

    async fn import(&self, entries: Vec<PolicyEntry>) -> Result<usize> {
        let count = entries.len();
        for entry in entries {
            self.entries.insert(entry.domain.clone(), entry);
        }
        Ok(count)
    }

    async fn export(&self) -> Result<Vec<PolicyEntry>> {
        Ok(self.entries.iter().map(|e| e.value().clone()).collect())
    }

    async fn list(&self, filter: PolicyFilter) -> Result<Vec<PolicyEntry>> {
        let mut out: Vec<PolicyEntry> = self
            .entries
            .iter()
            .map(|e| e.value().clone())
            .filter(|e| {
                filter
                    .category
                    .as_ref()
                    .is_none_or(|c| e.category.as_deref() == Some(c.as_str()))
            })
            .collect();
        out.sort_by(|a, b| a.domain.cmp(&b.domain));
        let out = out.into_iter().skip(filter.offset);
        Ok(match filter.limit {
            Some(limit) => out.take(limit).collect(),
            None => out.collect(),
        })
    }
}

/// Newline-delimited domain list on disk, `#`-prefixed lines are comments.
pub struct FilePolicyDriver {
    path: PathBuf,
    memory: Arc<MemoryPolicyDriver>,
}

impl FilePolicyDriver {
    pub async fn open(path: PathBuf) -> Result<Arc<Self>> {
        let memory = MemoryPolicyDriver::new();
        if let Ok(contents) = tokio::fs::read_to_string(&path).await {
            let now = crate::drivers::cache_driver::now_ms();
            let entries: Vec<PolicyEntry> = contents
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(|l| PolicyEntry::new(l, now))
                .collect();
            memory.import(entries).await?;
        }
        Ok(Arc::new(Self { path, memory }))
    }

    async fn persist(&self) -> Result<()> {
        let entries = self.memory.export().await?;
        let mut contents = String::new();
        for entry in entries {
            contents.push_str(&entry.domain);
            contents.push('\n');
        }
        tokio::fs::write(&self.path, contents).await.map_err(ProxyError::Io)
    }
}

#[async_trait]
impl PolicyDriver for FilePolicyDriver {
    async fn get(&self, domain: &str) -> Result<bool> {
        self.memory.get(domain).await
    }

    async fn add(&self, entry: PolicyEntry) -> Result<()> {
        self.memory.add(entry).await?;
        self.persist().await
    }

    async fn remove(&self, domain: &str) -> Result<()> {
        self.memory.remove(domain).await?;
        self.persist().await
    }

    async fn clear(&self) -> Result<()> {
        self.memory.clear().await?;
        self.persist().await
    }

    async fn import(&self, entries: Vec<PolicyEntry>) -> Result<usize> {
        let count = self.memory.import(entries).await?;
        self.persist().await?;
        Ok(count)
    }

    async fn export(&self) -> Result<Vec<PolicyEntry>> {
        self.memory.export().await
    }

    async fn list(&self, filter: PolicyFilter) -> Result<Vec<PolicyEntry>> {
        self.memory.list(filter).await
    }
}

pub struct SqlPolicyDriver {
    pool: SqlitePool,
}

impl SqlPolicyDriver {
    pub async fn open(database_url: &str) -> Result<Arc<Self>> {
        let pool = SqlitePool::connect(database_url)
            .await
            .map_err(|e| ProxyError::Serialize(e.to_string()))?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS policy_entries (
                domain TEXT PRIMARY KEY,
                added_at INTEGER NOT NULL,
                source TEXT,
                reason TEXT,
                category TEXT
            )",
        )
        .execute(&pool)
        .await
        .map_err(|e| ProxyError::Serialize(e.to_string()))?;
        Ok(Arc::new(Self { pool }))
    }

    fn row_to_entry(row: (String, i64, Option<String>, Option<String>, Option<String>)) -> PolicyEntry {
        PolicyEntry {
            domain: row.0,
            added_at: row.1,
            source: row.2,
            reason: row.3,
            category: row.4,
        }
    }
}

#[async_trait]
impl PolicyDriver for SqlPolicyDriver {
    async fn get(&self, domain: &str) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM policy_entries WHERE domain = ?")
            .bind(domain)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| ProxyError::PolicyDriverFailure(e.to_string()))?;
        Ok(row.is_some())
    }

    async fn add(&self, entry: PolicyEntry) -> Result<()> {
        if self.get(&entry.domain).await? {
            return Err(ProxyError::AlreadyExists(entry.domain));
        }
        sqlx::query(
            "INSERT INTO policy_entries (domain, added_at, source, reason, category) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&entry.domain)
        .bind(entry.added_at)
        .bind(&entry.source)
        .bind(&entry.reason)
        .bind(&entry.category)
        .execute(&self.pool)
        .await
        .map_err(|e| ProxyError::PolicyDriverFailure(e.to_string()))?;
        Ok(())
    }

    async fn remove(&self, domain: &str) -> Result<()> {
        sqlx::query("DELETE FROM policy_entries WHERE domain = ?")
            .bind(domain)
            .execute(&self.pool)
            .await
            .map_err(|e| ProxyError::PolicyDriverFailure(e.to_string()))?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM policy_entries")
            .execute(&self.pool)
            .await
            .map_err(|e| ProxyError::PolicyDriverFailure(e.to_string()))?;
        Ok(())
    }

    async fn import(&self, entries: Vec<PolicyEntry>) -> Result<usize> {
        let mut count = 0;
        for entry in entries {
            sqlx::query(
                "INSERT INTO policy_entries (domain, added_at, source, reason, category)
                 VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT(domain) DO UPDATE SET added_at = excluded.added_at",
            )
            .bind(&entry.domain)
            .bind(entry.added_at)
            .bind(&entry.source)
            .bind(&entry.reason)
            .bind(&entry.category)
            .execute(&self.pool)
            .await
            .map_err(|e| ProxyError::PolicyDriverFailure(e.to_string()))?;
            count += 1;
        }
        Ok(count)
    }

    async fn export(&self) -> Result<Vec<PolicyEntry>> {
        let rows: Vec<(String, i64, Option<String>, Option<String>, Option<String>)> =
            sqlx::query_as("SELECT domain, added_at, source, reason, category FROM policy_entries")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| ProxyError::PolicyDriverFailure(e.to_string()))?;
        Ok(rows.into_iter().map(Self::row_to_entry).collect())
    }

    async fn list(&self, filter: PolicyFilter) -> Result<Vec<PolicyEntry>> {
        let mut entries = self.export().await?;
        entries.sort_by(|a, b| a.domain.cmp(&b.domain));
        if let Some(category) = &filter.category {
            entries.retain(|e| e.category.as_deref() == Some(category.as_str()));
        }
        let iter = entries.into_iter().skip(filter.offset);
        Ok(match filter.limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_rejects_duplicate_domain() {
        let driver = MemoryPolicyDriver::new();
        driver.add(PolicyEntry::new("ads.example", 0)).await.unwrap();
        let err = driver.add(PolicyEntry::new("ads.example", 1)).await.unwrap_err();
        assert!(matches!(err, ProxyError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn get_reflects_membership() {
        let driver = MemoryPolicyDriver::new();
        assert!(!driver.get("ads.example").await.unwrap());
        driver.add(PolicyEntry::new("ads.example", 0)).await.unwrap();
        assert!(driver.get("ads.example").await.unwrap());
    }

    #[tokio::test]
    async fn export_clear_import_is_logically_equivalent() {
        let driver = MemoryPolicyDriver::new();
        driver.add(PolicyEntry::new("a.example", 0)).await.unwrap();
        driver.add(PolicyEntry::new("b.example", 0)).await.unwrap();
        let exported = driver.export().await.unwrap();
        driver.clear().await.unwrap();
        driver.import(exported).await.unwrap();
        assert!(driver.get("a.example").await.unwrap());
        assert!(driver.get("b.example").await.unwrap());
    }
}
