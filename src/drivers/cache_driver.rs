//! The `cache` driver role: a keyed store of `CachedResponse` with
//! `{memory, file, sql}` backends. Expiry-gating (a cache row whose
//! expiresAt <= now must not be returned as a hit) lives here, once, so
//! every backend gets it for free. The cache engine in `crate::cache`
//! layers single-flight and TTL-clamp semantics on
//! top, it never has to re-check expiry itself.

use crate::dns::Packet;
use crate::error::{ProxyError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// A cached response. `packet` is kept as wire bytes rather than the
/// parsed `Packet` so the value is trivially `Serialize`/bincode-able for
/// the file/sql backends; callers decode on demand via `packet()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedResponse {
    pub packet_bytes: Vec<u8>,
    pub cached_at: i64,
    pub ttl_seconds: u32,
    pub expires_at: i64,
}

impl CachedResponse {
    pub fn new(packet: &Packet, ttl_seconds: u32, now_ms: i64) -> Self {
        CachedResponse {
            packet_bytes: packet.encode(),
            cached_at: now_ms,
            ttl_seconds,
            expires_at: now_ms + ttl_seconds as i64 * 1000,
        }
    }

    pub fn packet(&self) -> Result<Packet> {
        Packet::decode(&self.packet_bytes)
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at <= now_ms
    }

    pub fn remaining_ttl_secs(&self, now_ms: i64) -> u32 {
        ((self.expires_at - now_ms).max(0) / 1000) as u32
    }
}

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[async_trait]
pub trait CacheDriver: Send + Sync {
    /// Expiry-gated read: a row whose `expires_at` has passed must not be
    /// returned as a hit.
    async fn get(&self, key: &str) -> Result<Option<CachedResponse>>;
    async fn set(&self, key: String, value: CachedResponse) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
    async fn clear(&self) -> Result<()>;
    async fn import(&self, entries: Vec<(String, CachedResponse)>) -> Result<usize>;
    async fn export(&self) -> Result<Vec<(String, CachedResponse)>>;
}

pub struct MemoryCacheDriver {
    entries: DashMap<String, CachedResponse>,
}

impl MemoryCacheDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
        })
    }
}

#[async_trait]
impl CacheDriver for MemoryCacheDriver {
    async fn get(&self, key: &str) -> Result<Option<CachedResponse>> {
        let now = now_ms();
        match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => Ok(Some(entry.clone())),
            Some(_) => {
                self.entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: String, value: CachedResponse) -> Result<()> {
        self.entries.insert(key, value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.entries.clear();
        Ok(())
    }

    async fn import(&self, entries: Vec<(String, CachedResponse)>) -> Result<usize> {
        let count = entries.len();
        for (k, v) in entries {
            self.entries.insert(k, v);
        }
        Ok(count)
    }

    async fn export(&self) -> Result<Vec<(String, CachedResponse)>> {
        Ok(self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect())
    }
}

/// Persists the whole map to a single bincode file on every mutation. Simple
/// and sufficient for the cache sizes a local resolver sees; a busier
/// deployment would reach for the `sql` backend instead.
pub struct FileCacheDriver {
    path: PathBuf,
    memory: Arc<MemoryCacheDriver>,
}

impl FileCacheDriver {
    pub async fn open(path: PathBuf) -> Result<Arc<Self>> {
        let memory = MemoryCacheDriver::new();
        if let Ok(bytes) = tokio::fs::read(&path).await {
            if let Ok((entries, _)) = bincode::serde::decode_from_slice::<
                Vec<(String, CachedResponse)>,
                _,
            >(&bytes, bincode::config::standard())
            {
                memory.import(entries).await?;
            }
        }
        Ok(Arc::new(Self { path, memory }))
    }

    async fn persist(&self) -> Result<()> {
        let entries = self.memory.export().await?;
        let bytes = bincode::serde::encode_to_vec(&entries, bincode::config::standard())
            .map_err(|e| ProxyError::Serialize(e.to_string()))?;
        tokio::fs::write(&self.path, bytes).await.map_err(ProxyError::Io)
    }
}

#[async_trait]
impl CacheDriver for FileCacheDriver {
    async fn get(&self, key: &str) -> Result<Option<CachedResponse>> {
        self.memory.get(key).await
    }

    async fn set(&self, key: String, value: CachedResponse) -> Result<()> {
        self.memory.set(key, value).await?;
        self.persist().await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.memory.remove(key).await?;
        self.persist().await
    }

    async fn clear(&self) -> Result<()> {
        self.memory.clear().await?;
        self.persist().await
    }

    async fn import(&self, entries: Vec<(String, CachedResponse)>) -> Result<usize> {
        let count = self.memory.import(entries).await?;
        self.persist().await?;
        Ok(count)
    }

    async fn export(&self) -> Result<Vec<(String, CachedResponse)>> {
        self.memory.export().await
    }
}

/// SQLite-backed cache driver: the SQL database file backing any
/// SQL-backed driver role.
pub struct SqlCacheDriver {
    pool: SqlitePool,
}

impl SqlCacheDriver {
    pub async fn open(database_url: &str) -> Result<Arc<Self>> {
        let pool = SqlitePool::connect(database_url)
            .await
            .map_err(|e| ProxyError::Serialize(e.to_string()))?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS cache_entries (
                key TEXT PRIMARY KEY,
                packet_bytes BLOB NOT NULL,
                cached_at INTEGER NOT NULL,
                ttl_seconds INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            )",
        )
        .execute(&pool)
        .await
        .map_err(|e| ProxyError::Serialize(e.to_string()))?;
        Ok(Arc::new(Self { pool }))
    }
}

#[async_trait]
impl CacheDriver for SqlCacheDriver {
    async fn get(&self, key: &str) -> Result<Option<CachedResponse>> {
        let row = sqlx::query_as::<_, (Vec<u8>, i64, i64, i64)>(
            "SELECT packet_bytes, cached_at, ttl_seconds, expires_at FROM cache_entries WHERE key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ProxyError::CacheReadFailure(e.to_string()))?;

        match row {
            Some((packet_bytes, cached_at, ttl_seconds, expires_at)) => {
                let entry = CachedResponse {
                    packet_bytes,
                    cached_at,
                    ttl_seconds: ttl_seconds as u32,
                    expires_at,
                };
                if entry.is_expired(now_ms()) {
                    self.remove(key).await?;
                    Ok(None)
                } else {
                    Ok(Some(entry))
                }
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: String, value: CachedResponse) -> Result<()> {
        sqlx::query(
            "INSERT INTO cache_entries (key, packet_bytes, cached_at, ttl_seconds, expires_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET
                packet_bytes = excluded.packet_bytes,
                cached_at = excluded.cached_at,
                ttl_seconds = excluded.ttl_seconds,
                expires_at = excluded.expires_at",
        )
        .bind(key)
        .bind(value.packet_bytes)
        .bind(value.cached_at)
        .bind(value.ttl_seconds as i64)
        .bind(value.expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| ProxyError::CacheWriteFailure(e.to_string()))?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM cache_entries WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| ProxyError::CacheWriteFailure(e.to_string()))?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM cache_entries")
            .execute(&self.pool)
            .await
            .map_err(|e| ProxyError::CacheWriteFailure(e.to_string()))?;
        Ok(())
    }

    async fn import(&self, entries: Vec<(String, CachedResponse)>) -> Result<usize> {
        let count = entries.len();
        for (key, value) in entries {
            self.set(key, value).await?;
        }
        Ok(count)
    }

    async fn export(&self) -> Result<Vec<(String, CachedResponse)>> {
        let rows = sqlx::query_as::<_, (String, Vec<u8>, i64, i64, i64)>(
            "SELECT key, packet_bytes, cached_at, ttl_seconds, expires_at FROM cache_entries",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ProxyError::CacheReadFailure(e.to_string()))?;
        Ok(rows
            .into_iter()
            .map(|(key, packet_bytes, cached_at, ttl_seconds, expires_at)| {
                (
                    key,
                    CachedResponse {
                        packet_bytes,
                        cached_at,
                        ttl_seconds: ttl_seconds as u32,
                        expires_at,
                    },
                )
            })
            .collect())
    }
}
