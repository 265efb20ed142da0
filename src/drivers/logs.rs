//! The `logs` driver role: an append-only stream of `LogEntry`
//! values with `{console, memory, file}` backends.

use crate::error::{ProxyError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DnsEventKind {
    Request,
    Response,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Udp,
    Tcp,
    Doh,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub addr: String,
    pub port: u16,
    pub transport: Transport,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessingInfo {
    pub provider: Option<String>,
    pub response_time_ms: Option<u64>,
    pub cached: bool,
    pub blocked: bool,
    pub whitelisted: bool,
    pub success: bool,
    pub error: Option<String>,
}

/// A log entry: a tagged variant of two shapes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogEntry {
    Dns {
        id: String,
        timestamp: i64,
        event: DnsEventKind,
        level: LogLevel,
        question: String,
        client: ClientInfo,
        processing: ProcessingInfo,
    },
    ServerEvent {
        id: String,
        timestamp: i64,
        level: LogLevel,
        event_type: ServerEventType,
        message: String,
        port: Option<u16>,
        error: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerEventType {
    Started,
    Stopped,
    Crashed,
}

impl LogEntry {
    pub fn timestamp(&self) -> i64 {
        match self {
            LogEntry::Dns { timestamp, .. } => *timestamp,
            LogEntry::ServerEvent { timestamp, .. } => *timestamp,
        }
    }

    pub fn level(&self) -> LogLevel {
        match self {
            LogEntry::Dns { level, .. } => *level,
            LogEntry::ServerEvent { level, .. } => *level,
        }
    }
}

/// Filter accepted by `LogsDriver::get`: `{kind, level, domain, provider,
/// success, limit}`.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub kind: Option<String>,
    pub level: Option<LogLevel>,
    pub domain: Option<String>,
    pub provider: Option<String>,
    pub success: Option<bool>,
    pub limit: Option<usize>,
}

impl LogFilter {
    fn matches(&self, entry: &LogEntry) -> bool {
        if let Some(level) = self.level {
            if entry.level() != level {
                return false;
            }
        }
        match entry {
            LogEntry::Dns {
                event,
                question,
                processing,
                ..
            } => {
                if let Some(kind) = &self.kind {
                    let matches_kind = matches!(
                        (kind.as_str(), event),
                        ("request", DnsEventKind::Request)
                            | ("response", DnsEventKind::Response)
                            | ("error", DnsEventKind::Error)
                    );
                    if !matches_kind {
                        return false;
                    }
                }
                if let Some(domain) = &self.domain {
                    if !question.contains(domain.as_str()) {
                        return false;
                    }
                }
                if let Some(provider) = &self.provider {
                    if processing.provider.as_deref() != Some(provider.as_str()) {
                        return false;
                    }
                }
                if let Some(success) = self.success {
                    if processing.success != success {
                        return false;
                    }
                }
                true
            }
            LogEntry::ServerEvent { .. } => {
                self.domain.is_none() && self.provider.is_none() && self.success.is_none()
            }
        }
    }
}

#[async_trait]
pub trait LogsDriver: Send + Sync {
    async fn append(&self, entry: LogEntry) -> Result<()>;
    async fn get(&self, filter: LogFilter) -> Result<Vec<LogEntry>>;
    async fn clear(&self) -> Result<()>;
    async fn import(&self, entries: Vec<LogEntry>) -> Result<usize>;
    async fn export(&self) -> Result<Vec<LogEntry>>;
}

/// Forwards every entry straight to `tracing`, keeping nothing in memory.
/// Used as the failure-fallback sink: when the primary log write fails,
/// the entry is logged to this secondary console sink instead, and as a
/// selectable backend in its own right.
pub struct ConsoleLogsDriver;

#[async_trait]
impl LogsDriver for ConsoleLogsDriver {
    async fn append(&self, entry: LogEntry) -> Result<()> {
        match (&entry, entry.level()) {
            (LogEntry::Dns { question, .. }, LogLevel::Error) => error!(%question, "dns event"),
            (LogEntry::Dns { question, .. }, LogLevel::Warn) => warn!(%question, "dns event"),
            (LogEntry::Dns { question, .. }, LogLevel::Info) => info!(%question, "dns event"),
            (LogEntry::Dns { question, .. }, LogLevel::Debug) => debug!(%question, "dns event"),
            (LogEntry::ServerEvent { message, .. }, LogLevel::Error) => error!(%message, "server event"),
            (LogEntry::ServerEvent { message, .. }, LogLevel::Warn) => warn!(%message, "server event"),
            (LogEntry::ServerEvent { message, .. }, _) => info!(%message, "server event"),
        }
        Ok(())
    }

    async fn get(&self, _filter: LogFilter) -> Result<Vec<LogEntry>> {
        Ok(Vec::new())
    }

    async fn clear(&self) -> Result<()> {
        Ok(())
    }

    async fn import(&self, _entries: Vec<LogEntry>) -> Result<usize> {
        Ok(0)
    }

    async fn export(&self) -> Result<Vec<LogEntry>> {
        Ok(Vec::new())
    }
}

/// A bounded in-memory ring buffer of the most recent entries.
pub struct MemoryLogsDriver {
    capacity: usize,
    entries: Mutex<VecDeque<LogEntry>>,
}

impl MemoryLogsDriver {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        })
    }
}

#[async_trait]
impl LogsDriver for MemoryLogsDriver {
    async fn append(&self, entry: LogEntry) -> Result<()> {
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
        Ok(())
    }

    async fn get(&self, filter: LogFilter) -> Result<Vec<LogEntry>> {
        let entries = self.entries.lock();
        let mut out: Vec<LogEntry> = entries
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    async fn clear(&self) -> Result<()> {
        self.entries.lock().clear();
        Ok(())
    }

    async fn import(&self, new_entries: Vec<LogEntry>) -> Result<usize> {
        let count = new_entries.len();
        let mut entries = self.entries.lock();
        for entry in new_entries {
            if entries.len() >= self.capacity {
                entries.pop_front();
            }
            entries.push_back(entry);
        }
        Ok(count)
    }

    async fn export(&self) -> Result<Vec<LogEntry>> {
        Ok(self.entries.lock().iter().cloned().collect())
    }
}

/// Appends newline-delimited JSON to a file, with an in-memory tail kept
/// for fast `get`/`export`.
pub struct FileLogsDriver {
    path: PathBuf,
    memory: Arc<MemoryLogsDriver>,
}

impl FileLogsDriver {
    pub async fn open(path: PathBuf, capacity: usize) -> Result<Arc<Self>> {
        let memory = MemoryLogsDriver::new(capacity);
        if let Ok(contents) = tokio::fs::read_to_string(&path).await {
            let mut entries = Vec::new();
            for line in contents.lines() {
                if let Ok(entry) = serde_json::from_str::<LogEntry>(line) {
                    entries.push(entry);
                }
            }
            memory.import(entries).await?;
        }
        Ok(Arc::new(Self { path, memory }))
    }
}

#[async_trait]
impl LogsDriver for FileLogsDriver {
    async fn append(&self, entry: LogEntry) -> Result<()> {
        let line = serde_json::to_string(&entry)? + "\n";
        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(ProxyError::Io)?;
        file.write_all(line.as_bytes()).await.map_err(ProxyError::Io)?;
        self.memory.append(entry).await
    }

    async fn get(&self, filter: LogFilter) -> Result<Vec<LogEntry>> {
        self.memory.get(filter).await
    }

    async fn clear(&self) -> Result<()> {
        tokio::fs::write(&self.path, b"").await.map_err(ProxyError::Io)?;
        self.memory.clear().await
    }

    async fn import(&self, entries: Vec<LogEntry>) -> Result<usize> {
        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(ProxyError::Io)?;
        for entry in &entries {
            let line = serde_json::to_string(entry)? + "\n";
            file.write_all(line.as_bytes()).await.map_err(ProxyError::Io)?;
        }
        self.memory.import(entries).await
    }

    async fn export(&self) -> Result<Vec<LogEntry>> {
        self.memory.export().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> LogEntry {
        LogEntry::Dns {
            id: "1".into(),
            timestamp: 0,
            event: DnsEventKind::Response,
            level: LogLevel::Info,
            question: "example.com".into(),
            client: ClientInfo {
                addr: "127.0.0.1".into(),
                port: 5353,
                transport: Transport::Udp,
            },
            processing: ProcessingInfo {
                success: true,
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn memory_driver_evicts_oldest_past_capacity() {
        let driver = MemoryLogsDriver::new(2);
        driver.append(sample()).await.unwrap();
        driver.append(sample()).await.unwrap();
        driver.append(sample()).await.unwrap();
        let all = driver.export().await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn export_then_clear_then_import_restores_state() {
        let driver = MemoryLogsDriver::new(10);
        driver.append(sample()).await.unwrap();
        driver.append(sample()).await.unwrap();
        let exported = driver.export().await.unwrap();
        driver.clear().await.unwrap();
        assert!(driver.export().await.unwrap().is_empty());
        let imported = driver.import(exported.clone()).await.unwrap();
        assert_eq!(imported, exported.len());
        assert_eq!(driver.export().await.unwrap().len(), exported.len());
    }
}
