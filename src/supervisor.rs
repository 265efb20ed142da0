//! The server supervisor: owns the listener, the driver set and the
//! provider selector; the only component permitted to mutate server-wide
//! lifecycle state.

use crate::cache::CacheEngine;
use crate::config::{SecondaryUpstream, ServerConfiguration};
use crate::constants::STOP_GRACE_PERIOD;
use crate::drivers::cache_driver::{FileCacheDriver, MemoryCacheDriver, SqlCacheDriver};
use crate::drivers::logs::{ConsoleLogsDriver, FileLogsDriver, MemoryLogsDriver};
use crate::drivers::policy_driver::{FilePolicyDriver, MemoryPolicyDriver, SqlPolicyDriver};
use crate::drivers::{CacheDriver, DriverConfig, LogsDriver, PolicyDriver, Role};
use crate::error::{ProxyError, Result};
use crate::events::{Event, EventBus, LifecycleState, Topic};
use crate::listener::Listener;
use crate::providers::{DohProvider, DohVariant, Provider, ProviderSelector, ProviderStats, SystemProvider};
use crate::resolver::ResolverPipeline;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

struct RunningState {
    shutdown_tx: broadcast::Sender<()>,
    udp_handle: tokio::task::JoinHandle<()>,
}

/// Snapshot returned by `Supervisor::status()`.
#[derive(Debug, Clone)]
pub struct ServerStatus {
    pub running: bool,
    pub port: u16,
    pub providers: Vec<String>,
    pub stats: Vec<(String, ProviderStats)>,
}

pub struct Supervisor {
    data_dir: PathBuf,
    config_path: PathBuf,
    config: Mutex<ServerConfiguration>,
    pipeline: Mutex<Option<Arc<ResolverPipeline>>>,
    running: Mutex<Option<RunningState>>,
    is_running: AtomicBool,
    events: Arc<EventBus>,
}

impl Supervisor {
    pub fn new(
        data_dir: PathBuf,
        config_path: PathBuf,
        config: ServerConfiguration,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            data_dir,
            config_path,
            config: Mutex::new(config),
            pipeline: Mutex::new(None),
            running: Mutex::new(None),
            is_running: AtomicBool::new(false),
            events,
        })
    }

    /// Persist the current configuration, refreshing `lastUpdated`.
    async fn persist_config(&self) -> Result<()> {
        let config = self.config.lock().clone();
        config.save(&self.config_path).await
    }

    pub fn events(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    pub fn config(&self) -> ServerConfiguration {
        self.config.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// `{running, port, providers[], stats}`. The stats come straight from
    /// the running pipeline's provider selector, so this reports nothing
    /// when the server is stopped.
    pub fn status(&self) -> ServerStatus {
        let running = self.is_running.load(Ordering::SeqCst);
        let port = self.config.lock().server.port;
        let stats = self
            .pipeline
            .lock()
            .as_ref()
            .map(|pipeline| pipeline.selector().stats_snapshot())
            .unwrap_or_default();
        let providers = stats.iter().map(|(name, _)| name.clone()).collect();
        ServerStatus {
            running,
            port,
            providers,
            stats,
        }
    }

    /// Fails if already running; refuses a privileged-port bind outright
    /// rather than silently picking another port.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(ProxyError::BindFailed("supervisor already running".into()));
        }

        let config = self.config.lock().clone();

        let socket = match Listener::bind_udp(config.server.port).await {
            Ok(socket) => socket,
            Err(ProxyError::PortPrivilegeDenied(port)) => {
                self.events.publish_status(
                    LifecycleState::Crashed,
                    port,
                    vec![],
                    Some(format!(
                        "refusing to bind privileged port {port} without elevated privileges"
                    )),
                );
                return Err(ProxyError::PortPrivilegeDenied(port));
            }
            Err(err) => {
                self.events.publish_status(
                    LifecycleState::Crashed,
                    config.server.port,
                    vec![],
                    Some(err.to_string()),
                );
                return Err(err);
            }
        };

        let logs = build_logs_driver(&self.data_dir, &config.drivers.logs).await?;
        let cache = CacheEngine::new(build_cache_driver(&self.data_dir, &config.drivers.cache).await?);
        let denylist = build_policy_driver(&self.data_dir, Role::Denylist, &config.drivers.blacklist).await?;
        let allowlist = build_policy_driver(&self.data_dir, Role::Allowlist, &config.drivers.whitelist).await?;
        let selector = build_selector(&config)?;

        let pipeline = ResolverPipeline::new(
            cache,
            denylist,
            allowlist,
            config.server.enable_whitelist,
            selector.clone(),
            logs,
            self.events.clone(),
        );

        let listener = Arc::new(Listener::new(pipeline.clone()));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let udp_handle = tokio::spawn(async move {
            listener.serve_udp(socket, shutdown_rx).await;
        });

        *self.pipeline.lock() = Some(pipeline);
        *self.running.lock() = Some(RunningState {
            shutdown_tx,
            udp_handle,
        });
        self.is_running.store(true, Ordering::SeqCst);

        let provider_names: Vec<String> = provider_names(&config);
        self.events
            .publish_status(LifecycleState::Started, config.server.port, provider_names, None);
        info!(port = config.server.port, "server started");
        Ok(())
    }

    /// Close the listener, give in-flight handlers a short grace period,
    /// then publish `stopped`.
    pub async fn stop(self: &Arc<Self>) -> Result<()> {
        let Some(running) = self.running.lock().take() else {
            return Ok(());
        };
        let _ = running.shutdown_tx.send(());
        let _ = tokio::time::timeout(STOP_GRACE_PERIOD, running.udp_handle).await;

        self.pipeline.lock().take();
        self.is_running.store(false, Ordering::SeqCst);

        let port = self.config.lock().server.port;
        self.events.publish_status(LifecycleState::Stopped, port, vec![], None);
        info!("server stopped");
        Ok(())
    }

    pub async fn toggle(self: &Arc<Self>) -> Result<()> {
        if self.is_running.load(Ordering::SeqCst) {
            self.stop().await
        } else {
            self.start().await
        }
    }

    /// Construct the new backend, install it via the pipeline's
    /// lock-guarded pointer, and let the previous `Arc` drop once its last
    /// in-flight clone completes.
    pub async fn swap_driver(&self, role: Role, config: DriverConfig) -> Result<()> {
        let Some(pipeline) = self.pipeline.lock().clone() else {
            return Err(ProxyError::DriverSwapFailed("server is not running".into()));
        };

        match role {
            Role::Logs => {
                let driver = build_logs_driver(&self.data_dir, &config).await?;
                pipeline.swap_logs(driver);
            }
            Role::Cache => {
                let driver = build_cache_driver(&self.data_dir, &config).await?;
                pipeline.swap_cache(CacheEngine::new(driver));
            }
            Role::Denylist => {
                let driver = build_policy_driver(&self.data_dir, role, &config).await?;
                pipeline.swap_denylist(driver);
            }
            Role::Allowlist => {
                let driver = build_policy_driver(&self.data_dir, role, &config).await?;
                pipeline.swap_allowlist(driver);
            }
        }

        {
            let mut current = self.config.lock();
            match role {
                Role::Logs => current.drivers.logs = config,
                Role::Cache => current.drivers.cache = config,
                Role::Denylist => current.drivers.blacklist = config,
                Role::Allowlist => current.drivers.whitelist = config,
            }
        }
        self.persist_config().await?;

        self.events
            .publish_change(topic_for_role(role), &role.to_string(), "*", "driver_swapped");
        Ok(())
    }

    /// Apply live fields in place; changing the port requires a re-bind,
    /// so it forces a stop+start.
    pub async fn update_config(self: &Arc<Self>, new_config: ServerConfiguration) -> Result<()> {
        new_config
            .validate()
            .map_err(ProxyError::Config)?;

        let port_changed = self.config.lock().server.port != new_config.server.port;
        let enable_whitelist = new_config.server.enable_whitelist;

        *self.config.lock() = new_config;
        self.persist_config().await?;

        if port_changed {
            if self.is_running.load(Ordering::SeqCst) {
                self.stop().await?;
                self.start().await?;
            }
        } else if let Some(pipeline) = self.pipeline.lock().clone() {
            pipeline.set_allowlist_enabled(enable_whitelist);
        }

        self.events.publish(Event {
            topic: Topic::DnsInfo,
            timestamp: crate::drivers::cache_driver::now_ms(),
            payload: crate::events::EventPayload::ConfigSnapshot(
                serde_json::to_value(self.config.lock().clone()).unwrap_or(serde_json::Value::Null),
            ),
        });
        Ok(())
    }
}

fn topic_for_role(role: Role) -> Topic {
    match role {
        Role::Logs => Topic::DnsLogEvent,
        Role::Cache => Topic::DnsCache,
        Role::Denylist => Topic::DnsDenylist,
        Role::Allowlist => Topic::DnsAllowlist,
    }
}

fn provider_names(config: &ServerConfiguration) -> Vec<String> {
    let mut names = vec!["cloudflare".to_string()];
    names.push(
        match config.server.secondary_dns {
            SecondaryUpstream::Cloudflare => "cloudflare",
            SecondaryUpstream::Google => "google",
            SecondaryUpstream::Opendns => "opendns",
            SecondaryUpstream::System => "system",
        }
        .to_string(),
    );
    names
}

fn build_selector(config: &ServerConfiguration) -> Result<Arc<ProviderSelector>> {
    let primary: Arc<dyn Provider> = Arc::new(DohProvider::new(DohVariant::Cloudflare, None)?);
    let secondary: Arc<dyn Provider> = match config.server.secondary_dns {
        SecondaryUpstream::Cloudflare => Arc::new(DohProvider::new(DohVariant::Cloudflare, None)?),
        SecondaryUpstream::Google => Arc::new(DohProvider::new(DohVariant::Google, None)?),
        SecondaryUpstream::Opendns => Arc::new(DohProvider::new(DohVariant::OpenDns, None)?),
        SecondaryUpstream::System => Arc::new(SystemProvider::new()),
    };
    let mut providers = vec![primary, secondary];
    if let Some(config_id) = &config.server.nextdns_config_id {
        providers.push(Arc::new(DohProvider::new(DohVariant::NextDns, Some(config_id))?));
    }
    Ok(ProviderSelector::new(providers))
}

async fn build_logs_driver(data_dir: &std::path::Path, config: &DriverConfig) -> Result<Arc<dyn LogsDriver>> {
    match config.kind.as_str() {
        "console" => Ok(Arc::new(ConsoleLogsDriver) as Arc<dyn LogsDriver>),
        "file" => {
            let path = data_dir.join("logs").join("logs.ndjson");
            ensure_parent_dir(&path).await?;
            Ok(FileLogsDriver::open(path, 10_000).await? as Arc<dyn LogsDriver>)
        }
        _ => Ok(MemoryLogsDriver::new(10_000) as Arc<dyn LogsDriver>),
    }
}

async fn build_cache_driver(data_dir: &std::path::Path, config: &DriverConfig) -> Result<Arc<dyn CacheDriver>> {
    match config.kind.as_str() {
        "file" => {
            let path = data_dir.join("dns-cache").join("cache.bin");
            ensure_parent_dir(&path).await?;
            Ok(FileCacheDriver::open(path).await? as Arc<dyn CacheDriver>)
        }
        "sql" => {
            let path = data_dir.join("dns-cache").join("cache.sqlite");
            ensure_parent_dir(&path).await?;
            let url = format!("sqlite://{}?mode=rwc", path.display());
            Ok(SqlCacheDriver::open(&url).await? as Arc<dyn CacheDriver>)
        }
        _ => Ok(MemoryCacheDriver::new() as Arc<dyn CacheDriver>),
    }
}

async fn build_policy_driver(
    data_dir: &std::path::Path,
    role: Role,
    config: &DriverConfig,
) -> Result<Arc<dyn PolicyDriver>> {
    let subdir = match role {
        Role::Denylist => "blacklist",
        Role::Allowlist => "whitelist",
        _ => unreachable!("policy driver requested for a non-policy role"),
    };
    match config.kind.as_str() {
        "file" => {
            let path = data_dir.join(subdir).join("domains.txt");
            ensure_parent_dir(&path).await?;
            Ok(FilePolicyDriver::open(path).await? as Arc<dyn PolicyDriver>)
        }
        "sql" => {
            let path = data_dir.join(subdir).join("policy.sqlite");
            ensure_parent_dir(&path).await?;
            let url = format!("sqlite://{}?mode=rwc", path.display());
            Ok(SqlPolicyDriver::open(&url).await? as Arc<dyn PolicyDriver>)
        }
        _ => Ok(MemoryPolicyDriver::new() as Arc<dyn PolicyDriver>),
    }
}

async fn ensure_parent_dir(path: &std::path::Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(ProxyError::Io)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ephemeral_config() -> ServerConfiguration {
        let mut config = ServerConfiguration::default();
        config.server.port = 0;
        config
    }

    #[tokio::test]
    async fn status_reflects_lifecycle_and_configured_providers() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.json");
        let supervisor = Supervisor::new(
            dir.path().to_path_buf(),
            config_path,
            ephemeral_config(),
            Arc::new(EventBus::new()),
        );

        let before = supervisor.status();
        assert!(!before.running);
        assert!(before.providers.is_empty());

        supervisor.start().await.unwrap();
        let during = supervisor.status();
        assert!(during.running);
        assert_eq!(during.providers.len(), 2);
        assert_eq!(during.stats.len(), during.providers.len());

        supervisor.stop().await.unwrap();
        let after = supervisor.status();
        assert!(!after.running);
        assert!(after.providers.is_empty());
    }

    #[tokio::test]
    async fn update_config_persists_to_disk_with_a_refreshed_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.json");
        // A nonzero, unbound port: this test never calls `start()`, it only
        // exercises `update_config`'s own validation and persistence, which
        // rejects a zero port outright.
        let mut original = ServerConfiguration::default();
        original.server.port = 55_353;
        let original_last_updated = original.last_updated;
        let supervisor = Supervisor::new(
            dir.path().to_path_buf(),
            config_path.clone(),
            original,
            Arc::new(EventBus::new()),
        );

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let mut updated = supervisor.config();
        updated.server.enable_whitelist = true;
        supervisor.update_config(updated).await.unwrap();

        let on_disk = read_config_from_disk(&config_path).await;
        assert!(on_disk.server.enable_whitelist);
        assert!(on_disk.last_updated > original_last_updated);
    }

    #[tokio::test]
    async fn swap_driver_persists_the_new_backend_choice() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.json");
        let supervisor = Supervisor::new(
            dir.path().to_path_buf(),
            config_path.clone(),
            ephemeral_config(),
            Arc::new(EventBus::new()),
        );
        supervisor.start().await.unwrap();

        let file_cache_config = DriverConfig {
            kind: "file".into(),
            options: Default::default(),
        };
        supervisor.swap_driver(Role::Cache, file_cache_config).await.unwrap();

        let on_disk = read_config_from_disk(&config_path).await;
        assert_eq!(on_disk.drivers.cache.kind, "file");

        supervisor.stop().await.unwrap();
    }

    /// Reads the persisted configuration back without the nonzero-port
    /// validation `ServerConfiguration::load` applies, since these tests
    /// deliberately use an OS-assigned ephemeral port (`port = 0`).
    async fn read_config_from_disk(path: &std::path::Path) -> ServerConfiguration {
        let contents = tokio::fs::read_to_string(path).await.unwrap();
        serde_json::from_str(&contents).unwrap()
    }
}
