//! Server configuration: a single JSON document the supervisor reads on
//! start and persists on mutation.

use crate::drivers::DriverConfig;
use crate::error::{ConfigError, ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecondaryUpstream {
    Cloudflare,
    Google,
    Opendns,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    pub port: u16,
    #[serde(rename = "enableWhitelist")]
    pub enable_whitelist: bool,
    #[serde(rename = "secondaryDns")]
    pub secondary_dns: SecondaryUpstream,
    #[serde(rename = "nextdnsConfigId", skip_serializing_if = "Option::is_none")]
    pub nextdns_config_id: Option<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        ServerSection {
            port: crate::constants::DEFAULT_PORT,
            enable_whitelist: false,
            secondary_dns: SecondaryUpstream::Google,
            nextdns_config_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriversSection {
    pub logs: DriverConfig,
    pub cache: DriverConfig,
    pub blacklist: DriverConfig,
    pub whitelist: DriverConfig,
}

impl Default for DriversSection {
    fn default() -> Self {
        DriversSection {
            logs: DriverConfig::memory(),
            cache: DriverConfig::memory(),
            blacklist: DriverConfig::memory(),
            whitelist: DriverConfig::memory(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfiguration {
    pub server: ServerSection,
    pub drivers: DriversSection,
    #[serde(rename = "lastUpdated")]
    pub last_updated: i64,
}

impl Default for ServerConfiguration {
    fn default() -> Self {
        ServerConfiguration {
            server: ServerSection::default(),
            drivers: DriversSection::default(),
            last_updated: crate::drivers::cache_driver::now_ms(),
        }
    }
}

impl ServerConfiguration {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::InvalidPort("port must be nonzero".into()));
        }
        if self.server.secondary_dns == SecondaryUpstream::System && self.server.port < 1024 {
            // Privileged-port rejection is a supervisor-time OS check, not a
            // config-shape error; nothing to validate here beyond the port
            // itself being well-formed. Kept as a branch so new per-upstream
            // constraints have an obvious home.
        }
        Ok(())
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(ProxyError::Io)?;
        let config: ServerConfiguration = serde_json::from_str(&contents)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate().map_err(ProxyError::Config)?;
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        let mut refreshed = self.clone();
        refreshed.last_updated = crate::drivers::cache_driver::now_ms();
        let contents = serde_json::to_string_pretty(&refreshed)?;
        tokio::fs::write(path, contents).await.map_err(ProxyError::Io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_configuration_is_valid() {
        assert!(ServerConfiguration::default().validate().is_ok());
    }

    #[test]
    fn zero_port_is_rejected() {
        let mut config = ServerConfiguration::default();
        config.server.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn round_trips_through_json() {
        let config = ServerConfiguration::default();
        let json = serde_json::to_string(&config).unwrap();
        let decoded: ServerConfiguration = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.server.port, config.server.port);
    }
}
