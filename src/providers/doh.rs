//! DNS-over-HTTPS provider: POSTs the raw wire query as
//! `application/dns-message` and returns the raw response body.

use super::Provider;
use crate::constants::PROVIDER_TIMEOUT;
use crate::error::{ConfigError, ProxyError, Result};
use async_trait::async_trait;
use reqwest::Client;

const DOH_MEDIA_TYPE: &str = "application/dns-message";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DohVariant {
    Cloudflare,
    Google,
    OpenDns,
    NextDns,
}

impl DohVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            DohVariant::Cloudflare => "cloudflare",
            DohVariant::Google => "google",
            DohVariant::OpenDns => "opendns",
            DohVariant::NextDns => "nextdns",
        }
    }
}

pub struct DohProvider {
    name: String,
    endpoint: String,
    client: Client,
}

impl DohProvider {
    /// Construct a DoH provider for `variant`. `config_id` is required for
    /// `NextDns` and ignored otherwise: NextDNS needs a config-id path
    /// segment and construction fails without one.
    pub fn new(variant: DohVariant, config_id: Option<&str>) -> Result<Self> {
        let endpoint = match variant {
            DohVariant::Cloudflare => "https://cloudflare-dns.com/dns-query".to_string(),
            DohVariant::Google => "https://dns.google/dns-query".to_string(),
            DohVariant::OpenDns => "https://doh.opendns.com/dns-query".to_string(),
            DohVariant::NextDns => {
                let id = config_id.ok_or(ConfigError::MissingNextDnsConfigId)?;
                format!("https://dns.nextdns.io/{id}")
            }
        };

        let client = Client::builder()
            .timeout(PROVIDER_TIMEOUT)
            .build()
            .map_err(|e| ProxyError::UpstreamTransport(e.to_string()))?;

        Ok(DohProvider {
            name: variant.as_str().to_string(),
            endpoint,
            client,
        })
    }
}

#[async_trait]
impl Provider for DohProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn resolve(&self, query_bytes: &[u8]) -> Result<Vec<u8>> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("content-type", DOH_MEDIA_TYPE)
            .header("accept", DOH_MEDIA_TYPE)
            .body(query_bytes.to_vec())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProxyError::UpstreamTimeout(PROVIDER_TIMEOUT)
                } else {
                    ProxyError::UpstreamTransport(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(ProxyError::UpstreamTransport(format!(
                "{} returned HTTP {}",
                self.name,
                response.status()
            )));
        }

        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| ProxyError::UpstreamParse(e.to_string()))
    }
}
