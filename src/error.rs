//! Crate-wide error taxonomy.
//!
//! One `thiserror` enum per the error table rather than per-module types:
//! the pipeline needs to match on these variants to decide the response
//! shape, so a flat enum is easier to exhaust than a tree of `From` impls.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProxyError>;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    #[error("policy driver failure: {0}")]
    PolicyDriverFailure(String),

    #[error("cache driver failure on read: {0}")]
    CacheReadFailure(String),

    #[error("cache driver failure on write: {0}")]
    CacheWriteFailure(String),

    #[error("upstream timeout after {0:?}")]
    UpstreamTimeout(std::time::Duration),

    #[error("upstream transport error: {0}")]
    UpstreamTransport(String),

    #[error("upstream response could not be parsed: {0}")]
    UpstreamParse(String),

    #[error("all configured upstream providers failed")]
    AllProvidersFailed,

    #[error("query exceeded its deadline")]
    QueryDeadlineExceeded,

    #[error("failed to bind listener: {0}")]
    BindFailed(String),

    #[error("refusing to bind privileged port {0} without elevated privileges")]
    PortPrivilegeDenied(u16),

    #[error("driver swap failed: {0}")]
    DriverSwapFailed(String),

    #[error("driver entry already exists for key {0}")]
    AlreadyExists(String),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(String),
}

#[derive(Debug, Error, Clone)]
pub enum ConfigError {
    #[error("invalid port: {0}")]
    InvalidPort(String),
    #[error("invalid secondary upstream: {0}")]
    InvalidUpstream(String),
    #[error("failed to parse configuration: {0}")]
    ParseError(String),
    #[error("missing nextdns config id for nextdns upstream")]
    MissingNextDnsConfigId,
}

impl From<serde_json::Error> for ProxyError {
    fn from(err: serde_json::Error) -> Self {
        ProxyError::Serialize(err.to_string())
    }
}
