//! Host-resolver provider: delegates to the operating system's own
//! resolver rather than speaking DoH.
//!
//! The standard library's resolver surface (`tokio::net::lookup_host`) only
//! exposes address lookups, so A/AAAA are native; every other record type
//! (MX, TXT, CNAME, NS, PTR) has no equivalent host API without pulling in
//! a dedicated resolver stack, so this provider answers those with
//! SERVFAIL rather than fabricating a lookup path the platform resolver
//! doesn't expose.

use super::Provider;
use crate::constants::SYSTEM_PROVIDER_DEFAULT_TTL;
use crate::dns::{Packet, RData, Record, RecordClass, RecordType, ResponseCode};
use crate::error::Result;
use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};

pub struct SystemProvider;

impl SystemProvider {
    pub fn new() -> Self {
        SystemProvider
    }

    async fn resolve_packet(&self, query: &Packet) -> Result<Packet> {
        match query.question.qtype {
            RecordType::A => self.resolve_addr(query, false).await,
            RecordType::AAAA => self.resolve_addr(query, true).await,
            _ => Ok(Packet::response_shell(query, ResponseCode::ServFail)),
        }
    }

    async fn resolve_addr(&self, query: &Packet, want_v6: bool) -> Result<Packet> {
        let lookup_target = format!("{}:0", query.question.name);
        match tokio::net::lookup_host(&lookup_target).await {
            Ok(addrs) => {
                let answers: Vec<Record> = addrs
                    .filter_map(|addr: SocketAddr| match (addr.ip(), want_v6) {
                        (IpAddr::V4(v4), false) => Some(Record::new(
                            &query.question.name,
                            RecordClass::IN,
                            SYSTEM_PROVIDER_DEFAULT_TTL,
                            RData::A(v4),
                        )),
                        (IpAddr::V6(v6), true) => Some(Record::new(
                            &query.question.name,
                            RecordClass::IN,
                            SYSTEM_PROVIDER_DEFAULT_TTL,
                            RData::Aaaa(v6),
                        )),
                        _ => None,
                    })
                    .collect();

                if answers.is_empty() {
                    Ok(Packet::response_shell(query, ResponseCode::NxDomain))
                } else {
                    let mut response = Packet::response_shell(query, ResponseCode::NoError);
                    response.answers = answers;
                    Ok(response)
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Ok(Packet::response_shell(query, ResponseCode::NxDomain))
            }
            Err(_) => Ok(Packet::response_shell(query, ResponseCode::ServFail)),
        }
    }
}

impl Default for SystemProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for SystemProvider {
    fn name(&self) -> &str {
        "system"
    }

    async fn resolve(&self, query_bytes: &[u8]) -> Result<Vec<u8>> {
        let query = Packet::decode(query_bytes)?;
        let response = self.resolve_packet(&query).await?;
        Ok(response.encode())
    }
}
