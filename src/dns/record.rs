use crate::dns::name::{normalize, read_name, write_name};
use crate::dns::question::{read_u16, read_u32};
use crate::dns::types::{RecordClass, RecordType};
use crate::error::{ProxyError, Result};
use std::net::{Ipv4Addr, Ipv6Addr};

/// Type-specific answer payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Cname(String),
    Ns(String),
    Ptr(String),
    Mx { preference: u16, exchange: String },
    Txt(Vec<String>),
    Srv { priority: u16, weight: u16, port: u16, target: String },
    Soa {
        mname: String,
        rname: String,
        serial: u32,
        refresh: u32,
        retry: u32,
        expire: u32,
        minimum: u32,
    },
    /// Anything not covered by the named variants round-trips verbatim
    /// rather than failing to decode.
    Raw(Vec<u8>),
}

impl RData {
    fn write(&self, out: &mut Vec<u8>) {
        match self {
            RData::A(addr) => out.extend_from_slice(&addr.octets()),
            RData::Aaaa(addr) => out.extend_from_slice(&addr.octets()),
            RData::Cname(name) | RData::Ns(name) | RData::Ptr(name) => write_name(name, out),
            RData::Mx {
                preference,
                exchange,
            } => {
                out.extend_from_slice(&preference.to_be_bytes());
                write_name(exchange, out);
            }
            RData::Txt(strings) => {
                for s in strings {
                    let bytes = s.as_bytes();
                    let len = bytes.len().min(255);
                    out.push(len as u8);
                    out.extend_from_slice(&bytes[..len]);
                }
            }
            RData::Srv {
                priority,
                weight,
                port,
                target,
            } => {
                out.extend_from_slice(&priority.to_be_bytes());
                out.extend_from_slice(&weight.to_be_bytes());
                out.extend_from_slice(&port.to_be_bytes());
                write_name(target, out);
            }
            RData::Soa {
                mname,
                rname,
                serial,
                refresh,
                retry,
                expire,
                minimum,
            } => {
                write_name(mname, out);
                write_name(rname, out);
                out.extend_from_slice(&serial.to_be_bytes());
                out.extend_from_slice(&refresh.to_be_bytes());
                out.extend_from_slice(&retry.to_be_bytes());
                out.extend_from_slice(&expire.to_be_bytes());
                out.extend_from_slice(&minimum.to_be_bytes());
            }
            RData::Raw(bytes) => out.extend_from_slice(bytes),
        }
    }

    fn read(buf: &[u8], pos: usize, rdlength: usize, qtype: RecordType) -> Result<Self> {
        let end = pos + rdlength;
        if end > buf.len() {
            return Err(ProxyError::MalformedPacket("rdata runs past end of packet".into()));
        }
        let rdata = match qtype {
            RecordType::A => {
                if rdlength != 4 {
                    return Err(ProxyError::MalformedPacket("A record must be 4 bytes".into()));
                }
                RData::A(Ipv4Addr::new(buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]))
            }
            RecordType::AAAA => {
                if rdlength != 16 {
                    return Err(ProxyError::MalformedPacket("AAAA record must be 16 bytes".into()));
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[pos..pos + 16]);
                RData::Aaaa(Ipv6Addr::from(octets))
            }
            RecordType::CNAME => RData::Cname(read_name(buf, pos)?.0),
            RecordType::NS => RData::Ns(read_name(buf, pos)?.0),
            RecordType::PTR => RData::Ptr(read_name(buf, pos)?.0),
            RecordType::MX => {
                let preference = read_u16(buf, pos)?;
                let exchange = read_name(buf, pos + 2)?.0;
                RData::Mx {
                    preference,
                    exchange,
                }
            }
            RecordType::TXT => {
                let mut strings = Vec::new();
                let mut cursor = pos;
                while cursor < end {
                    let len = buf[cursor] as usize;
                    cursor += 1;
                    let chunk = buf.get(cursor..cursor + len).ok_or_else(|| {
                        ProxyError::MalformedPacket("TXT chunk runs past rdata".into())
                    })?;
                    strings.push(String::from_utf8_lossy(chunk).into_owned());
                    cursor += len;
                }
                RData::Txt(strings)
            }
            RecordType::SRV => {
                let priority = read_u16(buf, pos)?;
                let weight = read_u16(buf, pos + 2)?;
                let port = read_u16(buf, pos + 4)?;
                let target = read_name(buf, pos + 6)?.0;
                RData::Srv {
                    priority,
                    weight,
                    port,
                    target,
                }
            }
            RecordType::SOA => {
                let (mname, next) = read_name(buf, pos)?;
                let (rname, next) = read_name(buf, next)?;
                let serial = read_u32(buf, next)?;
                let refresh = read_u32(buf, next + 4)?;
                let retry = read_u32(buf, next + 8)?;
                let expire = read_u32(buf, next + 12)?;
                let minimum = read_u32(buf, next + 16)?;
                RData::Soa {
                    mname,
                    rname,
                    serial,
                    refresh,
                    retry,
                    expire,
                    minimum,
                }
            }
            RecordType::Other(_) => RData::Raw(buf[pos..end].to_vec()),
        };
        Ok(rdata)
    }

    /// The SOA minimum field, consulted by negative caching.
    pub fn soa_minimum(&self) -> Option<u32> {
        match self {
            RData::Soa { minimum, .. } => Some(*minimum),
            _ => None,
        }
    }
}

/// A resource record: shared shape for answer/authority/additional
/// sections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub name: String,
    pub rtype: RecordType,
    pub rclass: RecordClass,
    pub ttl: u32,
    pub rdata: RData,
}

impl Record {
    pub fn new(name: impl Into<String>, rclass: RecordClass, ttl: u32, rdata: RData) -> Self {
        let rtype = rdata_type(&rdata);
        Record {
            name: normalize(&name.into()),
            rtype,
            rclass,
            ttl,
            rdata,
        }
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        write_name(&self.name, out);
        out.extend_from_slice(&self.rtype.to_u16().to_be_bytes());
        out.extend_from_slice(&self.rclass.to_u16().to_be_bytes());
        out.extend_from_slice(&self.ttl.to_be_bytes());

        let mut rdata_bytes = Vec::new();
        self.rdata.write(&mut rdata_bytes);
        out.extend_from_slice(&(rdata_bytes.len() as u16).to_be_bytes());
        out.extend_from_slice(&rdata_bytes);
    }

    pub fn read(buf: &[u8], pos: usize) -> Result<(Self, usize)> {
        let (name, cursor) = read_name(buf, pos)?;
        let rtype = RecordType::from_u16(read_u16(buf, cursor)?);
        let rclass = RecordClass::from_u16(read_u16(buf, cursor + 2)?);
        let ttl = read_u32(buf, cursor + 4)?;
        let rdlength = read_u16(buf, cursor + 8)? as usize;
        let rdata_pos = cursor + 10;
        let rdata = RData::read(buf, rdata_pos, rdlength, rtype)?;
        Ok((
            Record {
                name,
                rtype,
                rclass,
                ttl,
                rdata,
            },
            rdata_pos + rdlength,
        ))
    }
}

fn rdata_type(rdata: &RData) -> RecordType {
    match rdata {
        RData::A(_) => RecordType::A,
        RData::Aaaa(_) => RecordType::AAAA,
        RData::Cname(_) => RecordType::CNAME,
        RData::Ns(_) => RecordType::NS,
        RData::Ptr(_) => RecordType::PTR,
        RData::Mx { .. } => RecordType::MX,
        RData::Txt(_) => RecordType::TXT,
        RData::Srv { .. } => RecordType::SRV,
        RData::Soa { .. } => RecordType::SOA,
        RData::Raw(_) => RecordType::Other(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_an_a_record() {
        let r = Record::new("example.com", RecordClass::IN, 120, RData::A(Ipv4Addr::new(93, 184, 216, 34)));
        let mut buf = Vec::new();
        r.write(&mut buf);
        let (decoded, end) = Record::read(&buf, 0).unwrap();
        assert_eq!(r, decoded);
        assert_eq!(end, buf.len());
    }

    #[test]
    fn round_trips_a_txt_record_with_multiple_strings() {
        let r = Record::new(
            "example.com",
            RecordClass::IN,
            60,
            RData::Txt(vec!["a".into(), "bb".into()]),
        );
        let mut buf = Vec::new();
        r.write(&mut buf);
        let (decoded, _) = Record::read(&buf, 0).unwrap();
        assert_eq!(r, decoded);
    }

    #[test]
    fn soa_minimum_is_extracted() {
        let rdata = RData::Soa {
            mname: "ns1.example.com".into(),
            rname: "hostmaster.example.com".into(),
            serial: 1,
            refresh: 2,
            retry: 3,
            expire: 4,
            minimum: 300,
        };
        assert_eq!(rdata.soa_minimum(), Some(300));
    }
}
