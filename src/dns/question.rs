use crate::dns::name::{normalize, read_name, write_name};
use crate::dns::types::{RecordClass, RecordType};
use crate::error::Result;

/// A single question: `(name, type, class)`. Equality is tuple equality,
/// which `derive(PartialEq)` gives us for free once `name` is always
/// stored normalized.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Question {
    pub name: String,
    pub qtype: RecordType,
    pub qclass: RecordClass,
}

impl Question {
    pub fn new(name: impl Into<String>, qtype: RecordType, qclass: RecordClass) -> Self {
        Question {
            name: normalize(&name.into()),
            qtype,
            qclass,
        }
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        write_name(&self.name, out);
        out.extend_from_slice(&self.qtype.to_u16().to_be_bytes());
        out.extend_from_slice(&self.qclass.to_u16().to_be_bytes());
    }

    pub fn read(buf: &[u8], pos: usize) -> Result<(Self, usize)> {
        let (name, mut cursor) = read_name(buf, pos)?;
        let qtype = RecordType::from_u16(read_u16(buf, cursor)?);
        cursor += 2;
        let qclass = RecordClass::from_u16(read_u16(buf, cursor)?);
        cursor += 2;
        Ok((
            Question {
                name,
                qtype,
                qclass,
            },
            cursor,
        ))
    }

    /// Cache key `name:type:class`.
    pub fn cache_key(&self) -> String {
        format!("{}:{:?}:{:?}", self.name, self.qtype, self.qclass)
    }
}

pub(crate) fn read_u16(buf: &[u8], pos: usize) -> Result<u16> {
    let b = buf.get(pos..pos + 2).ok_or_else(|| {
        crate::error::ProxyError::MalformedPacket("read past end of packet".into())
    })?;
    Ok(u16::from_be_bytes([b[0], b[1]]))
}

pub(crate) fn read_u32(buf: &[u8], pos: usize) -> Result<u32> {
    let b = buf.get(pos..pos + 4).ok_or_else(|| {
        crate::error::ProxyError::MalformedPacket("read past end of packet".into())
    })?;
    Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}
