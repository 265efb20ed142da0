use crate::dns::header::Header;
use crate::dns::question::Question;
use crate::dns::record::Record;
use crate::dns::types::ResponseCode;
use crate::error::{ProxyError, Result};

/// A decoded DNS message.
#[derive(Debug, Clone)]
pub struct Packet {
    pub header: Header,
    pub question: Question,
    pub answers: Vec<Record>,
    pub authority: Vec<Record>,
    pub additional: Vec<Record>,
}

impl Packet {
    /// Decode a query or response from wire bytes.
    ///
    /// Refuses truncated input and anything that isn't exactly one
    /// question.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let header = Header::read(buf)?;
        if header.qdcount != 1 {
            return Err(ProxyError::MalformedPacket(format!(
                "expected exactly 1 question, got {}",
                header.qdcount
            )));
        }

        let (question, mut cursor) = Question::read(buf, Header::WIRE_LEN)?;

        let mut answers = Vec::with_capacity(header.ancount as usize);
        for _ in 0..header.ancount {
            let (record, next) = Record::read(buf, cursor)?;
            answers.push(record);
            cursor = next;
        }

        let mut authority = Vec::with_capacity(header.nscount as usize);
        for _ in 0..header.nscount {
            let (record, next) = Record::read(buf, cursor)?;
            authority.push(record);
            cursor = next;
        }

        let mut additional = Vec::with_capacity(header.arcount as usize);
        for _ in 0..header.arcount {
            let (record, next) = Record::read(buf, cursor)?;
            additional.push(record);
            cursor = next;
        }

        Ok(Packet {
            header,
            question,
            answers,
            authority,
            additional,
        })
    }

    /// Encode to wire bytes. Section counts are recomputed from the vectors
    /// so callers never have to keep `header.*count` in sync by hand.
    pub fn encode(&self) -> Vec<u8> {
        let mut header = self.header;
        header.qdcount = 1;
        header.ancount = self.answers.len() as u16;
        header.nscount = self.authority.len() as u16;
        header.arcount = self.additional.len() as u16;

        let mut out = Vec::with_capacity(64);
        header.write(&mut out);
        self.question.write(&mut out);
        for r in &self.answers {
            r.write(&mut out);
        }
        for r in &self.authority {
            r.write(&mut out);
        }
        for r in &self.additional {
            r.write(&mut out);
        }
        out
    }

    /// Build an empty response shell for `query`, preserving the
    /// transaction id: the response returned to the client must carry the
    /// same id as the incoming query.
    pub fn response_shell(query: &Packet, rcode: ResponseCode) -> Packet {
        Packet {
            header: Header {
                id: query.header.id,
                qr: true,
                opcode: query.header.opcode,
                aa: false,
                tc: false,
                rd: query.header.rd,
                ra: true,
                rcode,
                qdcount: 1,
                ancount: 0,
                nscount: 0,
                arcount: 0,
            },
            question: query.question.clone(),
            answers: Vec::new(),
            authority: Vec::new(),
            additional: Vec::new(),
        }
    }

    /// Re-stamp a response's transaction id to match the original query's,
    /// used after an upstream dispatch returns a response carrying its own
    /// (possibly different) id.
    pub fn reassign_id(&mut self, id: u16) {
        self.header.id = id;
    }

    /// Minimum TTL across all non-empty answer records.
    pub fn min_answer_ttl(&self) -> Option<u32> {
        self.answers.iter().map(|r| r.ttl).min()
    }

    pub fn soa_minimum(&self) -> Option<u32> {
        self.authority.iter().find_map(|r| r.rdata.soa_minimum())
    }

    pub fn is_negative(&self) -> bool {
        self.header.rcode == ResponseCode::NxDomain
            || (self.header.rcode == ResponseCode::NoError && self.answers.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::record::RData;
    use crate::dns::types::{RecordClass, RecordType};
    use std::net::Ipv4Addr;

    fn sample_query(id: u16) -> Packet {
        Packet {
            header: Header {
                id,
                qr: false,
                opcode: 0,
                aa: false,
                tc: false,
                rd: true,
                ra: false,
                rcode: ResponseCode::NoError,
                qdcount: 1,
                ancount: 0,
                nscount: 0,
                arcount: 0,
            },
            question: Question::new("example.com", RecordType::A, RecordClass::IN),
            answers: vec![],
            authority: vec![],
            additional: vec![],
        }
    }

    #[test]
    fn decode_encode_round_trips() {
        let packet = sample_query(0x1234);
        let bytes = packet.encode();
        let decoded = Packet::decode(&bytes).unwrap();
        assert_eq!(decoded.header.id, 0x1234);
        assert_eq!(decoded.question, packet.question);
    }

    #[test]
    fn rejects_truncated_header() {
        assert!(Packet::decode(&[0u8; 4]).is_err());
    }

    #[test]
    fn rejects_multi_question_packets() {
        let mut packet = sample_query(1);
        packet.header.qdcount = 2;
        let mut bytes = Vec::new();
        packet.header.write(&mut bytes);
        packet.question.write(&mut bytes);
        assert!(Packet::decode(&bytes).is_err());
    }

    #[test]
    fn response_shell_preserves_query_id() {
        let query = sample_query(0xABCD);
        let shell = Packet::response_shell(&query, ResponseCode::NxDomain);
        assert_eq!(shell.header.id, 0xABCD);
        assert_eq!(shell.question, query.question);
    }

    #[test]
    fn min_answer_ttl_picks_the_lowest() {
        let mut packet = sample_query(1);
        packet.answers.push(crate::dns::record::Record::new(
            "example.com",
            RecordClass::IN,
            300,
            RData::A(Ipv4Addr::new(1, 1, 1, 1)),
        ));
        packet.answers.push(crate::dns::record::Record::new(
            "example.com",
            RecordClass::IN,
            60,
            RData::A(Ipv4Addr::new(1, 0, 0, 1)),
        ));
        assert_eq!(packet.min_answer_ttl(), Some(60));
    }
}
