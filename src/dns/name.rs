//! Domain name label encoding/decoding, including compression-pointer
//! following on read. The encoder always emits uncompressed names, which
//! RFC 1035 permits.

use crate::error::{ProxyError, Result};

const MAX_POINTER_HOPS: usize = 128;

/// Write `name` (e.g. "www.example.com", or "" for the root) as a sequence
/// of length-prefixed labels terminated by a zero octet.
pub fn write_name(name: &str, out: &mut Vec<u8>) {
    if name.is_empty() || name == "." {
        out.push(0);
        return;
    }
    for label in name.trim_end_matches('.').split('.') {
        let bytes = label.as_bytes();
        // DNS labels are capped at 63 octets; truncate defensively rather
        // than emit an unparseable packet.
        let len = bytes.len().min(63);
        out.push(len as u8);
        out.extend_from_slice(&bytes[..len]);
    }
    out.push(0);
}

/// Read a (possibly compressed) name starting at `pos` within `buf`.
/// Returns the normalized lowercase dotted name and the offset immediately
/// following the name *in the original stream* (i.e. not following any
/// pointer jump).
pub fn read_name(buf: &[u8], pos: usize) -> Result<(String, usize)> {
    let mut labels: Vec<String> = Vec::new();
    let mut cursor = pos;
    let mut end_of_name: Option<usize> = None;
    let mut hops = 0usize;

    loop {
        let len = *buf
            .get(cursor)
            .ok_or_else(|| ProxyError::MalformedPacket("name runs past end of packet".into()))?;

        if len == 0 {
            cursor += 1;
            if end_of_name.is_none() {
                end_of_name = Some(cursor);
            }
            break;
        }

        if len & 0xC0 == 0xC0 {
            let b2 = *buf.get(cursor + 1).ok_or_else(|| {
                ProxyError::MalformedPacket("truncated compression pointer".into())
            })?;
            let pointer = (((len as usize) & 0x3F) << 8) | b2 as usize;
            if end_of_name.is_none() {
                end_of_name = Some(cursor + 2);
            }
            hops += 1;
            if hops > MAX_POINTER_HOPS || pointer >= cursor {
                return Err(ProxyError::MalformedPacket(
                    "compression pointer loop or forward reference".into(),
                ));
            }
            cursor = pointer;
            continue;
        }

        if len & 0xC0 != 0 {
            return Err(ProxyError::MalformedPacket(
                "reserved label length prefix".into(),
            ));
        }

        let start = cursor + 1;
        let stop = start + len as usize;
        let label = buf
            .get(start..stop)
            .ok_or_else(|| ProxyError::MalformedPacket("label runs past end of packet".into()))?;
        labels.push(String::from_utf8_lossy(label).to_ascii_lowercase());
        cursor = stop;
    }

    let name = if labels.is_empty() {
        String::new()
    } else {
        labels.join(".")
    };
    Ok((name, end_of_name.unwrap_or(cursor)))
}

/// Normalize a name the way cache keys and policy matching expect:
/// lowercase, no trailing dot.
pub fn normalize(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_plain_name() {
        let mut buf = Vec::new();
        write_name("Example.COM", &mut buf);
        let (name, end) = read_name(&buf, 0).unwrap();
        assert_eq!(name, "example.com");
        assert_eq!(end, buf.len());
    }

    #[test]
    fn round_trips_root() {
        let mut buf = Vec::new();
        write_name("", &mut buf);
        assert_eq!(buf, vec![0]);
        let (name, end) = read_name(&buf, 0).unwrap();
        assert_eq!(name, "");
        assert_eq!(end, 1);
    }

    #[test]
    fn follows_a_compression_pointer() {
        let mut buf = Vec::new();
        write_name("example.com", &mut buf); // offset 0
        let question_name_offset = buf.len();
        buf.push(0xC0);
        buf.push(0x00); // pointer back to offset 0
        let (name, end) = read_name(&buf, question_name_offset).unwrap();
        assert_eq!(name, "example.com");
        assert_eq!(end, question_name_offset + 2);
    }

    #[test]
    fn rejects_a_pointer_loop() {
        let buf = vec![0xC0, 0x00];
        assert!(read_name(&buf, 0).is_err());
    }
}
