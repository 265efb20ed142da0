//! Wire codec: header, question and resource-record encode/decode,
//! plus the `Packet` type gluing them together with compression-pointer
//! aware name decoding.

mod header;
mod name;
mod packet;
mod question;
mod record;
mod types;

pub use header::Header;
pub use name::normalize;
pub use packet::Packet;
pub use question::Question;
pub use record::{RData, Record};
pub use types::{RecordClass, RecordType, ResponseCode};
