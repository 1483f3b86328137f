//! DNS message wire format: header, question/answer tails, and name compression.

use core::net::{Ipv4Addr, Ipv6Addr};

use bilge::prelude::*;
use collections::bytes::Cursor;
use log::warn;
use utils::bytes::Cast;
use utils::endian::{u16be, u32be, BigEndian};

use utils::error::Result;

/// The address family this build resolves: `A` records over IPv4 by default, `AAAA` over IPv6
/// when the `ipv6` feature is enabled.
#[cfg(not(feature = "ipv6"))]
pub type Addr = Ipv4Addr;
#[cfg(feature = "ipv6")]
pub type Addr = Ipv6Addr;

pub const TY_A: u16 = 1;
pub const TY_AAAA: u16 = 28;
pub const TY_ANY: u16 = 255;

#[cfg(not(feature = "ipv6"))]
pub const TY_ADDR: u16 = TY_A;
#[cfg(feature = "ipv6")]
pub const TY_ADDR: u16 = TY_AAAA;

pub const CLASS_IN: u16 = 1;
pub const CLASS_MASK: u16 = 0x7FFF;
pub const CLASS_CACHE_FLUSH: u16 = 0x8000;

pub const DNS_PORT: u16 = 53;
pub const MDNS_PORT: u16 = 5353;

#[cfg(not(feature = "ipv6"))]
pub const MDNS_GROUP: Addr = Ipv4Addr::new(224, 0, 0, 251);
#[cfg(feature = "ipv6")]
pub const MDNS_GROUP: Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0xfb);

#[cfg(not(feature = "ipv6"))]
pub const DEFAULT_SERVER: Addr = Ipv4Addr::new(8, 8, 8, 8);
#[cfg(feature = "ipv6")]
pub const DEFAULT_SERVER: Addr = Ipv6Addr::new(0x2001, 0x0470, 0x0020, 0, 0, 0, 0, 2);

/// The maximum length of a single DNS label, per RFC 1035.
const MAX_LABEL_SIZE: usize = 63;
/// The maximum encoded length of a whole name, per RFC 1035.
const MAX_NAME_SIZE: usize = 255;

#[bitsize(4)]
#[derive(FromBits)]
pub enum Opcode {
	/// a standard query
	Query = 0,
	/// an inverse query
	IQuery = 1,
	/// a server status request
	Status = 2,
	/// reserved
	#[fallback]
	Reserved,
}

#[bitsize(4)]
#[derive(FromBits)]
pub enum Rcode {
	/// No error condition
	Ok = 0,
	/// Format error - the name server was unable to interpret the query
	FormatErr = 1,
	/// Server failure - the name server was unable to process the query
	ServerFailure = 2,
	/// Name error - meaningful only for authoritative responses, signifies the queried name does not exist
	NameErr = 3,
	/// Not implemented - the name server does not support the requested kind of query
	NotImplemented = 4,
	/// Refused - the name server refuses to perform the operation for policy reasons
	Refused = 5,
	/// Reserved
	#[fallback]
	Reserved,
}

/// The 16 flag bits split across `flags1`/`flags2` on the wire.
#[bitsize(16)]
#[derive(FromBits)]
pub struct Flags {
	/// Response code, valid only in responses.
	pub rcode: Rcode,
	/// Reserved, must be zero.
	pub z: u3,
	/// Recursion available, set by a server that supports recursive queries.
	pub ra: bool,
	/// Recursion desired, copied from query to response.
	pub rd: bool,
	/// Truncation, set when the message was too large for the transport.
	pub tc: bool,
	/// Authoritative answer.
	pub aa: bool,
	/// Kind of query.
	pub opcode: Opcode,
	/// Whether this message is a query (0) or a response (1).
	pub qr: bool,
}

/// The fixed 12-byte DNS message header.
#[derive(Cast)]
#[repr(C)]
pub struct Header {
	/// Transaction id, copied verbatim from query to response.
	pub id: u16be,
	pub flags: BigEndian<Flags>,
	pub qdcount: u16be,
	pub ancount: u16be,
	pub nscount: u16be,
	pub arcount: u16be,
}

/// The fixed tail of a question, following the encoded name.
#[derive(Cast)]
#[repr(C)]
pub struct Question {
	pub ty: u16be,
	pub class: u16be,
}

/// The fixed tail of a resource record, following the encoded name.
#[derive(Cast)]
#[repr(C)]
pub struct Answer {
	pub ty: u16be,
	pub class: u16be,
	pub ttl: u32be,
	pub rdlength: u16be,
}

/// Reduces a parsed `Rcode` back to the 4-bit wire value, for storage in a slot's `err` field.
/// Values folded into the `Reserved` fallback variant lose their exact code; 0xF keeps them
/// distinguishable from success without inventing a code that was never on the wire.
pub fn rcode_value(rcode: Rcode) -> u8 {
	match rcode {
		Rcode::Ok => 0,
		Rcode::FormatErr => 1,
		Rcode::ServerFailure => 2,
		Rcode::NameErr => 3,
		Rcode::NotImplemented => 4,
		Rcode::Refused => 5,
		Rcode::Reserved => 0xF,
	}
}

/// Maps a name-table slot index to the transaction id placed on the wire, and back.
///
/// Not a spoof defense (see design notes) — just a direct, invertible index encoding so replies
/// can be routed to their slot in O(1) with no scan.
pub fn encode_index(index: usize) -> u16 {
	(index as u16).wrapping_add(61616)
}

pub fn decode_index(id: u16) -> usize {
	id.wrapping_sub(61616) as usize
}

/// Rejects names that the encoder could not represent on the wire: any label over 63 bytes, or a
/// total encoded length over 255 bytes. The source never checked this; callers must reject at
/// the public `query` entry point instead of discovering the problem mid-encode.
pub fn validate_name(name: &str) -> Result<()> {
	let mut total = 1; // root label terminator

	for label in name.split('.') {
		if label.len() > MAX_LABEL_SIZE {
			return Err(warn!("DNS label {label:?} exceeds {MAX_LABEL_SIZE} bytes"));
		}

		total += label.len() + 1;
	}

	if total > MAX_NAME_SIZE {
		return Err(warn!("DNS name {name:?} exceeds {MAX_NAME_SIZE} bytes encoded"));
	}

	Ok(())
}

/// Encodes a dotted, already-validated host name as length-prefixed labels followed by the root
/// label, advancing the cursor past it.
pub fn encode_name<'a>(mut buf: Cursor<'a>, name: &str) -> Cursor<'a> {
	for label in name.split('.') {
		let bytes = label.as_bytes();

		assert!(bytes.len() <= MAX_LABEL_SIZE, "label length must be checked by validate_name");

		buf = buf.push(&(bytes.len() as u8));
		buf = buf.push(bytes);
	}

	buf.push(&0u8)
}

/// Decodes a (possibly compressed) name starting at `pos` within the full message `buf`.
///
/// Unlike the source, this never mutates the packet in place: it parses into a fresh `String`
/// and leaves `buf` untouched, so it can be called against a shared, reference-counted datagram.
/// Returns the decoded name and the position of the first byte past it — past the two-byte
/// pointer if compression was used, regardless of how far the pointer chain actually reached.
pub fn decode_name(buf: &[u8], pos: usize) -> Result<(String, usize)> {
	let mut name = String::new();
	let mut cursor = pos;
	let mut end = None;
	let mut hops = 0usize;

	loop {
		let len = *buf.get(cursor).ok_or_else(|| warn!("DNS name truncated at offset {cursor}"))?;

		if len & 0xC0 == 0xC0 {
			let lo = *buf.get(cursor + 1).ok_or_else(|| warn!("DNS compression pointer truncated"))?;
			let target = (usize::from(len & 0x3F) << 8) | usize::from(lo);

			if end.is_none() {
				end = Some(cursor + 2);
			}

			hops += 1;

			if hops > buf.len() {
				return Err(warn!("DNS compression pointer loop"));
			}

			cursor = target;
			continue;
		}

		if len & 0xC0 != 0 {
			return Err(warn!("Reserved DNS label length bits set"));
		}

		if len == 0 {
			cursor += 1;
			break;
		}

		let len = usize::from(len);
		let label = buf.get(cursor + 1..cursor + 1 + len).ok_or_else(|| warn!("DNS name truncated"))?;

		if !name.is_empty() {
			name.push('.');
		}

		name.push_str(core::str::from_utf8(label).map_err(|_| warn!("DNS label is not valid UTF-8"))?);

		if name.len() > MAX_NAME_SIZE {
			return Err(warn!("DNS name exceeds {MAX_NAME_SIZE} bytes decoded"));
		}

		cursor += 1 + len;
	}

	Ok((name, end.unwrap_or(cursor)))
}

/// Skips a name without allocating its string form, for sections whose content the caller never
/// inspects (e.g. the echoed question in a reply).
pub fn skip_name(buf: &[u8], pos: usize) -> Result<usize> {
	decode_name(buf, pos).map(|(_, next)| next)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn index_round_trips() {
		for i in 0..=255usize {
			assert_eq!(decode_index(encode_index(i)), i);
		}
	}

	#[test]
	fn name_round_trips() {
		let mut vec = vec![0; 64];
		let len = Cursor::vec(&mut vec, |buf| encode_name(buf, "example.com").pivot());

		let (name, next) = decode_name(&vec, 0).unwrap();

		assert_eq!(name, "example.com");
		assert_eq!(next, len);
	}

	#[test]
	fn decode_follows_compression_pointer() {
		let mut buf = vec![0; 32];

		buf[0] = 3;
		buf[1..4].copy_from_slice(b"foo");
		buf[4] = 0;

		buf[5] = 0xC0;
		buf[6] = 0x00;

		let (name, next) = decode_name(&buf, 5).unwrap();

		assert_eq!(name, "foo");
		assert_eq!(next, 7);
	}

	#[test]
	fn validate_rejects_long_label() {
		let label = "a".repeat(64);
		assert!(validate_name(&label).is_err());
	}

	#[test]
	fn validate_accepts_label_at_the_limit() {
		let label = "a".repeat(63);
		assert!(validate_name(&label).is_ok());
	}
}
