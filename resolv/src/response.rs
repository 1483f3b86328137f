//! The response handler: correlates inbound UDP datagrams to name-table slots.

use core::mem::size_of;
use core::net::SocketAddr;

use bilge::prelude::*;
use collections::bytes::Slice;
use log::warn;
use stakker::CX;
use utils::bytes::Cast;
use utils::error::Result;

use crate::table::{State, RESOLV_ENTRIES};
use crate::wire::{self, Answer, Flags, Header, Opcode, Rcode};
use crate::Resolver;

/// `flags1 == 0 && flags2 == 0` marks an incoming question rather than a reply to one of ours.
fn is_question(flags: Flags) -> bool {
	!flags.qr() && matches!(flags.opcode(), Opcode::Query) && !flags.aa() && !flags.tc() && !flags.rd() && !flags.ra() && flags.z().value() == 0 && matches!(flags.rcode(), Rcode::Ok)
}

/// Skips a name within a forward-only cursor without decoding it: the question/answer sections
/// of a reply never need the name's text, only its length on the wire.
///
/// Returns `Err` instead of consuming past the end of `buf` when the name (or its compression
/// pointer) runs off the end of the datagram, so a truncated or adversarial reply can be dropped
/// instead of panicking `Slice::split`'s bounds assertion.
fn skip_name(buf: &Slice) -> Result<()> {
	loop {
		if buf.is_empty() {
			return Err(warn!("DNS name truncated"));
		}

		let len: u8 = *buf.split();

		match len >> 6 {
			0b00 => {}
			0b11 => {
				if buf.is_empty() {
					return Err(warn!("DNS compression pointer truncated"));
				}

				let _: &u8 = buf.split();
				break;
			}
			_ => break,
		}

		if len == 0 {
			break;
		}

		if buf.len() < len as usize {
			return Err(warn!("DNS name truncated"));
		}

		buf.split_bytes(len as _);
	}

	Ok(())
}

impl Resolver {
	pub(crate) fn newdata(&mut self, cx: CX![], src: SocketAddr, buf: Slice) {
		if buf.len() < size_of::<Header>() {
			warn!("Dropping DNS datagram from {src} shorter than a header");
			return;
		}

		#[cfg(feature = "mdns-responder")]
		let snapshot = buf.clone();

		let header: &Header = buf.split();
		let flags = header.flags.get();

		if is_question(flags) {
			#[cfg(feature = "mdns-responder")]
			self.answer_question(cx, src, &snapshot, header.qdcount.get());

			return;
		}

		let idx = wire::decode_index(header.id.get());

		if idx >= RESOLV_ENTRIES {
			warn!("Dropping DNS reply from {src} with out-of-range transaction id");
			return;
		}

		if self.table.get(idx).state != State::Asking {
			return;
		}

		if header.ancount.get() == 0 {
			return;
		}

		let rcode = wire::rcode_value(flags.rcode());

		if rcode != 0 {
			let slot = self.table.get_mut(idx);
			slot.err = rcode;
			slot.state = State::Error;

			let name = slot.name.clone();
			self.notify(cx, name, None);

			return;
		}

		for _ in 0..header.qdcount.get() {
			if skip_name(&buf).is_err() {
				warn!("Dropping DNS reply from {src} with malformed question name");
				return;
			}

			if buf.len() < 4 {
				warn!("Dropping DNS reply from {src} truncated in question tail");
				return;
			}

			buf.split_bytes(4); // type + class
		}

		for _ in 0..header.ancount.get() {
			if skip_name(&buf).is_err() {
				warn!("Dropping DNS reply from {src} with malformed answer name");
				return;
			}

			if buf.len() < size_of::<Answer>() {
				warn!("Dropping DNS reply from {src} truncated in answer tail");
				return;
			}

			let rr: &Answer = buf.split();

			let ty = rr.ty.get();
			let class = rr.class.get() & wire::CLASS_MASK;
			let rdlength = rr.rdlength.get();

			if buf.len() < usize::from(rdlength) {
				warn!("Dropping DNS reply from {src} with rdlength past the end of the datagram");
				return;
			}

			if ty == wire::TY_ADDR && class == wire::CLASS_IN && usize::from(rdlength) == size_of::<wire::Addr>() {
				let addr: &wire::Addr = buf.split();

				let slot = self.table.get_mut(idx);
				slot.addr = Some(*addr);
				slot.state = State::Done;

				let name = slot.name.clone();
				self.notify(cx, name, Some(*addr));

				return;
			}

			buf.split_bytes(rdlength as _);
		}

		// No matching address record; keep the slot ASKING and let the retry timer drive recovery.
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn flags(qr: bool, opcode: Opcode, aa: bool, tc: bool, rd: bool, ra: bool) -> Flags {
		Flags::new(Rcode::Ok, u3::new(0), ra, rd, tc, aa, opcode, qr)
	}

	#[test]
	fn is_question_accepts_a_bare_query() {
		assert!(is_question(flags(false, Opcode::Query, false, false, false, false)));
	}

	#[test]
	fn is_question_rejects_a_reply() {
		assert!(!is_question(flags(true, Opcode::Query, false, false, false, false)));
	}

	#[test]
	fn is_question_rejects_non_query_opcodes() {
		assert!(!is_question(flags(false, Opcode::Status, false, false, false, false)));
	}

	#[test]
	fn is_question_rejects_any_flag_bit_set() {
		assert!(!is_question(flags(false, Opcode::Query, true, false, false, false)));
		assert!(!is_question(flags(false, Opcode::Query, false, true, false, false)));
		assert!(!is_question(flags(false, Opcode::Query, false, false, true, false)));
		assert!(!is_question(flags(false, Opcode::Query, false, false, false, true)));
	}

	fn slice_of(bytes: &[u8]) -> Slice {
		let mut slice = Slice::new(bytes.len());
		slice.copy_from_slice(bytes);
		slice
	}

	#[test]
	fn skip_name_consumes_an_uncompressed_name() {
		let buf = slice_of(&[3, b'f', b'o', b'o', 0]);
		assert!(skip_name(&buf).is_ok());
		assert!(buf.is_empty());
	}

	#[test]
	fn skip_name_consumes_a_compression_pointer() {
		let buf = slice_of(&[0xC0, 0x00, 0xAA]);
		assert!(skip_name(&buf).is_ok());
		assert_eq!(buf.len(), 1);
	}

	#[test]
	fn skip_name_drops_instead_of_panicking_on_a_truncated_label() {
		// Length byte claims 5 bytes of label but only 2 remain.
		let buf = slice_of(&[5, b'a', b'b']);
		assert!(skip_name(&buf).is_err());
	}

	#[test]
	fn skip_name_drops_instead_of_panicking_on_an_empty_buffer() {
		let buf = slice_of(&[]);
		assert!(skip_name(&buf).is_err());
	}

	#[test]
	fn skip_name_drops_instead_of_panicking_on_a_truncated_pointer() {
		let buf = slice_of(&[0xC0]);
		assert!(skip_name(&buf).is_err());
	}

	#[test]
	fn answer_tail_casts_type_class_and_rdlength() {
		// ty=A(1), class=IN(1), ttl=120, rdlength=4, matching a single A record.
		let buf = slice_of(&[0, 1, 0, 1, 0, 0, 0, 120, 0, 4, 10, 0, 0, 1]);
		let rr: &Answer = buf.split();

		assert_eq!(rr.ty.get(), wire::TY_A);
		assert_eq!(rr.class.get(), wire::CLASS_IN);
		assert_eq!(rr.rdlength.get(), 4);
		assert_eq!(buf.len(), 4);
	}
}
