//! The mDNS responder: answers inbound questions about our own host name, and the self-query
//! used to detect another host already using it.

use core::mem::size_of;
use core::net::{IpAddr, SocketAddr};

use bilge::prelude::*;
use collections::bytes::Slice;
use log::info;
use stakker::CX;
use utils::bytes::{self, Cast};
use utils::endian::{u16be, u32be};

use crate::wire::{self, Addr, Answer, Flags, Header, Opcode, Question, Rcode};
use crate::Resolver;

/// TTL placed on every cache-flush answer we emit.
const ANSWER_TTL: u32 = 120;

impl Resolver {
	/// Scans the question section of an inbound packet already confirmed to be a question
	/// (`flags1 == flags2 == 0`), and replies iff one of them names us.
	pub(crate) fn answer_question(&mut self, _cx: CX![], src: SocketAddr, raw: &Slice, qdcount: u16) {
		let mine = format!("{}.local", self.local_hostname);

		let mut pos = size_of::<Header>();
		let mut matched = false;

		for _ in 0..qdcount {
			let Ok((name, next)) = wire::decode_name(raw, pos) else { return };

			let Some(tail) = raw.get(next..next + size_of::<Question>()) else { return };
			let tail: &Question = bytes::cast(tail);

			let ty = tail.ty.get();
			let class = tail.class.get() & wire::CLASS_MASK;

			pos = next + size_of::<Question>();

			if class == wire::CLASS_IN && (ty == wire::TY_ADDR || ty == wire::TY_ANY) && name.eq_ignore_ascii_case(&mine) {
				matched = true;
			}
		}

		if matched {
			info!("Answering mDNS question for {mine} from {src}");
			self.send_answer();
		}
	}

	fn send_answer(&mut self) {
		let addrs = self.usable_addrs();

		if addrs.is_empty() {
			return;
		}

		let name = format!("{}.local", self.local_hostname);
		let dest = SocketAddr::new(IpAddr::from(wire::MDNS_GROUP), wire::MDNS_PORT);

		let _ = self.socket.send_to(dest, |buf| {
			let (header, mut buf) = buf.split::<Header>();

			header.id = 0u16.into();
			header.flags = Flags::new(Rcode::Ok, u3::new(0), false, false, false, true, Opcode::Query, true).into();
			header.qdcount = 0u16.into();
			header.ancount = (addrs.len() as u16).into();
			header.nscount = 0u16.into();
			header.arcount = 0u16.into();

			for (i, addr) in addrs.iter().enumerate() {
				buf = if i == 0 {
					wire::encode_name(buf, &name)
				} else {
					let buf = buf.push(&0xC0u8);
					buf.push(&(size_of::<Header>() as u8))
				};

				let (answer, rest): (&mut Answer, _) = buf.split();

				answer.ty = u16be::from(wire::TY_ADDR);
				answer.class = u16be::from(wire::CLASS_IN | wire::CLASS_CACHE_FLUSH);
				answer.ttl = u32be::from(ANSWER_TTL);
				answer.rdlength = u16be::from(size_of::<Addr>() as u16);

				buf = rest.push(addr);
			}
		});
	}

	/// The addresses to advertise for our own name: a single address for an IPv4 build (an A
	/// reply always carries exactly one answer), link-local addresses only for IPv6 unless
	/// `mdns-global-v6` is enabled (an AAAA reply may carry several).
	fn usable_addrs(&self) -> Vec<Addr> {
		#[cfg(not(feature = "ipv6"))]
		{
			self.local_addrs.first().copied().into_iter().collect()
		}

		#[cfg(feature = "ipv6")]
		{
			self.local_addrs.iter().copied().filter(|addr| cfg!(feature = "mdns-global-v6") || is_link_local(*addr)).collect()
		}
	}

	/// Issues a self-query for our own mDNS name, to detect a collision with another host.
	pub(crate) fn check_collision(&mut self, cx: CX![]) {
		let probe = format!("{}.local", self.local_hostname);

		info!("Probing for mDNS name collisions on {probe}");

		self.collision_probe = Some(probe.clone());
		self.query(cx, probe);
	}

	/// Called when a DONE/ERROR notification matches the in-flight collision probe. Per the
	/// source's design notes, collision handling was never implemented; here a positive answer
	/// (someone else already owns the name) triggers an automatic rename and a fresh probe.
	pub(crate) fn handle_collision_result(&mut self, cx: CX![], addr: Option<Addr>) {
		if addr.is_none() {
			return;
		}

		self.local_hostname = next_candidate(&self.local_hostname);

		info!("mDNS name collision detected; renamed to {}", self.local_hostname);

		self.check_collision(cx);
	}
}

#[cfg(feature = "ipv6")]
fn is_link_local(addr: core::net::Ipv6Addr) -> bool {
	addr.segments()[0] & 0xffc0 == 0xfe80
}

fn next_candidate(name: &str) -> String {
	match name.rsplit_once('-') {
		Some((base, suffix)) if !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) => {
			let n: u32 = suffix.parse().unwrap_or(1);
			format!("{base}-{}", n + 1)
		}
		_ => format!("{name}-2"),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn first_collision_appends_suffix() {
		assert_eq!(next_candidate("contiki"), "contiki-2");
	}

	#[test]
	fn repeat_collision_increments_suffix() {
		assert_eq!(next_candidate("contiki-2"), "contiki-3");
	}
}
