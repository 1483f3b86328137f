//! The query engine: drives NEW -> ASKING -> {DONE, ERROR} and emits outbound packets.

use core::net::{IpAddr, SocketAddr};
use core::time::Duration;

use bilge::prelude::*;
use log::info;
use stakker::CX;

use crate::table::State;
use crate::wire::{self, Flags, Opcode, Rcode};
use crate::Resolver;
use utils::endian::u16be;

/// Unicast retry cap (§3 invariant 2).
pub const MAX_RETRIES: u8 = 8;
/// mDNS retry cap, smaller since link-local multicast loss is rare and retries are cheap to the
/// whole segment.
pub const MAX_MDNS_RETRIES: u8 = 3;

/// Tick period of the retry timer.
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

enum Outcome {
	Idle,
	Emit,
	Error,
}

impl crate::table::Slot {
	fn tick(&mut self) -> Outcome {
		match self.state {
			State::New => {
				self.state = State::Asking;
				self.tmr = 1;
				self.retries = 0;

				Outcome::Emit
			}

			State::Asking => {
				self.tmr = self.tmr.saturating_sub(1);

				if self.tmr > 0 {
					return Outcome::Idle;
				}

				self.retries += 1;

				let cap = if self.is_mdns { MAX_MDNS_RETRIES } else { MAX_RETRIES };

				if self.retries == cap {
					self.state = State::Error;
					return Outcome::Error;
				}

				self.tmr = self.retries as u32;

				Outcome::Emit
			}

			_ => Outcome::Idle,
		}
	}
}

impl Resolver {
	/// Runs one engine tick: advances every pending slot by at most one step, emits at most one
	/// outbound packet, and rearms the retry timer iff work remains.
	pub(crate) fn check_entries(&mut self, cx: CX![]) {
		for i in 0..crate::table::RESOLV_ENTRIES {
			match self.table.get_mut(i).tick() {
				Outcome::Emit => {
					self.emit_query(i);
					break;
				}

				Outcome::Error => {
					let name = self.table.get(i).name.clone();
					self.notify(cx, name, None);
				}

				Outcome::Idle => {}
			}
		}

		self.rearm_timer(cx);
	}

	fn emit_query(&mut self, idx: usize) {
		let slot = self.table.get(idx);
		let name = slot.name.clone();
		let is_mdns = slot.is_mdns;

		let dest = if is_mdns {
			SocketAddr::new(IpAddr::from(wire::MDNS_GROUP), wire::MDNS_PORT)
		} else {
			SocketAddr::new(IpAddr::from(self.server_addr), wire::DNS_PORT)
		};

		info!("Querying {dest} for {name} (slot {idx})");

		let _ = self.socket.send_to(dest, |buf| {
			let (header, buf) = buf.split::<wire::Header>();

			header.id = wire::encode_index(idx).into();
			header.flags = Flags::new(Rcode::Ok, u3::new(0), false, !is_mdns, false, false, Opcode::Query, false).into();
			header.qdcount = 1u16.into();
			header.ancount = 0u16.into();
			header.nscount = 0u16.into();
			header.arcount = 0u16.into();

			let buf = wire::encode_name(buf, &name);

			let buf = buf.push(&u16be::from(wire::TY_ADDR));
			buf.push(&u16be::from(wire::CLASS_IN));
		});
	}

	pub(crate) fn rearm_timer(&mut self, cx: CX![]) {
		if let Some(key) = self.retry_timer.take() {
			cx.timer_del(key);
		}

		let pending = self.table.iter().any(|slot| matches!(slot.state, State::New | State::Asking));

		if pending {
			let actor = cx.access_actor().clone();
			self.retry_timer = Some(cx.after(TICK_INTERVAL, move |s| actor.apply(s, |this, cx| this.check_entries(cx))));
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::table::Slot;

	#[test]
	fn new_slot_emits_on_first_tick() {
		let mut slot = Slot { state: State::New, ..Slot::default() };
		assert!(matches!(slot.tick(), Outcome::Emit));
		assert_eq!(slot.state, State::Asking);
		assert_eq!(slot.tmr, 1);
	}

	#[test]
	fn unicast_retries_back_off_then_exhaust() {
		let mut slot = Slot { state: State::New, ..Slot::default() };
		slot.tick();

		let mut emits = 0;

		for _ in 0..(MAX_RETRIES as u32 * 16) {
			match slot.tick() {
				Outcome::Emit => emits += 1,
				Outcome::Error => break,
				Outcome::Idle => {}
			}
		}

		assert_eq!(emits, MAX_RETRIES as usize);
		assert_eq!(slot.state, State::Error);
	}

	#[test]
	fn mdns_slot_uses_the_smaller_retry_cap() {
		let mut slot = Slot { state: State::New, is_mdns: true, ..Slot::default() };
		slot.tick();

		let mut emits = 0;

		for _ in 0..(MAX_MDNS_RETRIES as u32 * 16) {
			match slot.tick() {
				Outcome::Emit => emits += 1,
				Outcome::Error => break,
				Outcome::Idle => {}
			}
		}

		assert_eq!(emits, MAX_MDNS_RETRIES as usize);
	}
}
