//! The fixed-capacity name table: one slot per pending or resolved lookup.

use crate::wire::Addr;

/// Number of concurrent pending/cached lookups. Five back-to-back queries with the default
/// capacity evicts the oldest (see the LRU eviction test in `lib.rs`).
pub const RESOLV_ENTRIES: usize = 4;

/// Longest host name a slot will store, excluding the terminator the source kept one for.
pub const MAX_DOMAIN_NAME_SIZE: usize = 32;

#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub enum State {
	#[default]
	Unused,
	New,
	Asking,
	Done,
	Error,
}

pub struct Slot {
	pub state: State,
	pub name: String,
	pub addr: Option<Addr>,
	pub tmr: u32,
	pub retries: u8,
	pub seqno: u8,
	pub err: u8,
	pub is_mdns: bool,
}

impl Default for Slot {
	fn default() -> Self {
		Self { state: State::Unused, name: String::new(), addr: None, tmr: 0, retries: 0, seqno: 0, err: 0, is_mdns: false }
	}
}

/// Truncates a name to `MAX_DOMAIN_NAME_SIZE` bytes at a valid UTF-8 boundary, mirroring the
/// source's `strncpy` into a fixed buffer but always leaving the result validly terminated.
pub(crate) fn truncate_name(name: &str) -> String {
	if name.len() <= MAX_DOMAIN_NAME_SIZE {
		return name.to_owned();
	}

	let mut end = MAX_DOMAIN_NAME_SIZE;

	while !name.is_char_boundary(end) {
		end -= 1;
	}

	name[..end].to_owned()
}

pub struct Table {
	slots: [Slot; RESOLV_ENTRIES],
	seqno_global: u8,
}

impl Default for Table {
	fn default() -> Self {
		Self { slots: std::array::from_fn(|_| Slot::default()), seqno_global: 0 }
	}
}

impl Table {
	pub fn get(&self, idx: usize) -> &Slot {
		&self.slots[idx]
	}

	pub fn get_mut(&mut self, idx: usize) -> &mut Slot {
		&mut self.slots[idx]
	}

	pub fn iter(&self) -> impl Iterator<Item = &Slot> {
		self.slots.iter()
	}

	/// A case-sensitive scan for a resolved slot, per `lookup`'s contract.
	pub fn find_done(&self, name: &str) -> Option<&Slot> {
		self.slots.iter().find(|slot| slot.state == State::Done && slot.name == name)
	}

	/// Finds a slot to reuse for `name`, canonicalizing and storing it there in `NEW` state.
	///
	/// Priority is: an existing non-UNUSED slot already tracking this exact name (so a repeated
	/// `query` for a name already in flight updates that slot instead of creating a second one,
	/// which invariant 1 forbids); otherwise the first UNUSED slot; otherwise the slot least
	/// recently stamped, by modular distance from `seqno_global`.
	pub fn find_or_evict(&mut self, name: &str) -> usize {
		let name = truncate_name(name);

		let mut first_unused = None;
		let mut name_match = None;
		let mut lru = (0usize, 0u8);

		for (i, slot) in self.slots.iter().enumerate() {
			if slot.state == State::Unused {
				first_unused.get_or_insert(i);
			} else if slot.name == name {
				name_match = Some(i);
			} else {
				let age = self.seqno_global.wrapping_sub(slot.seqno);

				if age >= lru.1 {
					lru = (i, age);
				}
			}
		}

		let idx = name_match.or(first_unused).unwrap_or(lru.0);

		let seqno = self.seqno_global;
		self.seqno_global = self.seqno_global.wrapping_add(1);

		let slot = &mut self.slots[idx];

		*slot = Slot { state: State::New, name, seqno, ..Slot::default() };

		idx
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn reuses_slot_for_in_flight_name() {
		let mut table = Table::default();

		let a = table.find_or_evict("example.com");
		table.get_mut(a).state = State::Asking;

		let b = table.find_or_evict("example.com");

		assert_eq!(a, b);
	}

	#[test]
	fn evicts_least_recently_stamped_when_full() {
		let mut table = Table::default();

		let mut slots = Vec::new();

		for i in 0..RESOLV_ENTRIES {
			slots.push(table.find_or_evict(&format!("host{i}.example.com")));
		}

		let fifth = table.find_or_evict("host4.example.com");

		assert_eq!(fifth, slots[0]);
		assert_ne!(table.get(slots[0]).name, "host0.example.com");
	}

	#[test]
	fn truncates_overlong_names() {
		let mut table = Table::default();

		let name = "a".repeat(MAX_DOMAIN_NAME_SIZE + 10);
		let idx = table.find_or_evict(&name);

		assert_eq!(table.get(idx).name.len(), MAX_DOMAIN_NAME_SIZE);
	}
}
