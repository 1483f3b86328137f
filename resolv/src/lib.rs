//! A stub DNS/mDNS resolver: a fixed-capacity name table, a retrying query engine, a reply
//! correlator, and (optionally) an mDNS responder for this host's own name.

use core::net::{IpAddr, SocketAddr};
use std::net::UdpSocket;

use log::{error, info};
use runtime::Io;
use stakker::{fwd_to, Fwd, CX};
use utils::error::*;

mod mdns;
mod query;
mod response;
mod table;
mod wire;

pub use table::{RESOLV_ENTRIES, MAX_DOMAIN_NAME_SIZE};
pub use wire::Addr;

pub struct Resolver {
	socket: Io,
	server_addr: Addr,
	local_hostname: String,
	local_addrs: Vec<Addr>,
	table: table::Table,
	retry_timer: Option<stakker::FixedTimerKey>,
	/// Name of the in-flight self-query used to probe for an mDNS name collision, if any.
	collision_probe: Option<String>,
	/// Broadcasts the name of every query outcome, success or failure alike; recipients call
	/// `lookup` to fetch the resolved address, if any.
	found: Fwd<String>,
}

#[cfg(not(feature = "ipv6"))]
fn unspecified() -> IpAddr {
	IpAddr::from(core::net::Ipv4Addr::UNSPECIFIED)
}
#[cfg(feature = "ipv6")]
fn unspecified() -> IpAddr {
	IpAddr::from(core::net::Ipv6Addr::UNSPECIFIED)
}

#[cfg(not(feature = "ipv6"))]
fn loopback() -> Addr {
	core::net::Ipv4Addr::LOCALHOST
}
#[cfg(feature = "ipv6")]
fn loopback() -> Addr {
	core::net::Ipv6Addr::LOCALHOST
}

#[cfg(feature = "mdns-responder")]
#[cfg(not(feature = "ipv6"))]
fn join_multicast(socket: &UdpSocket) -> Result {
	socket.join_multicast_v4(&wire::MDNS_GROUP, &core::net::Ipv4Addr::UNSPECIFIED).map_err(|err| error!("Failed to join mDNS multicast group: {err}"))
}
#[cfg(feature = "mdns-responder")]
#[cfg(feature = "ipv6")]
fn join_multicast(socket: &UdpSocket) -> Result {
	socket.join_multicast_v6(&wire::MDNS_GROUP, 0).map_err(|err| error!("Failed to join mDNS multicast group: {err}"))
}

/// Strips the trailing dots an absolute host name may carry, so `"example.com."` and
/// `"example.com"` hit the same table slot.
fn canonicalize(name: &str) -> String {
	name.trim_end_matches('.').to_owned()
}

/// `"localhost"` (after canonicalization, case-sensitively) always resolves to the loopback
/// address without ever touching the table.
fn localhost_lookup(name: &str) -> Option<Addr> {
	(canonicalize(name) == "localhost").then(loopback)
}

/// Whether `name` should be queried over mDNS rather than the configured upstream server: only a
/// name with a `.local` label boundary, e.g. `"foo.local"` — bare `"local"` has no such boundary
/// and still goes to the upstream server.
#[cfg(feature = "mdns")]
fn is_mdns_name(name: &str) -> bool {
	name.to_ascii_lowercase().ends_with(".local")
}

impl Resolver {
	pub fn init(cx: CX![], server_addr: Addr, local_hostname: String, local_addrs: Vec<Addr>, found: Fwd<String>) -> Option<Self> {
		#[cfg(feature = "mdns-responder")]
		let port = wire::MDNS_PORT;
		#[cfg(not(feature = "mdns-responder"))]
		let port = 0;

		let udp = UdpSocket::bind(SocketAddr::new(unspecified(), port)).ok_or(|err| error!("Failed to bind resolver UDP socket: {err}"))?;

		#[cfg(feature = "mdns-responder")]
		join_multicast(&udp).ok()?;

		let actor = cx.access_actor().clone();
		let read_fwd = fwd_to!([actor], newdata() as (SocketAddr, collections::bytes::Slice));
		let socket = Io::new(udp, read_fwd).ok()?;

		let mut this = Self {
			socket,
			server_addr,
			local_hostname,
			local_addrs,
			table: table::Table::default(),
			retry_timer: None,
			collision_probe: None,
			found,
		};

		#[cfg(feature = "mdns-responder")]
		this.check_collision(cx);

		Some(this)
	}

	/// Queues `name` for resolution, overwriting any existing slot that already tracks it.
	pub fn query(&mut self, cx: CX![], name: impl Into<String>) {
		let name = canonicalize(&name.into());

		if wire::validate_name(&name).is_err() {
			self.notify(cx, name, None);
			return;
		}

		#[cfg(feature = "mdns")]
		let is_mdns = is_mdns_name(&name);
		#[cfg(not(feature = "mdns"))]
		let is_mdns = false;

		let idx = self.table.find_or_evict(&name);
		self.table.get_mut(idx).is_mdns = is_mdns;

		self.check_entries(cx);
	}

	/// Returns the address cached for `name`, if a prior `query` reached the `DONE` state.
	/// `"localhost"` always resolves to the loopback address without touching the table.
	pub fn lookup(&self, name: &str) -> Option<Addr> {
		if let Some(addr) = localhost_lookup(name) {
			return Some(addr);
		}

		let name = canonicalize(name);
		self.table.find_done(&name).and_then(|slot| slot.addr)
	}

	/// Changes the upstream DNS server used for future unicast queries. Queries already in the
	/// `ASKING` state keep retrying against the server they started with; only the next fresh
	/// `query` observes the change.
	pub fn conf(&mut self, addr: Addr) {
		info!("Upstream DNS server set to {addr}");
		self.server_addr = addr;
	}

	pub fn getserver(&self) -> Addr {
		self.server_addr
	}

	/// Sets this host's advertised name, truncating it to fit the table, and (when the responder
	/// is enabled) probes for a collision with another host already using it.
	pub fn set_hostname(&mut self, cx: CX![], name: impl Into<String>) {
		self.local_hostname = table::truncate_name(&name.into());

		#[cfg(feature = "mdns-responder")]
		self.check_collision(cx);
	}

	pub fn get_hostname(&self) -> &str {
		&self.local_hostname
	}

	/// Routes a query outcome to whoever's waiting on it: the internal collision probe if `name`
	/// matches it, otherwise the public `found` broadcast. `addr` is only consulted for the
	/// collision probe; ordinary recipients call `lookup` for the resolved address.
	fn notify(&mut self, cx: CX![], name: String, addr: Option<Addr>) {
		if self.collision_probe.as_deref() == Some(name.as_str()) {
			self.collision_probe = None;
			self.handle_collision_result(cx, addr);
			return;
		}

		self.found.fwd(name);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn canonicalize_strips_a_single_trailing_dot() {
		assert_eq!(canonicalize("example.com."), "example.com");
	}

	#[test]
	fn canonicalize_strips_all_trailing_dots() {
		assert_eq!(canonicalize("example.com.."), "example.com");
	}

	#[test]
	fn canonicalize_leaves_a_bare_name_alone() {
		assert_eq!(canonicalize("example.com"), "example.com");
	}

	#[cfg(feature = "mdns")]
	#[test]
	fn is_mdns_name_matches_a_dot_local_suffix() {
		assert!(is_mdns_name("foo.local"));
		assert!(is_mdns_name("FOO.LOCAL"));
	}

	#[cfg(feature = "mdns")]
	#[test]
	fn is_mdns_name_rejects_bare_local_and_other_names() {
		assert!(!is_mdns_name("local"));
		assert!(!is_mdns_name("example.com"));
		assert!(!is_mdns_name("notlocal"));
	}

	#[test]
	fn localhost_lookup_resolves_to_the_loopback_address() {
		assert_eq!(localhost_lookup("localhost"), Some(loopback()));
		assert_eq!(localhost_lookup("localhost."), Some(loopback()));
	}

	#[test]
	fn localhost_lookup_ignores_every_other_name() {
		assert_eq!(localhost_lookup("example.com"), None);
		assert_eq!(localhost_lookup("Localhost"), None);
	}
}
