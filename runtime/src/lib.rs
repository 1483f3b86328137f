use core::cell::RefCell;
use core::time::Duration;
use std::io::{self, ErrorKind};
use std::net::{SocketAddr, UdpSocket};

use collections::bytes::{Cursor, Slice};
use log::{error, warn};
use stakker::Fwd;

mod rt;
pub mod logger;
pub mod time;

pub use rt::*;

#[cfg(target_family = "unix")]
mod sys {
	pub use std::os::fd::{AsRawFd, RawFd};

	pub use libc::{poll, pollfd as Poll, POLLERR, POLLHUP, POLLIN, POLLNVAL};

	pub fn as_raw<T: AsRawFd>(t: &T) -> RawFd {
		t.as_raw_fd()
	}
}

#[cfg(target_family = "windows")]
mod sys {
	pub use std::os::windows::io::AsRawSocket as AsRawFd;

	pub use windows_sys::Win32::Networking::WinSock::{WSAPoll as poll, POLLERR, POLLHUP, POLLNVAL, POLLRDNORM as POLLIN, SOCKET as RawFd, WSAPOLLFD as Poll};

	pub fn as_raw<T: AsRawFd>(t: &T) -> RawFd {
		t.as_raw_socket() as _
	}
}

pub use sys::AsRawFd;
use sys::*;
use utils::error::*;

fn as_timeout(t: Option<Duration>) -> i32 {
	t.and_then(|d| d.as_millis().try_into().ok()).unwrap_or(-1)
}

thread_local! {
	static GLOBAL: RefCell<State> = const {
		RefCell::new(State {
			fds: Vec::new(),
			entries: Vec::new(),
			polls: 0,
			datagrams: 0,
		})
	};
}

struct State {
	fds: Vec<Poll>,
	entries: Vec<Entry>,
	polls: u64,
	datagrams: u64,
}

impl State {
	fn with<X, F: FnOnce(&mut Self) -> X>(f: F) -> X {
		GLOBAL.with(|x| f(&mut x.borrow_mut()))
	}

	/// Logs a one-line summary of I/O activity, called on shutdown.
	fn log_stats(&self) {
		log::info!("Processed {} datagram(s) across {} poll(s)", self.datagrams, self.polls);
	}

	fn idx_of(&mut self, socket: &UdpSocket) -> usize {
		let raw = as_raw(socket);
		self.fds.iter().position(|f| f.fd == raw).expect("Socket is present")
	}

	/// Returns whether any more I/O is waiting.
	fn is_io(&self) -> bool {
		!self.fds.is_empty()
	}

	/// Poll the fds. Returns whether any file descriptors are ready for I/O.
	fn poll(&mut self, timeout: Option<Duration>) -> Result<bool> {
		self.polls += 1;

		let ret = unsafe {
			poll(
				self.fds.as_mut_ptr(),
				self.fds.len().try_into().expect("Fewer than u32::MAX fds"),
				as_timeout(timeout),
			)
		};

		let mut pending: u32 = ret.try_into().map_err(|_| error!("poll() failed: {}", io::Error::last_os_error()))?;

		if pending == 0 {
			return Ok(false);
		}

		for idx in 0..self.fds.len() {
			let Poll { revents, .. } = &mut self.fds[idx];

			if *revents == 0 {
				continue;
			}

			if *revents & POLLERR != 0 {
				panic!("Socket error while polling");
			}

			if *revents & POLLHUP != 0 {
				panic!("Socket hangup");
			}

			if *revents & POLLNVAL != 0 {
				panic!("Socket invalid");
			}

			if *revents & POLLIN != 0 {
				self.datagrams += self.entries[idx].flush_read()?;
			}

			*revents = 0;

			pending -= 1;

			if pending == 0 {
				break;
			}
		}

		Ok(true)
	}
}

struct Entry {
	socket: UdpSocket,
	fwd: Fwd<(SocketAddr, Slice)>,
}

impl Entry {
	/// Drains every datagram currently queued on the socket, forwarding each to its subscriber.
	/// Returns the number of datagrams drained.
	fn flush_read(&mut self) -> Result<u64> {
		let mut count = 0;

		loop {
			let mut buf = Slice::new(1500);

			match self.socket.recv_from(&mut buf) {
				Ok((n, addr)) => {
					buf.truncate(n);
					self.fwd.fwd((addr, buf));
					count += 1;
				}
				Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(count),
				Err(err) => {
					error!("UDP recv failed: {err}");
					return Err(());
				}
			}
		}
	}
}

/// A single UDP endpoint registered with the cooperative poll loop.
///
/// Datagrams are inherently atomic, so unlike a byte-stream socket there is no partial-write queue: a send either
/// completes in one syscall or the packet is dropped and logged.
pub struct Io {
	inner: UdpSocket,
}

impl Io {
	pub fn new(inner: UdpSocket, fwd: Fwd<(SocketAddr, Slice)>) -> Result<Self> {
		inner.set_nonblocking(true).map_err(|err| error!("Failed to set socket non-blocking: {err}"))?;

		let socket = inner.try_clone().map_err(|err| error!("Failed to clone socket: {err}"))?;

		State::with(|i| {
			i.fds.push(Poll { fd: as_raw(&inner), events: POLLIN, revents: 0 });
			i.entries.push(Entry { socket, fwd });
		});

		Ok(Self { inner })
	}

	pub fn send_to(&self, addr: SocketAddr, f: impl FnOnce(Cursor)) -> Result {
		let mut vec = vec![0; 1500];
		Cursor::vec(&mut vec, f);

		match self.inner.send_to(&vec, addr) {
			Ok(n) if n == vec.len() => Ok(()),
			Ok(n) => {
				error!("Only sent {n}/{} bytes to {addr}", vec.len());
				Err(())
			}
			Err(err) if err.kind() == ErrorKind::WouldBlock => {
				warn!("UDP socket busy, dropping outbound packet to {addr}");
				Ok(())
			}
			Err(err) => {
				error!("UDP send to {addr} failed: {err}");
				Err(())
			}
		}
	}

	pub fn local_addr(&self) -> Result<SocketAddr> {
		self.inner.local_addr().map_err(|err| error!("Failed to read local address: {err}"))
	}
}

impl Drop for Io {
	fn drop(&mut self) {
		State::with(|i| {
			let idx = i.idx_of(&self.inner);
			i.entries.swap_remove(idx);
			i.fds.swap_remove(idx);
		})
	}
}
