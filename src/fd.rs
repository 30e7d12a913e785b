//! Move-only ownership of a single OS file descriptor.
//!
//! A [`FileDescriptor`] is the unit of descriptor ownership throughout this
//! crate: pipes, socketpairs and opened files all come back as one or a pair
//! of these, and the supervisor moves them around (never copies) on the way
//! to a child's `dup2` table.

use std::{
	convert::TryFrom,
	os::unix::io::RawFd,
};

use nix::{
	errno::Errno,
	fcntl::{self, FcntlArg, OFlag},
	sys::{
		socket::{self, AddressFamily, SockFlag, SockType},
		stat::{fstat, Mode},
	},
	unistd,
};

use crate::error::{Error, Result};

/// A child-side descriptor number, e.g. `0` for stdin. `-1` ([`NO_HANDLE`])
/// means "none".
pub type Handle = RawFd;

/// Well-known handle for the child's stdin.
pub const STDIN: Handle = 0;
/// Well-known handle for the child's stdout.
pub const STDOUT: Handle = 1;
/// Well-known handle for the child's stderr.
pub const STDERR: Handle = 2;
/// The handle value meaning "none"/"not set".
pub const NO_HANDLE: Handle = -1;

/// Sentinel returned by [`FileDescriptor::read`]/[`FileDescriptor::write`] on
/// terminal error, mirroring `SIZE_MAX` in the system this crate's engine is
/// modeled on.
pub const NPOS: usize = usize::MAX;

/// A move-only, self-closing owner of one OS file descriptor.
///
/// Holds `-1` ("no descriptor") in its default/moved-from state; the
/// destructor is then a no-op. Double-close is impossible by construction.
#[derive(Debug)]
pub struct FileDescriptor(RawFd);

impl Default for FileDescriptor {
	fn default() -> Self {
		Self(NO_HANDLE)
	}
}

impl FileDescriptor {
	/// Wraps an already-open raw descriptor. `fd` must not be owned
	/// elsewhere.
	pub fn from_raw(fd: RawFd) -> Self {
		Self(fd)
	}

	/// Creates a pipe: `(read_end, write_end)`.
	pub fn open_unidirectional() -> Result<(Self, Self)> {
		let (read, write) =
			unistd::pipe2(OFlag::empty()).map_err(|e| Error::os("pipe2", e))?;
		Ok((Self(read), Self(write)))
	}

	/// Creates a UNIX-domain stream socketpair: `(end_a, end_b)`, either of
	/// which can read and write.
	pub fn open_bidirectional() -> Result<(Self, Self)> {
		let (a, b) = socket::socketpair(
			AddressFamily::Unix,
			SockType::Stream,
			None,
			SockFlag::empty(),
		)
		.map_err(|e| Error::os("socketpair", e))?;
		Ok((Self(a), Self(b)))
	}

	/// Opens `path` per the flag table in the data model: neither flag gives
	/// back an empty (`no_handle`) descriptor; otherwise `O_RDONLY`,
	/// `O_WRONLY|O_CREAT` or `O_RDWR|O_CREAT`, plus `O_TRUNC` when
	/// `overwrite` or `O_APPEND` otherwise. Mode `0644`. Retries on `EINTR`.
	pub fn open_file(path: &str, is_read: bool, is_write: bool, overwrite: bool) -> Result<Self> {
		if !is_read && !is_write {
			return Ok(Self::default());
		}
		let mut flags = OFlag::O_NOCTTY;
		if !is_write {
			flags |= OFlag::O_RDONLY;
		} else if !is_read {
			flags |= OFlag::O_WRONLY | OFlag::O_CREAT;
		} else {
			flags |= OFlag::O_RDWR | OFlag::O_CREAT;
		}
		if is_write {
			flags |= if overwrite { OFlag::O_TRUNC } else { OFlag::O_APPEND };
		}
		let mode = Mode::from_bits_truncate(0o644);
		loop {
			match fcntl::open(path, flags, mode) {
				Ok(fd) => return Ok(Self(fd)),
				Err(Errno::EINTR) => continue,
				Err(e) => return Err(Error::os("open", e)),
			}
		}
	}

	/// `true` iff this handle owns a descriptor.
	pub fn is_present(&self) -> bool {
		self.0 != NO_HANDLE
	}

	/// Inspects the raw descriptor without releasing ownership.
	pub fn handle(&self) -> RawFd {
		self.0
	}

	/// Relinquishes ownership, returning the raw descriptor. The caller
	/// becomes responsible for closing it; this handle becomes empty.
	pub fn release(&mut self) -> RawFd {
		std::mem::replace(&mut self.0, NO_HANDLE)
	}

	/// Reads up to `buf.len()` bytes. Returns the count read, `0` on EOF, or
	/// [`NPOS`] on terminal error. Retries transparently on `EINTR`.
	pub fn read(&self, buf: &mut [u8]) -> usize {
		if !self.is_present() {
			return NPOS;
		}
		loop {
			match unistd::read(self.0, buf) {
				Ok(n) => return n,
				Err(Errno::EINTR) => continue,
				Err(_) => return NPOS,
			}
		}
	}

	/// Writes up to `buf.len()` bytes. Returns the count written, or
	/// [`NPOS`] on terminal error. Retries transparently on `EINTR`.
	pub fn write(&self, buf: &[u8]) -> usize {
		if !self.is_present() {
			return NPOS;
		}
		loop {
			match unistd::write(self.0, buf) {
				Ok(n) => return n,
				Err(Errno::EINTR) => continue,
				Err(_) => return NPOS,
			}
		}
	}

	/// `fstat`'s size of the underlying file, or [`NPOS`] if there is no
	/// descriptor or the `fstat` call fails.
	pub fn file_size(&self) -> usize {
		if !self.is_present() {
			return NPOS;
		}
		fstat(self.0)
			.ok()
			.and_then(|st| usize::try_from(st.st_size).ok())
			.unwrap_or(NPOS)
	}

	/// Closes the descriptor (idempotent; a no-op once empty). Retries on
	/// `EINTR`.
	pub fn close(&mut self) {
		let fd = self.release();
		if fd != NO_HANDLE {
			loop {
				match unistd::close(fd) {
					Err(Errno::EINTR) => continue,
					_ => break,
				}
			}
		}
	}

	/// Sets the descriptor blocking (`true`) or non-blocking (`false`) via
	/// `fcntl(F_GETFL)`/`F_SETFL`, retrying on `EINTR`. Returns `false` on
	/// error or if this handle is empty.
	pub fn set_blocking(&self, blocking: bool) -> bool {
		if !self.is_present() {
			return false;
		}
		let flags = loop {
			match fcntl::fcntl(self.0, FcntlArg::F_GETFL) {
				Ok(f) => break OFlag::from_bits_truncate(f),
				Err(Errno::EINTR) => continue,
				Err(_) => return false,
			}
		};
		let flags = if blocking {
			flags & !OFlag::O_NONBLOCK
		} else {
			flags | OFlag::O_NONBLOCK
		};
		loop {
			match fcntl::fcntl(self.0, FcntlArg::F_SETFL(flags)) {
				Ok(_) => return true,
				Err(Errno::EINTR) => continue,
				Err(_) => return false,
			}
		}
	}

	/// Duplicates the underlying descriptor onto a fresh one (`F_DUPFD`).
	/// Used by the supervisor when adopting a producer/consumer's own fd
	/// as a child-side descriptor, since moving the fd out of a trait
	/// object isn't available.
	pub fn try_clone(&self) -> Result<Self> {
		if !self.is_present() {
			return Ok(Self::default());
		}
		fcntl::fcntl(self.0, FcntlArg::F_DUPFD(0))
			.map(Self)
			.map_err(|e| Error::os("fcntl(F_DUPFD)", e))
	}
}

impl Drop for FileDescriptor {
	fn drop(&mut self) {
		self.close();
	}
}
