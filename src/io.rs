//! Byte-source ([`Producer`]) and byte-sink ([`Consumer`]) contracts driven
//! by the supervisor's poll pump, plus the built-in variants named in the
//! data model.

use std::os::unix::io::RawFd;

use crate::fd::{FileDescriptor, NPOS};

/// A byte source the pump writes into the child.
///
/// `produce` is called whenever the parent-side descriptor is writable.
/// Returning [`NPOS`] signals end-of-stream and retires the producer;
/// returning `0` is legal and means "no progress this cycle" (the pump must
/// not treat that as EOF — see the premature-close fix in
/// [`crate::supervisor`]).
pub trait Producer {
	/// Writes as much as is currently available into `fd`, returning the
	/// byte count written, or [`NPOS`] on end-of-stream/terminal error.
	fn produce(&mut self, fd: &FileDescriptor) -> usize;

	/// If this producer already owns a suitable OS descriptor (e.g.
	/// [`FileProducer`]), advertise it so the supervisor can adopt it
	/// directly instead of opening a pipe. Default: not adoptable.
	fn owned_fd(&self) -> Option<RawFd> {
		None
	}
}

/// A byte sink the pump reads the child into.
///
/// `consume` is called whenever the parent-side descriptor is readable.
/// `true` means "did some work, keep registered"; `false` retires it.
pub trait Consumer {
	/// Reads what is currently available from `fd`. Returns `true` if it
	/// made progress and wants to stay registered, `false` if it is done.
	fn consume(&mut self, fd: &FileDescriptor) -> bool;

	/// Mirrors [`Producer::owned_fd`] for sinks that already hold a
	/// descriptor (e.g. [`FileConsumer`]).
	fn owned_fd(&self) -> Option<RawFd> {
		None
	}
}

const BUFFER_SIZE: usize = 4096;

/// Writes a caller-owned `&[u8]` to the child until exhausted.
pub struct StaticProducer<'a> {
	data: &'a [u8],
	pos: usize,
}

impl<'a> StaticProducer<'a> {
	/// Wraps `data` for writing to the child from the start.
	pub fn new(data: &'a [u8]) -> Self {
		Self { data, pos: 0 }
	}
}

impl<'a> Producer for StaticProducer<'a> {
	fn produce(&mut self, fd: &FileDescriptor) -> usize {
		if self.pos >= self.data.len() {
			return NPOS;
		}
		let count = fd.write(&self.data[self.pos..]);
		if count == NPOS {
			self.pos = self.data.len();
			return NPOS;
		}
		self.pos += count;
		count
	}
}

enum DynamicSource {
	Owned(Vec<u8>),
	Callback(Box<dyn FnMut(&mut [u8]) -> usize + Send>),
}

/// Writes either an owned byte string, or pulls from a user callback that
/// refills an internal 4 KiB buffer on demand (EOF when the callback
/// returns `0`).
pub struct DynamicProducer {
	source: DynamicSource,
	buffer: [u8; BUFFER_SIZE],
	pos: usize,
	size: usize,
	eof: bool,
}

impl DynamicProducer {
	/// Wraps an owned byte string to be written verbatim.
	pub fn from_bytes(content: Vec<u8>) -> Self {
		let eof = content.is_empty();
		Self {
			size: content.len(),
			source: DynamicSource::Owned(content),
			buffer: [0u8; BUFFER_SIZE],
			pos: 0,
			eof,
		}
	}

	/// Wraps a callback invoked to refill the internal buffer whenever it is
	/// exhausted; a `0` return signals EOF.
	pub fn from_callback(callback: impl FnMut(&mut [u8]) -> usize + Send + 'static) -> Self {
		Self {
			source: DynamicSource::Callback(Box::new(callback)),
			buffer: [0u8; BUFFER_SIZE],
			pos: 0,
			size: 0,
			eof: false,
		}
	}
}

impl Producer for DynamicProducer {
	fn produce(&mut self, fd: &FileDescriptor) -> usize {
		if self.pos >= self.size && !self.eof {
			match &mut self.source {
				DynamicSource::Owned(_) => {
					// the owned string is exhausted on first pass; nothing to refill
					self.eof = true;
				}
				DynamicSource::Callback(callback) => {
					self.pos = 0;
					self.size = callback(&mut self.buffer);
					if self.size == 0 {
						self.eof = true;
					}
				}
			}
		}
		if self.pos >= self.size {
			return NPOS;
		}
		let slice: &[u8] = match &self.source {
			DynamicSource::Owned(data) => &data[self.pos..self.size],
			DynamicSource::Callback(_) => &self.buffer[self.pos..self.size],
		};
		let count = fd.write(slice);
		if count == NPOS {
			self.eof = true;
			return NPOS;
		}
		self.pos += count;
		count
	}
}

/// Wraps an owned input file descriptor, reading into an internal 4 KiB
/// buffer and forwarding into the child. Exposes [`owned_fd`](Producer::owned_fd)
/// so the supervisor may adopt the held descriptor directly instead of
/// allocating a pipe.
pub struct FileProducer {
	fd: FileDescriptor,
	buffer: [u8; BUFFER_SIZE],
	pos: usize,
	size: usize,
}

impl FileProducer {
	/// Wraps an already-open, owned input file descriptor.
	pub fn new(fd: FileDescriptor) -> Self {
		Self {
			fd,
			buffer: [0u8; BUFFER_SIZE],
			pos: 0,
			size: 0,
		}
	}

	/// The size of the underlying file, via `fstat`.
	pub fn file_size(&self) -> usize {
		self.fd.file_size()
	}
}

impl Producer for FileProducer {
	fn produce(&mut self, fd: &FileDescriptor) -> usize {
		if self.pos >= self.size {
			self.pos = 0;
			self.size = self.fd.read(&mut self.buffer);
		}
		if self.size == 0 || self.size == NPOS {
			return NPOS;
		}
		let count = fd.write(&self.buffer[self.pos..self.size]);
		if count != NPOS {
			self.pos += count;
		}
		count
	}

	fn owned_fd(&self) -> Option<RawFd> {
		self.fd.is_present().then(|| self.fd.handle())
	}
}

/// Reads up to 4 KiB from the child and writes into an owned output file
/// descriptor. Exposes [`owned_fd`](Consumer::owned_fd) the same way
/// [`FileProducer`] does.
pub struct FileConsumer {
	fd: FileDescriptor,
	buffer: [u8; BUFFER_SIZE],
	pos: usize,
	size: usize,
	done: bool,
}

impl FileConsumer {
	/// Wraps an already-open, owned output file descriptor.
	pub fn new(fd: FileDescriptor) -> Self {
		Self {
			fd,
			buffer: [0u8; BUFFER_SIZE],
			pos: 0,
			size: 0,
			done: false,
		}
	}
}

impl Consumer for FileConsumer {
	fn consume(&mut self, fd: &FileDescriptor) -> bool {
		if self.done {
			return false;
		}
		if self.pos >= self.size {
			self.pos = 0;
			self.size = fd.read(&mut self.buffer);
		}
		if self.size == NPOS {
			self.done = true;
			return false;
		}
		if self.size == 0 {
			// EOF on the child side with nothing queued: nothing more to flush.
			self.done = true;
			return false;
		}
		let count = self.fd.write(&self.buffer[self.pos..self.size]);
		if count == NPOS {
			self.done = true;
			return false;
		}
		self.pos += count;
		true
	}

	fn owned_fd(&self) -> Option<RawFd> {
		self.fd.is_present().then(|| self.fd.handle())
	}
}

/// A [`Consumer`] that accumulates everything read into an owned `Vec<u8>`.
/// A test/demonstration fixture grounded on the "stdout -> user consumer
/// that accumulates into a byte buffer" end-to-end scenario.
#[derive(Debug, Default)]
pub struct Accumulate {
	buffer: Vec<u8>,
}

impl Accumulate {
	/// Creates an empty accumulator.
	pub fn new() -> Self {
		Self::default()
	}

	/// The bytes accumulated so far.
	pub fn bytes(&self) -> &[u8] {
		&self.buffer
	}

	/// Consumes `self`, returning the accumulated bytes.
	pub fn into_bytes(self) -> Vec<u8> {
		self.buffer
	}
}

impl Consumer for Accumulate {
	fn consume(&mut self, fd: &FileDescriptor) -> bool {
		let mut chunk = [0u8; BUFFER_SIZE];
		let count = fd.read(&mut chunk);
		if count == NPOS || count == 0 {
			return false;
		}
		self.buffer.extend_from_slice(&chunk[..count]);
		true
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn static_producer_drains_then_npos() {
		let (read, write) = FileDescriptor::open_unidirectional().unwrap();
		let mut producer = StaticProducer::new(b"hello");
		let n = producer.produce(&write);
		assert_eq!(n, 5);
		let mut buf = [0u8; 5];
		assert_eq!(read.read(&mut buf), 5);
		assert_eq!(producer.produce(&write), NPOS);
	}

	#[test]
	fn dynamic_producer_from_bytes_drains_then_npos() {
		let (read, write) = FileDescriptor::open_unidirectional().unwrap();
		let mut producer = DynamicProducer::from_bytes(b"abc".to_vec());
		assert_eq!(producer.produce(&write), 3);
		let mut buf = [0u8; 3];
		assert_eq!(read.read(&mut buf), 3);
		assert_eq!(producer.produce(&write), NPOS);
	}

	#[test]
	fn dynamic_producer_empty_bytes_is_immediate_npos() {
		let (_read, write) = FileDescriptor::open_unidirectional().unwrap();
		let mut producer = DynamicProducer::from_bytes(Vec::new());
		assert_eq!(producer.produce(&write), NPOS);
	}

	#[test]
	fn dynamic_producer_callback_eof_on_zero() {
		let (read, write) = FileDescriptor::open_unidirectional().unwrap();
		let mut calls = 0;
		let mut producer = DynamicProducer::from_callback(move |buf| {
			calls += 1;
			if calls == 1 {
				buf[..3].copy_from_slice(b"xyz");
				3
			} else {
				0
			}
		});
		assert_eq!(producer.produce(&write), 3);
		let mut buf = [0u8; 3];
		assert_eq!(read.read(&mut buf), 3);
		assert_eq!(producer.produce(&write), NPOS);
	}

	#[test]
	fn file_producer_advertises_owned_fd() {
		let (read, _write) = FileDescriptor::open_unidirectional().unwrap();
		let producer = FileProducer::new(read);
		assert!(producer.owned_fd().is_some());
	}

	#[test]
	fn accumulate_collects_bytes_until_eof() {
		let (read, write) = FileDescriptor::open_unidirectional().unwrap();
		write.write(b"hello\n");
		drop(write);
		let mut acc = Accumulate::new();
		while acc.consume(&read) {}
		assert_eq!(acc.into_bytes(), b"hello\n");
	}
}
