//! An anonymous `MAP_SHARED` region sized to one value, visible across
//! `fork()`.

use std::{marker::PhantomData, num::NonZeroUsize, ptr::NonNull};

use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};

use crate::error::{Error, Result};

/// A `MAP_SHARED | MAP_ANONYMOUS` region the size of `T`, created before
/// `fork()` so parent and child(ren) observe the same bytes.
///
/// `T` is initialized in place at construction and the mapping is released
/// (via `munmap`) at `Drop`. Single-writer/single-reader discipline between
/// parent and the timing wrapper subprocess is a usage contract this type
/// does not itself enforce.
pub struct SharedMemory<T> {
	ptr: NonNull<T>,
	_marker: PhantomData<T>,
}

// Safety: the mapping is valid in every process that shares it post-fork,
// and `T` itself is required to be `Send` for that sharing to be sound.
unsafe impl<T: Send> Send for SharedMemory<T> {}
unsafe impl<T: Send> Sync for SharedMemory<T> {}

impl<T: Default> SharedMemory<T> {
	/// Allocates the region and initializes it with `T::default()`.
	pub fn new() -> Result<Self> {
		Self::with(T::default())
	}
}

impl<T> SharedMemory<T> {
	/// Allocates the region and initializes it with `value`.
	pub fn with(value: T) -> Result<Self> {
		let len = NonZeroUsize::new(std::mem::size_of::<T>().max(1))
			.expect("size_of::<T>() clamped to at least 1");
		// Safety: anonymous mapping, no backing file descriptor.
		let ptr = unsafe {
			mmap_anonymous(
				None,
				len,
				ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
				MapFlags::MAP_SHARED,
			)
		}
		.map_err(|e| Error::os("mmap", e))?;
		let ptr = ptr.cast::<T>();
		// Safety: the mapping is large enough for one `T` and correctly
		// aligned (page-aligned mappings satisfy any natural alignment).
		unsafe { ptr.as_ptr().write(value) };
		Ok(Self {
			ptr,
			_marker: PhantomData,
		})
	}

	/// Raw pointer to the shared value, valid in any process that shares the
	/// mapping (i.e. any descendant forked after construction).
	pub fn as_ptr(&self) -> *mut T {
		self.ptr.as_ptr()
	}

	/// Reads the current value by copy. Safe to call any time after the
	/// writer (if any, e.g. a forked timing wrapper) has finished writing.
	pub fn get(&self) -> T
	where
		T: Copy,
	{
		// Safety: the pointer is valid for the lifetime of `self`.
		unsafe { self.ptr.as_ptr().read() }
	}
}

impl<T> Drop for SharedMemory<T> {
	fn drop(&mut self) {
		// Safety: `self.ptr` was obtained from `mmap_anonymous` with this
		// same length and is dropped only once.
		unsafe {
			std::ptr::drop_in_place(self.ptr.as_ptr());
			let _ = munmap(
				self.ptr.cast::<std::ffi::c_void>(),
				std::mem::size_of::<T>().max(1),
			);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn read_write_roundtrip() {
		let mem = SharedMemory::with(42u32);
		let mem = mem.unwrap();
		assert_eq!(mem.get(), 42);
		unsafe { mem.as_ptr().write(7) };
		assert_eq!(mem.get(), 7);
	}

	#[test]
	fn default_initializes_zeroed_record() {
		#[derive(Default, Clone, Copy)]
		struct Counters {
			a: u32,
			b: u32,
		}
		let mem = SharedMemory::<Counters>::new().unwrap();
		let value = mem.get();
		assert_eq!(value.a, 0);
		assert_eq!(value.b, 0);
	}
}
