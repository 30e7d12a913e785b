//! The crate's single error type.
//!
//! Every fallible operation in this crate returns [`Result<T>`](Result), whose
//! error variants carry enough context (syscall name, `errno`, offending
//! handle) to be logged usefully by an embedder. Nothing in the public API
//! panics on caller-supplied input; `assert!`/`unreachable!` are still used
//! for internal invariants that would indicate a bug in this crate rather
//! than a misuse of it.

use crate::fd::Handle;

/// The crate's result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong launching and supervising a child process.
#[derive(Debug, thiserror::Error)]
pub enum Error {
	/// An OS call failed. `call` names the syscall for diagnostic purposes.
	#[error("{call} failed: {source}")]
	Os {
		/// The syscall that failed, e.g. `"pipe2"`, `"fork"`, `"mmap"`.
		call: &'static str,
		/// The underlying OS error.
		#[source]
		source: nix::Error,
	},
	/// `fork()` failed; no child process exists.
	#[error("fork failed: {source}")]
	Fork {
		/// The underlying OS error.
		#[source]
		source: nix::Error,
	},
	/// Two stream parameters disagreed about the same child-side handle,
	/// e.g. two producers bound to the same descriptor.
	#[error("conflicting stream binding for handle {handle}: {reason}")]
	ConflictingBinding {
		/// The child-side handle the conflict was detected on.
		handle: Handle,
		/// A human-readable description of the conflict.
		reason: &'static str,
	},
	/// Installing or removing a signal handler failed.
	#[error("signal handler {action} failed for signal {signal:?}: {source}")]
	SignalInstall {
		/// `"install"` or `"remove"`.
		action: &'static str,
		/// The signal type the operation was attempted on.
		signal: crate::signal::Type,
		/// The underlying OS error.
		#[source]
		source: nix::Error,
	},
}

impl Error {
	pub(crate) fn os(call: &'static str, source: nix::Error) -> Self {
		Self::Os { call, source }
	}
}
