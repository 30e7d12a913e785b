//! A process-wide signal bus: one OS signal handler per signal type, fanned
//! out to any number of registered listeners.
//!
//! The registry backing this is a fixed-size array of fixed-size slot lists,
//! never a `HashMap` and never behind a `Mutex` — both would be unsound to
//! touch from inside a real signal handler (allocation and lock acquisition
//! are not async-signal-safe). Slots are claimed and released with plain
//! atomics instead.
//!
//! The system this crate's engine is modeled on aliased `SIGCHLD` onto the
//! `SIGILL` table slot; here every [`Type`] gets its own distinct slot.

use std::sync::atomic::{AtomicUsize, Ordering};

use libc::c_int;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::error::{Error, Result};

/// The signal types this bus can dispatch. Each variant owns one fixed slot
/// list in the registry, regardless of whether the underlying OS signal
/// numbers happen to collide on some platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
	Hangup,
	Interrupt,
	Quit,
	Illegal,
	Trap,
	Abort,
	BusError,
	FloatingPointException,
	SegmentationViolation,
	User1,
	User2,
	Alarm,
	Child,
	StackFault,
	Terminate,
	Pipe,
}

const TYPE_COUNT: usize = 16;

impl Type {
	fn index(self) -> usize {
		match self {
			Type::Hangup => 0,
			Type::Interrupt => 1,
			Type::Quit => 2,
			Type::Illegal => 3,
			Type::Trap => 4,
			Type::Abort => 5,
			Type::BusError => 6,
			Type::FloatingPointException => 7,
			Type::SegmentationViolation => 8,
			Type::User1 => 9,
			Type::User2 => 10,
			Type::Alarm => 11,
			Type::Child => 12,
			Type::StackFault => 13,
			Type::Terminate => 14,
			Type::Pipe => 15,
		}
	}

	fn signal(self) -> Signal {
		match self {
			Type::Hangup => Signal::SIGHUP,
			Type::Interrupt => Signal::SIGINT,
			Type::Quit => Signal::SIGQUIT,
			Type::Illegal => Signal::SIGILL,
			Type::Trap => Signal::SIGTRAP,
			Type::Abort => Signal::SIGABRT,
			Type::BusError => Signal::SIGBUS,
			Type::FloatingPointException => Signal::SIGFPE,
			Type::SegmentationViolation => Signal::SIGSEGV,
			Type::User1 => Signal::SIGUSR1,
			Type::User2 => Signal::SIGUSR2,
			Type::Alarm => Signal::SIGALRM,
			Type::Child => Signal::SIGCHLD,
			#[cfg(target_os = "linux")]
			Type::StackFault => Signal::SIGSTKFLT,
			#[cfg(not(target_os = "linux"))]
			Type::StackFault => Signal::SIGSYS,
			Type::Terminate => Signal::SIGTERM,
			Type::Pipe => Signal::SIGPIPE,
		}
	}

	fn from_index(index: usize) -> Self {
		const ORDER: [Type; TYPE_COUNT] = [
			Type::Hangup,
			Type::Interrupt,
			Type::Quit,
			Type::Illegal,
			Type::Trap,
			Type::Abort,
			Type::BusError,
			Type::FloatingPointException,
			Type::SegmentationViolation,
			Type::User1,
			Type::User2,
			Type::Alarm,
			Type::Child,
			Type::StackFault,
			Type::Terminate,
			Type::Pipe,
		];
		ORDER[index]
	}
}

/// Slots per signal type. Registering a seventeenth listener for the same
/// type on a bus already full for that type panics; every real use of this
/// bus registers a handful of long-lived listeners, not an unbounded stream.
const SLOTS_PER_TYPE: usize = 16;

/// Non-allocating callback storage: a function pointer plus an opaque
/// context pointer, both stored as `usize` so the slot array can be a plain
/// `[AtomicUsize; N]` safely touched from a signal handler.
struct Slot {
	function: AtomicUsize,
	context: AtomicUsize,
}

impl Slot {
	const fn empty() -> Self {
		Self {
			function: AtomicUsize::new(0),
			context: AtomicUsize::new(0),
		}
	}
}

struct TypeTable {
	slots: [Slot; SLOTS_PER_TYPE],
	installed: AtomicUsize,
	original: std::sync::Mutex<Option<SigAction>>,
}

impl TypeTable {
	const fn new() -> Self {
		const EMPTY: Slot = Slot::empty();
		Self {
			slots: [EMPTY; SLOTS_PER_TYPE],
			installed: AtomicUsize::new(0),
			original: std::sync::Mutex::new(None),
		}
	}
}

struct Registry {
	tables: [TypeTable; TYPE_COUNT],
}

impl Registry {
	fn table(&self, ty: Type) -> &TypeTable {
		&self.tables[ty.index()]
	}
}

lazy_static::lazy_static! {
	static ref REGISTRY: Registry = Registry {
		tables: [
			TypeTable::new(), TypeTable::new(), TypeTable::new(), TypeTable::new(),
			TypeTable::new(), TypeTable::new(), TypeTable::new(), TypeTable::new(),
			TypeTable::new(), TypeTable::new(), TypeTable::new(), TypeTable::new(),
			TypeTable::new(), TypeTable::new(), TypeTable::new(), TypeTable::new(),
		],
	};
}

extern "C" fn dispatch(signum: c_int) {
	for index in 0..TYPE_COUNT {
		let ty = Type::from_index(index);
		if ty.signal() as c_int != signum {
			continue;
		}
		let table = REGISTRY.table(ty);
		for slot in table.slots.iter() {
			let function = slot.function.load(Ordering::SeqCst);
			if function == 0 {
				continue;
			}
			let context = slot.context.load(Ordering::SeqCst);
			// Safety: `function`/`context` were stored by `SignalBus::install`
			// from a live `fn(usize)` and its context, and are cleared before
			// the `Handle` that owns them is dropped.
			let callback: fn(usize) = unsafe { std::mem::transmute(function) };
			callback(context);
		}
	}
}

/// Registers a handler for `ty` and returns a move-only [`Handle`] that
/// removes the registration (and, if it was the last one for that type,
/// restores the previous `sigaction`) when dropped.
///
/// `callback` is a plain function pointer plus a `usize` context rather than
/// a closure: the dispatcher above may run inside a real signal handler, so
/// anything it touches must not allocate or lock. Callers who need richer
/// state typically pass the address of a `static` or a leaked/boxed value as
/// `context`.
pub struct SignalBus;

impl SignalBus {
	/// Installs `callback` for `ty`, installing the OS-level `sigaction` the
	/// first time any listener registers for this type.
	pub fn install(ty: Type, callback: fn(usize), context: usize) -> Result<Handle> {
		let table = REGISTRY.table(ty);
		let mut claimed = None;
		for (index, slot) in table.slots.iter().enumerate() {
			if slot
				.function
				.compare_exchange(0, callback as usize, Ordering::SeqCst, Ordering::SeqCst)
				.is_ok()
			{
				slot.context.store(context, Ordering::SeqCst);
				claimed = Some(index);
				break;
			}
		}
		let index = claimed.expect("signal bus slot table full for this signal type");

		if table.installed.fetch_add(1, Ordering::SeqCst) == 0 {
			let action = SigAction::new(
				SigHandler::Handler(dispatch),
				SaFlags::SA_RESTART,
				SigSet::empty(),
			);
			// Safety: `action` calls only into `dispatch`, which in turn calls
			// only into previously-registered `fn(usize)` callbacks.
			let previous = unsafe { signal::sigaction(ty.signal(), &action) }
				.map_err(|e| Error::SignalInstall {
					action: "install",
					signal: ty,
					source: e,
				})?;
			*table.original.lock().expect("signal table lock poisoned") = Some(previous);
			tracing::debug!(?ty, "sigaction installed");
		}

		tracing::debug!(?ty, index, "signal listener registered");
		Ok(Handle { ty, index })
	}
}

/// A move-only registration token. Dropping it removes the listener and,
/// when it was the last for that signal type, restores the previously
/// installed `sigaction`.
pub struct Handle {
	ty: Type,
	index: usize,
}

impl Drop for Handle {
	fn drop(&mut self) {
		let table = REGISTRY.table(self.ty);
		table.slots[self.index].function.store(0, Ordering::SeqCst);
		table.slots[self.index].context.store(0, Ordering::SeqCst);
		tracing::debug!(ty = ?self.ty, index = self.index, "signal listener removed");

		if table.installed.fetch_sub(1, Ordering::SeqCst) == 1 {
			if let Some(previous) = table
				.original
				.lock()
				.expect("signal table lock poisoned")
				.take()
			{
				// Safety: restoring the handler this bus itself displaced.
				let _ = unsafe { signal::sigaction(self.ty.signal(), &previous) };
				tracing::debug!(ty = ?self.ty, "sigaction restored");
			}
		}
	}
}

/// Sends `signal` to `pid`. A no-op if `pid` is `None`, mirroring the
/// process-handle feature's tolerance for "nothing to signal yet".
pub fn kill(pid: Option<nix::unistd::Pid>, ty: Type) -> Result<()> {
	match pid {
		Some(pid) => nix::sys::signal::kill(pid, ty.signal())
			.map_err(|e| Error::os("kill", e)),
		None => Ok(()),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::AtomicBool;

	static FIRED: AtomicBool = AtomicBool::new(false);

	fn mark_fired(_context: usize) {
		FIRED.store(true, Ordering::SeqCst);
	}

	#[test]
	fn install_and_drop_roundtrip() {
		FIRED.store(false, Ordering::SeqCst);
		let handle = SignalBus::install(Type::User1, mark_fired, 0).unwrap();
		nix::sys::signal::raise(Signal::SIGUSR1).unwrap();
		// give the handler a moment to run synchronously (signal delivery on
		// the raising thread is effectively immediate on Linux).
		assert!(FIRED.load(Ordering::SeqCst));
		drop(handle);
	}

	#[test]
	fn child_and_illegal_do_not_share_a_slot() {
		assert_ne!(Type::Child.index(), Type::Illegal.index());
		assert_ne!(Type::Child.signal(), Type::Illegal.signal());
	}

	#[test]
	fn kill_with_no_pid_is_a_noop() {
		assert!(kill(None, Type::Terminate).is_ok());
	}
}
