//! Optional launch-time plug-ins attached to a [`Supervisor`](crate::supervisor::Supervisor)
//! run: process-handle bookkeeping and wall/user/sys timing.
//!
//! [`Feature`] exists so the supervisor's launch path never needs to
//! downcast a trait object to find out which concrete features are present
//! (the problem the `ProducerFile`/`ConsumerFile` `dynamic_cast` checks in
//! the system this crate's engine is modeled on worked around differently).
//! Every hook has a no-op default; a feature implements only the ones it
//! needs.

use nix::{
	sys::signal::Signal,
	unistd::Pid,
};

/// A launch-time plug-in. All methods are optional; default implementations
/// do nothing.
pub trait Feature {
	/// Called in the parent immediately after `fork()` succeeds, with the
	/// child's pid.
	fn on_launch(&mut self, _pid: Pid) {}

	/// Called in the parent once the child has been reaped.
	fn on_exit(&mut self) {}

	/// `true` if this feature needs a [`SharedMemory<TimingRecord>`](crate::shared_memory::SharedMemory)
	/// region allocated and the timing wrapper double-fork engaged for this
	/// launch. The supervisor allocates the region once per launch if any
	/// attached feature returns `true` here.
	fn wants_timing(&self) -> bool {
		false
	}

	/// Called in the parent, before `fork()`, with the raw pointer to the
	/// shared timing record (valid only if [`wants_timing`](Feature::wants_timing)
	/// returned `true` for at least one feature this launch).
	fn attach_shared(&mut self, _record: *const TimingRecord) {}

	/// Called in the parent once the child has been reaped and the shared
	/// region is about to be released. Implementations that care about
	/// timing data must snapshot it here; the pointer passed to
	/// [`attach_shared`](Feature::attach_shared) is not valid afterwards.
	fn detach_shared(&mut self) {}
}

/// Wall/user/sys milliseconds captured by the timing wrapper, written once
/// by the wrapper process and read by the parent after reaping.
#[derive(Debug, Default, Clone, Copy)]
pub struct TimingRecord {
	/// Wall-clock milliseconds between the wrapper's pre- and post-exec
	/// `gettimeofday` calls.
	pub real_ms: u32,
	/// User CPU milliseconds, from `times()`, converted via `sysconf(_SC_CLK_TCK)`.
	pub user_ms: u32,
	/// System CPU milliseconds, from `times()`, converted via `sysconf(_SC_CLK_TCK)`.
	pub sys_ms: u32,
}

/// Tracks the launched process's pid and offers `stop`/`kill` conveniences.
///
/// Grounded on the "stop sends SIGTERM, kill sends SIGKILL" pairing in the
/// process-handle feature of the system this crate's engine is modeled on.
#[derive(Debug, Default)]
pub struct FeatureProcess {
	pid: Option<Pid>,
}

impl FeatureProcess {
	/// Creates an unattached handle; call sites attach it to a launch via
	/// [`Supervisor::launch`](crate::supervisor::Supervisor::launch).
	pub fn new() -> Self {
		Self::default()
	}

	/// The launched process's pid, once known.
	pub fn pid(&self) -> Option<Pid> {
		self.pid
	}

	/// Sends `SIGTERM` to the tracked process, if any.
	pub fn stop(&self) {
		if let Some(pid) = self.pid {
			let _ = nix::sys::signal::kill(pid, Signal::SIGTERM);
		}
	}

	/// Sends `SIGKILL` to the tracked process, if any.
	pub fn kill(&self) {
		if let Some(pid) = self.pid {
			let _ = nix::sys::signal::kill(pid, Signal::SIGKILL);
		}
	}
}

impl Feature for FeatureProcess {
	fn on_launch(&mut self, pid: Pid) {
		self.pid = Some(pid);
	}

	fn on_exit(&mut self) {
		self.pid = None;
	}
}

/// Captures the launched process's wall/user/sys timing via the supervisor's
/// timing wrapper.
///
/// `attach_shared`/`detach_shared` straddle the window during which the
/// pointer it is given is backed by live shared memory; the record is
/// copied out at `detach_shared` so the getters remain valid once that
/// memory is released.
#[derive(Debug, Default)]
pub struct FeatureTime {
	shared: Option<*const TimingRecord>,
	record: TimingRecord,
}

// Safety: the pointer is only ever read while the shared mapping backing it
// is alive (between `attach_shared` and `detach_shared`), which the
// supervisor's launch sequencing guarantees.
unsafe impl Send for FeatureTime {}

impl FeatureTime {
	/// Creates an unattached timing handle.
	pub fn new() -> Self {
		Self::default()
	}

	/// Wall-clock milliseconds of the most recently completed launch.
	pub fn real_ms(&self) -> u32 {
		self.record.real_ms
	}

	/// User CPU milliseconds of the most recently completed launch.
	pub fn user_ms(&self) -> u32 {
		self.record.user_ms
	}

	/// System CPU milliseconds of the most recently completed launch.
	pub fn sys_ms(&self) -> u32 {
		self.record.sys_ms
	}
}

impl Feature for FeatureTime {
	fn wants_timing(&self) -> bool {
		true
	}

	fn attach_shared(&mut self, record: *const TimingRecord) {
		self.shared = Some(record);
	}

	fn detach_shared(&mut self) {
		if let Some(ptr) = self.shared.take() {
			// Safety: the supervisor calls `detach_shared` only while the
			// shared mapping is still alive.
			self.record = unsafe { *ptr };
		}
	}
}
