//! The launch engine: fork/exec, descriptor wiring, the bidirectional I/O
//! pump, and the optional timing wrapper.

use std::os::unix::io::{AsRawFd, BorrowedFd, RawFd};

use nix::{
	errno::Errno,
	fcntl::{self, FcntlArg, OFlag},
	poll::{poll, PollFd, PollFlags},
	sys::{
		signal::Signal,
		stat::Mode,
		wait::{waitpid, WaitStatus},
	},
	unistd::{self, execvp, execvpe, fork, ForkResult, Pid},
};

use crate::{
	argument::Arguments,
	environment::Environment,
	error::{Error, Result},
	fd::{FileDescriptor, Handle, NO_HANDLE},
	feature::{Feature, TimingRecord},
	io::{Consumer, Producer},
	shared_memory::SharedMemory,
};

/// How a child exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
	/// Exited via `exit()`/`_exit()` (or fell off `main`) with this code.
	Exited(i32),
	/// Killed by a signal.
	Signaled(Signal),
}

impl ExitStatus {
	/// Shell-style exit code: the raw code if it exited normally, or
	/// `128 + signum` if it was signaled.
	pub fn code(self) -> i32 {
		match self {
			ExitStatus::Exited(code) => code,
			ExitStatus::Signaled(signal) => 128 + signal as i32,
		}
	}

	/// `true` iff the child exited normally with code `0`.
	pub fn success(self) -> bool {
		matches!(self, ExitStatus::Exited(0))
	}
}

/// One child-side descriptor's binding, as supplied to [`Supervisor::launch`].
pub enum StreamParam {
	/// Leave `handle` unbound; the leak sweep closes whatever the child
	/// would otherwise have inherited there.
	Close(Handle),
	/// Feed `producer`'s bytes into the child at `handle`.
	Produce(Handle, Box<dyn Producer>),
	/// Drain the child's `handle` into `consumer`.
	Consume(Handle, Box<dyn Consumer>),
	/// Bind both a producer and a consumer to the same `handle` over one
	/// bidirectional descriptor (e.g. a control socket).
	Duplex(Handle, Box<dyn Producer>, Box<dyn Consumer>),
}

impl StreamParam {
	fn handle(&self) -> Handle {
		match self {
			StreamParam::Close(h)
			| StreamParam::Produce(h, _)
			| StreamParam::Consume(h, _)
			| StreamParam::Duplex(h, _, _) => *h,
		}
	}
}

struct Binding {
	handle: Handle,
	child_fd: FileDescriptor,
	parent_fd: Option<FileDescriptor>,
	producer: Option<Box<dyn Producer>>,
	consumer: Option<Box<dyn Consumer>>,
	/// `true` when producer and consumer share one descriptor (a duplex
	/// socket): the parent-side fd must stay open until *both* sides have
	/// retired, not just whichever retires first.
	shared_fd: bool,
	producer_done: bool,
	consumer_done: bool,
}

fn dup_raw(fd: RawFd) -> Result<FileDescriptor> {
	fcntl::fcntl(fd, FcntlArg::F_DUPFD(0))
		.map(FileDescriptor::from_raw)
		.map_err(|e| Error::os("fcntl(F_DUPFD)", e))
}

/// Launches and supervises one process at a time.
///
/// A single `Supervisor` is reused across launches; `pid` reflects whichever
/// launch is currently in flight and resets to `None` once it has been
/// reaped.
pub struct Supervisor {
	arguments: Arguments,
	environment: Option<Environment>,
	working_directory: Option<String>,
	pid: Option<Pid>,
}

impl Supervisor {
	/// Creates a supervisor for `arguments`, inheriting the parent's
	/// environment and working directory unless overridden.
	pub fn new(arguments: Arguments) -> Self {
		tracing::debug!(command = %arguments.command_line(), "supervisor created");
		Self {
			arguments,
			environment: None,
			working_directory: None,
			pid: None,
		}
	}

	/// Overrides the child's environment; without this, `execvp` is used and
	/// the child inherits the parent's environment.
	pub fn with_environment(mut self, environment: Environment) -> Self {
		self.environment = Some(environment);
		self
	}

	/// Overrides the child's working directory.
	pub fn with_working_directory(mut self, directory: impl Into<String>) -> Self {
		self.working_directory = Some(directory.into());
		self
	}

	/// The pid of the in-flight launch, if any.
	pub fn pid(&self) -> Option<Pid> {
		self.pid
	}

	fn realize(streams: Vec<StreamParam>) -> Result<Vec<Binding>> {
		let mut seen = Vec::with_capacity(streams.len());
		for stream in &streams {
			let handle = stream.handle();
			if seen.contains(&handle) {
				return Err(Error::ConflictingBinding {
					handle,
					reason: "handle bound more than once in this launch",
				});
			}
			seen.push(handle);
		}

		streams
			.into_iter()
			.map(|stream| {
				let handle = stream.handle();
				let (binding, kind) = match stream {
					StreamParam::Close(handle) => (
						Binding {
							handle,
							child_fd: FileDescriptor::default(),
							parent_fd: None,
							producer: None,
							consumer: None,
							shared_fd: false,
							producer_done: true,
							consumer_done: true,
						},
						"close",
					),
					StreamParam::Produce(handle, producer) => {
						if let Some(owned) = producer.owned_fd() {
							(
								Binding {
									handle,
									child_fd: dup_raw(owned)?,
									parent_fd: None,
									producer: None,
									consumer: None,
									shared_fd: false,
									producer_done: true,
									consumer_done: true,
								},
								"adopted producer fd",
							)
						} else {
							let (read, write) = FileDescriptor::open_unidirectional()?;
							(
								Binding {
									handle,
									child_fd: read,
									parent_fd: Some(write),
									producer: Some(producer),
									consumer: None,
									shared_fd: false,
									producer_done: false,
									consumer_done: true,
								},
								"pipe (produce)",
							)
						}
					}
					StreamParam::Consume(handle, consumer) => {
						if let Some(owned) = consumer.owned_fd() {
							(
								Binding {
									handle,
									child_fd: dup_raw(owned)?,
									parent_fd: None,
									producer: None,
									consumer: None,
									shared_fd: false,
									producer_done: true,
									consumer_done: true,
								},
								"adopted consumer fd",
							)
						} else {
							let (read, write) = FileDescriptor::open_unidirectional()?;
							(
								Binding {
									handle,
									child_fd: write,
									parent_fd: Some(read),
									producer: None,
									consumer: Some(consumer),
									shared_fd: false,
									producer_done: true,
									consumer_done: false,
								},
								"pipe (consume)",
							)
						}
					}
					StreamParam::Duplex(handle, producer, consumer) => {
						let (parent_end, child_end) = FileDescriptor::open_bidirectional()?;
						(
							Binding {
								handle,
								child_fd: child_end,
								parent_fd: Some(parent_end),
								producer: Some(producer),
								consumer: Some(consumer),
								shared_fd: true,
								producer_done: false,
								consumer_done: false,
							},
							"socketpair (duplex)",
						)
					}
				};
				tracing::debug!(handle, kind, "binding realized");
				Ok(binding)
			})
			.collect()
	}

	/// Launches the configured command with `streams` wired into the child
	/// and `features` attached, blocking until the child exits.
	pub fn launch(
		&mut self,
		streams: Vec<StreamParam>,
		features: &mut [&mut dyn Feature],
	) -> Result<ExitStatus> {
		let mut bindings = Self::realize(streams)?;

		let wants_timing = features.iter().any(|f| f.wants_timing());
		let timing = if wants_timing {
			Some(SharedMemory::<TimingRecord>::new()?)
		} else {
			None
		};
		if let Some(timing) = &timing {
			for feature in features.iter_mut() {
				feature.attach_shared(timing.as_ptr());
			}
		}

		tracing::debug!(
			command = %self.arguments.command_line(),
			bindings = bindings.len(),
			wants_timing,
			"launching child"
		);

		// Safety: this process is single-threaded from the supervisor's point
		// of view at the fork point; the child only ever performs
		// async-signal-safe-adjacent syscalls before exec.
		match unsafe { fork() }.map_err(|e| Error::Fork { source: e })? {
			ForkResult::Child => {
				Self::run_child(
					&self.arguments,
					self.environment.as_ref(),
					self.working_directory.as_deref(),
					&bindings,
					timing.as_ref().map(|t| t.as_ptr()),
				);
				unreachable!("run_child always calls _exit");
			}
			ForkResult::Parent { child } => {
				for binding in &mut bindings {
					binding.child_fd.close();
				}
				self.pid = Some(child);
				for feature in features.iter_mut() {
					feature.on_launch(child);
				}

				let status = Self::pump(&mut bindings, child)?;

				if let Some(timing) = &timing {
					let _ = timing;
				}
				for feature in features.iter_mut() {
					feature.detach_shared();
					feature.on_exit();
				}
				self.pid = None;

				tracing::debug!(?status, "child reaped");
				Ok(status)
			}
		}
	}

	fn pump(bindings: &mut [Binding], child: Pid) -> Result<ExitStatus> {
		loop {
			let mut fds = Vec::new();
			let mut indices = Vec::new();
			for (index, binding) in bindings.iter().enumerate() {
				let Some(parent_fd) = &binding.parent_fd else {
					continue;
				};
				if !parent_fd.is_present() {
					continue;
				}
				let mut flags = PollFlags::empty();
				if binding.producer.is_some() && !binding.producer_done {
					flags |= PollFlags::POLLOUT;
				}
				if binding.consumer.is_some() && !binding.consumer_done {
					flags |= PollFlags::POLLIN;
				}
				if flags.is_empty() {
					continue;
				}
				// Safety: `parent_fd` outlives this poll call; `BorrowedFd`
				// here does not take ownership or close anything.
				let borrowed = unsafe { BorrowedFd::borrow_raw(parent_fd.handle()) };
				fds.push(PollFd::new(borrowed, flags));
				indices.push(index);
			}

			if fds.is_empty() {
				break;
			}

			loop {
				match poll(&mut fds, -1) {
					Ok(_) => break,
					Err(Errno::EINTR) => continue,
					Err(e) => return Err(Error::os("poll", e)),
				}
			}

			for (poll_fd, &index) in fds.iter().zip(indices.iter()) {
				let revents = poll_fd.revents().unwrap_or_else(PollFlags::empty);
				let binding = &mut bindings[index];
				if revents.contains(PollFlags::POLLOUT) && !binding.producer_done {
					let parent_fd = binding.parent_fd.as_ref().expect("producer fd present");
					let producer = binding.producer.as_mut().expect("producer present");
					if producer.produce(parent_fd) == crate::fd::NPOS {
						binding.producer_done = true;
					}
				}
				if revents.contains(PollFlags::POLLIN) && !binding.consumer_done {
					let parent_fd = binding.parent_fd.as_ref().expect("consumer fd present");
					let consumer = binding.consumer.as_mut().expect("consumer present");
					if !consumer.consume(parent_fd) {
						binding.consumer_done = true;
					}
				}
				if revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR) {
					binding.producer_done = true;
					binding.consumer_done = true;
				}

				// Only close once *both* sides of a shared descriptor have
				// retired; for unshared descriptors either side retiring
				// is the whole story.
				let fully_retired = if binding.shared_fd {
					binding.producer_done && binding.consumer_done
				} else {
					(binding.producer.is_none() || binding.producer_done)
						&& (binding.consumer.is_none() || binding.consumer_done)
				};
				if fully_retired {
					if let Some(parent_fd) = &mut binding.parent_fd {
						parent_fd.close();
					}
				}
			}
		}

		loop {
			match waitpid(child, None) {
				Ok(WaitStatus::Exited(_, code)) => return Ok(ExitStatus::Exited(code)),
				Ok(WaitStatus::Signaled(_, signal, _)) => {
					return Ok(ExitStatus::Signaled(signal))
				}
				Ok(_) => continue,
				Err(Errno::EINTR) => continue,
				Err(e) => return Err(Error::os("waitpid", e)),
			}
		}
	}

	fn run_child(
		arguments: &Arguments,
		environment: Option<&Environment>,
		working_directory: Option<&str>,
		bindings: &[Binding],
		timing: Option<*mut TimingRecord>,
	) -> ! {
		unsafe {
			libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM as libc::c_ulong, 0, 0, 0);
		}

		if let Err(_e) = rewire(bindings) {
			die("descriptor wiring failed");
		}
		if let Err(_e) = sweep_leaked_descriptors(bindings) {
			die("descriptor sweep failed");
		}
		if let Some(dir) = working_directory {
			if unistd::chdir(dir).is_err() {
				die("chdir failed");
			}
		}

		match timing {
			Some(record) => run_with_timing_wrapper(arguments, environment, record),
			None => exec(arguments, environment),
		}
	}
}

fn rewire(bindings: &[Binding]) -> Result<()> {
	let targets: Vec<(Handle, RawFd)> = bindings
		.iter()
		.filter(|b| b.child_fd.is_present())
		.map(|b| (b.handle, b.child_fd.handle()))
		.collect();
	if targets.is_empty() {
		return Ok(());
	}
	let floor = targets.iter().map(|(h, _)| *h).max().unwrap_or(0) + 1;

	let mut escapes = Vec::with_capacity(targets.len());
	for (target, fd) in &targets {
		let escape = loop {
			match fcntl::fcntl(*fd, FcntlArg::F_DUPFD(floor)) {
				Ok(new_fd) => break new_fd,
				Err(Errno::EINTR) => continue,
				Err(e) => return Err(Error::os("fcntl(F_DUPFD)", e)),
			}
		};
		escapes.push((*target, escape));
	}
	for (target, escape) in escapes {
		loop {
			match unistd::dup2(escape, target) {
				Ok(_) => break,
				Err(Errno::EINTR) => continue,
				Err(e) => return Err(Error::os("dup2", e)),
			}
		}
		let _ = unistd::close(escape);
	}
	Ok(())
}

fn sweep_leaked_descriptors(bindings: &[Binding]) -> Result<()> {
	let kept: Vec<Handle> = bindings
		.iter()
		.filter(|b| b.child_fd.is_present())
		.map(|b| b.handle)
		.collect();

	let dir = nix::dir::Dir::open(
		"/proc/self/fd",
		OFlag::O_RDONLY | OFlag::O_DIRECTORY,
		Mode::empty(),
	)
	.map_err(|e| Error::os("opendir", e))?;
	let dir_fd = dir.as_raw_fd();

	let mut to_close = Vec::new();
	for entry in dir.into_iter().flatten() {
		let name = entry.file_name().to_string_lossy().into_owned();
		let Ok(fd) = name.parse::<RawFd>() else {
			continue;
		};
		if fd == dir_fd || fd == NO_HANDLE {
			continue;
		}
		if kept.contains(&fd) {
			continue;
		}
		to_close.push(fd);
	}
	for fd in to_close {
		let _ = unistd::close(fd);
	}
	Ok(())
}

fn die(message: &str) -> ! {
	let _ = unistd::write(2, message.as_bytes());
	let _ = unistd::write(2, b"\n");
	unistd::_exit(libc::EXIT_FAILURE);
}

fn exec(arguments: &Arguments, environment: Option<&Environment>) -> ! {
	let tokens = arguments.tokens();
	let program = tokens
		.first()
		.expect("arguments must contain a program name")
		.as_c_str();
	let result = match environment {
		Some(env) => execvpe(program, tokens, env.entries()),
		None => execvp(program, tokens),
	};
	if let Err(_e) = result {
		die("exec failed");
	}
	unreachable!("execvp(e) only returns on error");
}

fn run_with_timing_wrapper(
	arguments: &Arguments,
	environment: Option<&Environment>,
	record: *mut TimingRecord,
) -> ! {
	let clock_ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) }.max(1) as i64;

	let mut start_time: libc::timeval = unsafe { std::mem::zeroed() };
	unsafe { libc::gettimeofday(&mut start_time, std::ptr::null_mut()) };
	let mut start_tms: libc::tms = unsafe { std::mem::zeroed() };
	unsafe { libc::times(&mut start_tms) };

	// Safety: the wrapper is still single-threaded at this point.
	match unsafe { fork() } {
		Ok(ForkResult::Child) => {
			// `PR_SET_PDEATHSIG` is cleared across fork(); the exec target needs
			// its own, not the wrapper's.
			unsafe {
				libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM as libc::c_ulong, 0, 0, 0);
			}
			exec(arguments, environment)
		}
		Ok(ForkResult::Parent { child }) => {
			let status = loop {
				match waitpid(child, None) {
					Ok(WaitStatus::Exited(_, code)) => break libc::EXIT_SUCCESS.max(code),
					Ok(WaitStatus::Signaled(_, signal, _)) => break 128 + signal as i32,
					Ok(_) => continue,
					Err(Errno::EINTR) => continue,
					Err(_) => break libc::EXIT_FAILURE,
				}
			};

			let mut end_time: libc::timeval = unsafe { std::mem::zeroed() };
			unsafe { libc::gettimeofday(&mut end_time, std::ptr::null_mut()) };
			let mut end_tms: libc::tms = unsafe { std::mem::zeroed() };
			unsafe { libc::times(&mut end_tms) };

			let real_ms = ((end_time.tv_sec - start_time.tv_sec) * 1000
				+ (end_time.tv_usec - start_time.tv_usec) / 1000) as u32;
			let user_ticks = end_tms.tms_cutime - start_tms.tms_cutime;
			let sys_ticks = end_tms.tms_cstime - start_tms.tms_cstime;
			let user_ms = (user_ticks * 1000 / clock_ticks) as u32;
			let sys_ms = (sys_ticks * 1000 / clock_ticks) as u32;

			// Safety: `record` points into the shared mapping allocated by the
			// parent before fork and still alive until it reaps this wrapper.
			unsafe {
				record.write(TimingRecord {
					real_ms,
					user_ms,
					sys_ms,
				});
			}
			unistd::_exit(status);
		}
		Err(_) => die("timing wrapper fork failed"),
	}
}
