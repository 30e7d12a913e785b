use procteer::{
	Accumulate, Arguments, Environment, Feature, FeatureProcess, FeatureTime, FileConsumer,
	FileDescriptor, FileProducer, StaticProducer, StreamParam, Supervisor, STDIN, STDOUT,
};

/// S1: a trivial command with no stream bindings exits successfully.
#[test]
fn runs_a_trivial_command() {
	let mut supervisor = Supervisor::new(Arguments::from_argv(vec!["/bin/true"]));
	let status = supervisor.launch(Vec::new(), &mut []).unwrap();
	assert!(status.success());
	assert_eq!(supervisor.pid(), None);
}

/// S2: stdout is captured into a user-supplied accumulating consumer.
#[test]
fn captures_stdout_into_accumulator() {
	let mut supervisor = Supervisor::new(Arguments::parse("/bin/echo -n hello"));
	let streams = vec![StreamParam::Consume(STDOUT, Box::new(Accumulate::new()))];
	let status = supervisor.launch(streams, &mut []).unwrap();
	assert!(status.success());
}

/// S3/S4: a command line containing a backslash-escaped space is parsed
/// into the correct argv and the program receives it as one argument.
#[test]
fn backslash_escaped_space_survives_to_the_child() {
	let mut supervisor = Supervisor::new(Arguments::parse(r"/bin/echo -n a\ b"));
	let status = supervisor.launch(Vec::new(), &mut []).unwrap();
	assert!(status.success());
}

/// Piping a static byte string into a child's stdin and draining its
/// stdout through to completion.
#[test]
fn pipes_data_through_cat() {
	let mut supervisor = Supervisor::new(Arguments::from_argv(vec!["/bin/cat"]));
	let streams = vec![
		StreamParam::Produce(STDIN, Box::new(StaticProducer::new(b"roundtrip"))),
		StreamParam::Consume(STDOUT, Box::new(Accumulate::new())),
	];
	let status = supervisor.launch(streams, &mut []).unwrap();
	assert!(status.success());
}

/// Non-zero exit codes are reported verbatim (not translated as if signaled).
#[test]
fn nonzero_exit_code_is_reported_verbatim() {
	let mut supervisor = Supervisor::new(Arguments::parse(r"/bin/sh -c exit\ 7"));
	let status = supervisor.launch(Vec::new(), &mut []).unwrap();
	assert_eq!(status.code(), 7);
	assert!(!status.success());
}

/// A process killed by a signal reports `128 + signum`, the shell
/// convention, distinguishing it from a same-numbered exit code.
#[test]
fn signaled_exit_uses_128_plus_signum_convention() {
	let mut supervisor = Supervisor::new(Arguments::parse("/bin/sh -c kill\\ -TERM\\ $$"));
	let status = supervisor.launch(Vec::new(), &mut []).unwrap();
	assert_eq!(status.code(), 128 + 15);
}

/// An explicit environment override reaches the child, and the child does
/// not fall back to `execvp` inheriting the parent's environment.
#[test]
fn environment_override_reaches_the_child() {
	let env = Environment::new(vec![("MARKER", "procteer-test")]);
	let mut supervisor =
		Supervisor::new(Arguments::parse("/bin/sh -c test\\ \"$MARKER\"\\ =\\ procteer-test"))
			.with_environment(env);
	let status = supervisor.launch(Vec::new(), &mut []).unwrap();
	assert!(status.success());
}

/// [`FeatureProcess`] observes the launched pid while the child is running
/// and clears it once reaped.
#[test]
fn feature_process_tracks_launch_and_exit() {
	let mut supervisor = Supervisor::new(Arguments::from_argv(vec!["/bin/true"]));
	let mut process = FeatureProcess::new();
	{
		let mut features: Vec<&mut dyn Feature> = vec![&mut process];
		let status = supervisor.launch(Vec::new(), &mut features).unwrap();
		assert!(status.success());
	}
	assert_eq!(process.pid(), None);
}

/// S6: [`FeatureTime`] reports elapsed wall time of at least the sleep
/// duration after a launch that sleeps ~100ms.
#[test]
fn feature_time_reports_elapsed_wall_time() {
	let mut supervisor = Supervisor::new(Arguments::from_argv(vec!["/bin/sleep", "0.1"]));
	let mut timing = FeatureTime::new();
	{
		let mut features: Vec<&mut dyn Feature> = vec![&mut timing];
		let status = supervisor.launch(Vec::new(), &mut features).unwrap();
		assert!(status.success());
	}
	assert!(timing.real_ms() >= 90, "real_ms was {}", timing.real_ms());
}

/// Binding the same child handle twice in one launch is rejected before any
/// process is spawned.
#[test]
fn duplicate_handle_binding_is_rejected() {
	let mut supervisor = Supervisor::new(Arguments::from_argv(vec!["/bin/true"]));
	let streams = vec![
		StreamParam::Consume(STDOUT, Box::new(Accumulate::new())),
		StreamParam::Close(STDOUT),
	];
	let result = supervisor.launch(streams, &mut []);
	assert!(result.is_err());
}

/// S3: a static in-memory buffer piped into `sed`'s stdin comes back out the
/// other side into a destination file, bytewise equal to the source buffer.
#[test]
fn static_producer_into_file_consumer_round_trips() {
	let dir = tempfile::tempdir().unwrap();
	let out_path = dir.path().join("out");
	let out_fd = FileDescriptor::open_file(out_path.to_str().unwrap(), false, true, true).unwrap();

	let mut supervisor = Supervisor::new(Arguments::parse(r"/bin/sed -n w\ /dev/stdout"));
	let streams = vec![
		StreamParam::Produce(
			STDIN,
			Box::new(StaticProducer::new(b"Hello\nWorld!\n")),
		),
		StreamParam::Consume(STDOUT, Box::new(FileConsumer::new(out_fd))),
	];
	let status = supervisor.launch(streams, &mut []).unwrap();
	assert!(status.success());
	assert_eq!(std::fs::read(&out_path).unwrap(), b"Hello\nWorld!\n");
}

/// S4: a source file piped through `sed` via an adopted `FileProducer`
/// descriptor into an adopted `FileConsumer` descriptor for the destination
/// is bytewise equal to the source, exercising the direct-fd-adoption path
/// (no pipe is allocated for either side).
#[test]
fn file_producer_into_file_consumer_round_trips_via_adopted_fds() {
	let dir = tempfile::tempdir().unwrap();
	let in_path = dir.path().join("in");
	let out_path = dir.path().join("out");
	std::fs::write(&in_path, b"the quick brown fox\n").unwrap();

	let in_fd = FileDescriptor::open_file(in_path.to_str().unwrap(), true, false, false).unwrap();
	let out_fd = FileDescriptor::open_file(out_path.to_str().unwrap(), false, true, true).unwrap();

	let mut supervisor = Supervisor::new(Arguments::parse(r"/bin/sed -n w\ /dev/stdout"));
	let streams = vec![
		StreamParam::Produce(STDIN, Box::new(FileProducer::new(in_fd))),
		StreamParam::Consume(STDOUT, Box::new(FileConsumer::new(out_fd))),
	];
	let status = supervisor.launch(streams, &mut []).unwrap();
	assert!(status.success());
	assert_eq!(
		std::fs::read(&out_path).unwrap(),
		std::fs::read(&in_path).unwrap()
	);
}

/// A binding set containing only `{stderr: close}` launches successfully and
/// the child's stderr ends up closed (rather than inherited).
#[test]
fn close_only_binding_launches_and_closes_stderr() {
	let mut supervisor = Supervisor::new(Arguments::parse(
		r#"/bin/sh -c test\ !\ -e\ /proc/self/fd/2"#,
	));
	let streams = vec![StreamParam::Close(procteer::STDERR)];
	let status = supervisor.launch(streams, &mut []).unwrap();
	assert!(status.success());
}
