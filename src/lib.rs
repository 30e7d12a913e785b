//! A POSIX process-supervision engine: fork/exec with explicit descriptor
//! wiring, a poll-driven bidirectional I/O pump between the parent and a
//! child's pipes/sockets, an optional double-fork timing wrapper, and a
//! process-wide signal-handler registry.
//!
//! [`Supervisor`] is the entry point: build an [`Arguments`] (and optionally
//! an [`Environment`]), describe how each child-side descriptor should be
//! bound with [`StreamParam`], attach any [`Feature`]s, and `launch`.

#![warn(
	missing_copy_implementations,
	missing_debug_implementations,
	missing_docs,
	trivial_numeric_casts,
	unused_extern_crates,
	unused_import_braces,
	unused_qualifications
)]

mod argument;
mod environment;
mod error;
mod fd;
mod feature;
mod io;
mod shared_memory;
pub mod signal;
mod supervisor;

pub use argument::Arguments;
pub use environment::Environment;
pub use error::{Error, Result};
pub use fd::{FileDescriptor, Handle, NO_HANDLE, NPOS, STDERR, STDIN, STDOUT};
pub use feature::{Feature, FeatureProcess, FeatureTime, TimingRecord};
pub use io::{Accumulate, Consumer, DynamicProducer, FileConsumer, FileProducer, Producer, StaticProducer};
pub use shared_memory::SharedMemory;
pub use signal::SignalBus;
pub use supervisor::{ExitStatus, StreamParam, Supervisor};
