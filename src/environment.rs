//! An owned `envp` suitable for `execvpe`.

use std::ffi::CString;

/// An owned, move-only `envp` array of `KEY=VALUE` entries.
///
/// Optional on [`Supervisor`](crate::supervisor::Supervisor): if none is set,
/// the child inherits the parent's environment and `execvp` (not
/// `execvpe`) is used. The library performs no validation of keys or values.
#[derive(Debug)]
pub struct Environment {
	entries: Vec<CString>,
}

impl Environment {
	/// Builds an environment from `(key, value)` pairs, encoding each as a
	/// single `KEY=VALUE` entry.
	pub fn new<I, K, V>(values: I) -> Self
	where
		I: IntoIterator<Item = (K, V)>,
		K: AsRef<str>,
		V: AsRef<str>,
	{
		let entries = values
			.into_iter()
			.map(|(k, v)| {
				let entry = format!("{}={}", k.as_ref(), v.as_ref());
				CString::new(entry).expect("environment entry contains an interior nul")
			})
			.collect();
		Self { entries }
	}

	/// The raw entries, as `KEY=VALUE` C strings.
	pub fn entries(&self) -> &[CString] {
		&self.entries
	}

	/// Builds a null-pointer-terminated `envp` suitable for `execvpe`. The
	/// returned `Vec` (including the trailing null) borrows from `self` and
	/// must not outlive it.
	pub fn envp(&self) -> Vec<*const libc::c_char> {
		let mut envp: Vec<*const libc::c_char> =
			self.entries.iter().map(|e| e.as_ptr()).collect();
		envp.push(std::ptr::null());
		envp
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn formats_key_value_entries() {
		let env = Environment::new(vec![("PATH", "/usr/bin"), ("HOME", "/root")]);
		let strs: Vec<&str> = env.entries().iter().map(|e| e.to_str().unwrap()).collect();
		assert_eq!(strs, vec!["PATH=/usr/bin", "HOME=/root"]);
	}

	#[test]
	fn envp_is_null_terminated() {
		let env = Environment::new(vec![("A", "1")]);
		let envp = env.envp();
		assert_eq!(envp.len(), 2);
		assert!(envp[1].is_null());
	}
}
