//! Memory-checker wrapping of CLI invocations
//!
//! When instrumentation is configured, `kickpass <args>` is run as
//!
//! ```text
//! <command> --log-file=<dir>/valgrind-<test>.log --error-exitcode=<reserved> <options..> kickpass <args>
//! ```
//!
//! `reserved` is picked per invocation so it never equals the exit code the
//! test expects from kickpass itself. A run ending with `reserved` is a memory
//! defect; any other unexpected code is kickpass failing on its own terms.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// A memory checker and its extra options
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Instrumentation {
    pub command: String,
    #[serde(default)]
    pub options: Vec<String>,
}

/// The command line to actually spawn once wrapped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentedCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Exit code meaning "memory defect"
    pub reserved_exit_code: i32,
    pub log_file: PathBuf,
}

impl Instrumentation {
    pub fn new(command: impl Into<String>, options: Vec<String>) -> Self {
        Self {
            command: command.into(),
            options,
        }
    }

    /// Smallest exit code in 1..=255 that differs from `expected`
    pub fn reserved_exit_code(expected: i32) -> i32 {
        if expected == 1 {
            2
        } else {
            1
        }
    }

    /// Wrap `program args..` so it runs under the memory checker
    pub fn wrap(
        &self,
        program: &Path,
        args: &[String],
        log_file: &Path,
        expected_exit_code: i32,
    ) -> InstrumentedCommand {
        let reserved = Self::reserved_exit_code(expected_exit_code);

        let mut wrapped = Vec::with_capacity(self.options.len() + args.len() + 3);
        wrapped.push(format!("--log-file={}", log_file.display()));
        wrapped.push(format!("--error-exitcode={}", reserved));
        wrapped.extend(self.options.iter().cloned());
        wrapped.push(program.display().to_string());
        wrapped.extend(args.iter().cloned());

        InstrumentedCommand {
            program: PathBuf::from(&self.command),
            args: wrapped,
            reserved_exit_code: reserved,
            log_file: log_file.to_path_buf(),
        }
    }
}

/// Log file for the current test inside `dir`
pub fn log_file_for(dir: &Path, test_id: &str) -> PathBuf {
    dir.join(format!("valgrind-{}.log", test_id))
}

/// Identifier of the running test, taken from the thread name libtest gives
/// each test. Falls back to the process id outside of a test thread.
pub fn current_test_id() -> String {
    match std::thread::current().name() {
        Some(name) if name != "main" => name.replace("::", "."),
        _ => format!("pid{}", std::process::id()),
    }
}
