//! Error types for the kickpass harness

use std::path::PathBuf;

use thiserror::Error;

use crate::prompt::PromptCue;

/// Result type alias for harness operations
pub type Result<T> = std::result::Result<T, HarnessError>;

/// Everything that can make a harness operation fail.
///
/// None of these are recoverable: the harness never retries, so each variant
/// is reported to the test as-is.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// The program could not be started at all
    #[error("Failed to spawn `{command}`: {reason}")]
    Spawn { command: String, reason: String },

    /// An expected prompt cue never showed up within the prompt timeout
    #[error("Protocol violation in `{command}`: step {step} expected {cue:?} ({}): {reason}", cue.literal())]
    ProtocolViolation {
        command: String,
        step: usize,
        cue: PromptCue,
        reason: String,
        /// Everything read from the terminal, including what was left unread
        /// when the step failed
        transcript: String,
    },

    /// The process did not terminate after the prompt plan was consumed
    #[error("`{command}` did not exit within {timeout_ms}ms")]
    ExitTimeout {
        command: String,
        timeout_ms: u64,
        /// Output printed after the last answered prompt
        output: String,
    },

    /// The command exited with a status other than the expected one
    #[error("`{command}` exited with {actual}, expected {expected}")]
    UnexpectedExitCode {
        command: String,
        expected: i32,
        actual: i32,
        output: String,
    },

    /// The instrumentation tool exited with its reserved code
    #[error("Memory defect detected in `{command}` (exit code {code}), see {}", log_file.display())]
    MemoryDefect {
        command: String,
        code: i32,
        log_file: PathBuf,
    },

    /// The agent was dead when it should have been alive, or the reverse
    #[error("Agent liveness error: {0}")]
    AgentLiveness(String),

    /// The agent's first output line was not a valid binding
    #[error("Invalid agent announcement: {0}")]
    AgentAnnouncement(String),

    /// A second agent was started while one is still running
    #[error("An agent is already running (binding {0})")]
    AgentAlreadyRunning(String),

    /// Invalid or missing configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// IO errors (workspace files, pipes, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// PTY session errors other than prompt timeouts
    #[error("PTY error: {0}")]
    Pty(#[from] expectrl::Error),
}

impl HarnessError {
    /// True when the instrumentation tool flagged a memory defect, as opposed
    /// to the command failing on its own terms.
    pub fn is_memory_defect(&self) -> bool {
        matches!(self, HarnessError::MemoryDefect { .. })
    }

    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, HarnessError::ProtocolViolation { .. })
    }

    /// Exit code reported by the process, when the failure carries one
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            HarnessError::UnexpectedExitCode { actual, .. } => Some(*actual),
            HarnessError::MemoryDefect { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// What the process printed before the failure, when the failure carries it
    pub fn output(&self) -> Option<&str> {
        match self {
            HarnessError::ProtocolViolation { transcript, .. } => Some(transcript),
            HarnessError::ExitTimeout { output, .. }
            | HarnessError::UnexpectedExitCode { output, .. } => Some(output),
            _ => None,
        }
    }
}
