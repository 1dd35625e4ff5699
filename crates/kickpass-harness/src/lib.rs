//! Functional test harness for the kickpass password manager
//!
//! Drives the `kickpass` CLI through a pseudo-terminal the way a user would:
//! answering its password and confirmation prompts in a fixed order,
//! collecting its output and checking how it exits. The caching agent
//! (`kickpass agent -d`) is started and stopped alongside, and its socket
//! binding is handed explicitly to the commands that should use it.
//!
//! ## Layers
//!
//! - [`workspace`]: a throwaway `HOME` per test, plus editor stubs
//! - [`instrument`]: optional memory checker wrapping with a reserved exit code
//! - [`prompt`]: the ordered prompt/response plan of one invocation
//! - [`driver`]: runs one invocation under a pty and walks its plan
//! - [`agent`]: agent lifecycle and announcement parsing
//! - [`session`]: the per-test façade used by the scenarios in `tests/`
//!
//! ## Configuration
//!
//! See [`config::HarnessConfig`]. At minimum `KP` must point at the binary
//! under test.

pub mod agent;
pub mod assert;
pub mod config;
pub mod driver;
pub mod error;
pub mod instrument;
pub mod logging;
pub mod prompt;
pub mod session;
pub mod workspace;

pub use agent::{AgentBinding, AgentController};
pub use config::HarnessConfig;
pub use driver::{CommandResult, Invocation, ProcessDriver, RunState};
pub use error::{HarnessError, Result};
pub use instrument::Instrumentation;
pub use prompt::{PromptCue, PromptPlan, PromptStep};
pub use session::{KpSession, Prompts, DEFAULT_MASTER, DEFAULT_PASSWORD};
pub use workspace::{EditorStub, Workspace};
