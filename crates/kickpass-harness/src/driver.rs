//! PTY process driver
//!
//! Uses expectrl to run one command under a pseudo-terminal and walk its
//! [`PromptPlan`]. kickpass reads passwords with echo disabled and prints its
//! cues on the terminal, so plain pipes are not enough.
//!
//! # Run lifecycle
//!
//! ```text
//! Spawned ──► ConsumingPrompt(0) ──► … ──► ConsumingPrompt(n) ──► DrainingOutput ──► Exited
//!                    │                            │                     │
//!                    └────────────────────────────┴─────────────────────┴──► Failed
//! ```
//!
//! Every wait is bounded. A cue that does not show up in time moves the run
//! to `Failed` and the child is killed; nothing is retried. Whatever the child
//! printed up to that point is kept in the returned error.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use expectrl::session::OsSession;
use expectrl::process::unix::WaitStatus;
use expectrl::{Eof, Expect, Regex, Session};
use tracing::{debug, info, warn};

use crate::config::HarnessConfig;
use crate::error::{HarnessError, Result};
use crate::instrument::{current_test_id, log_file_for, Instrumentation};
use crate::prompt::PromptPlan;

/// Any non-empty byte sequence, used to take what no cue consumed
const UNREAD: &str = r"(?s-u).+";

/// Where a single run currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Spawned,
    /// Waiting for the cue of the exchange at this index
    ConsumingPrompt(usize),
    DrainingOutput,
    Exited(i32),
    Failed,
}

/// One command to run: program, arguments, extra environment, prompt plan
/// and the exit code it must end with.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub plan: PromptPlan,
    pub expected_exit_code: i32,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            plan: PromptPlan::new(),
            expected_exit_code: 0,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn envs(mut self, vars: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env.extend(vars);
        self
    }

    pub fn plan(mut self, plan: PromptPlan) -> Self {
        self.plan = plan;
        self
    }

    pub fn expect_exit(mut self, code: i32) -> Self {
        self.expected_exit_code = code;
        self
    }
}

/// What a finished run produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    /// Output drained after the last prompt was answered
    pub output: String,
    /// Everything read from the terminal, prompts included
    pub transcript: String,
    pub exit_code: i32,
    /// Number of lines sent in response to cues
    pub responses_sent: usize,
}

impl CommandResult {
    /// Non-blank output lines, without the terminal's trailing `\r`
    pub fn lines(&self) -> Vec<&str> {
        self.output
            .lines()
            .map(|l| l.trim_end_matches('\r'))
            .filter(|l| !l.trim().is_empty())
            .collect()
    }
}

/// Runs commands under a pty, optionally through a memory checker
#[derive(Debug, Clone)]
pub struct ProcessDriver {
    prompt_timeout: Duration,
    exit_timeout: Duration,
    instrumentation: Option<Instrumentation>,
    log_dir: PathBuf,
}

impl ProcessDriver {
    pub fn new(config: &HarnessConfig) -> Self {
        Self {
            prompt_timeout: config.prompt_timeout(),
            exit_timeout: config.exit_timeout(),
            instrumentation: config.instrumentation.clone(),
            log_dir: config.instrumentation_log_dir.clone(),
        }
    }

    pub fn with_timeouts(prompt_timeout: Duration, exit_timeout: Duration) -> Self {
        Self {
            prompt_timeout,
            exit_timeout,
            instrumentation: None,
            log_dir: PathBuf::from("."),
        }
    }

    pub fn with_instrumentation(mut self, tool: Instrumentation, log_dir: &Path) -> Self {
        self.instrumentation = Some(tool);
        self.log_dir = log_dir.to_path_buf();
        self
    }

    pub fn instrumentation(&self) -> Option<&Instrumentation> {
        self.instrumentation.as_ref()
    }

    /// Spawn `invocation`, answer its prompts in order, drain its output and
    /// check its exit code.
    pub fn run(&self, invocation: &Invocation) -> Result<CommandResult> {
        let (program, args, reserved) = match &self.instrumentation {
            Some(tool) => {
                let log_file = log_file_for(&self.log_dir, &current_test_id());
                let wrapped = tool.wrap(
                    &invocation.program,
                    &invocation.args,
                    &log_file,
                    invocation.expected_exit_code,
                );
                (
                    wrapped.program,
                    wrapped.args,
                    Some((wrapped.reserved_exit_code, wrapped.log_file)),
                )
            }
            None => (invocation.program.clone(), invocation.args.clone(), None),
        };
        let command_line = render_command_line(&program, &args);

        info!(
            command = %command_line,
            prompts = %invocation.plan.summary(),
            expected = invocation.expected_exit_code,
            "Running command"
        );

        let mut command = Command::new(&program);
        command.args(&args);
        for (key, value) in &invocation.env {
            command.env(key, value);
        }

        let mut session = Session::spawn(command).map_err(|e| HarnessError::Spawn {
            command: command_line.clone(),
            reason: e.to_string(),
        })?;

        let mut run = RunLog::new(command_line);
        let result = run.drive(&mut session, &invocation.plan, self);
        let code = match result {
            Ok(code) => code,
            Err(mut e) => {
                run.enter(RunState::Failed);
                run.collect_unread(&mut session);
                terminate(&session);
                run.attach_output(&mut e);
                warn!(
                    command = %run.command,
                    "Run failed: {}\nTranscript so far:\n{}",
                    e,
                    run.transcript
                );
                return Err(e);
            }
        };
        run.enter(RunState::Exited(code));

        if let Some((reserved_code, log_file)) = reserved {
            if code == reserved_code {
                return Err(HarnessError::MemoryDefect {
                    command: run.command,
                    code,
                    log_file,
                });
            }
        }

        if code != invocation.expected_exit_code {
            warn!(
                command = %run.command,
                "Unexpected exit code {}, output:\n{}",
                code,
                run.output
            );
            return Err(HarnessError::UnexpectedExitCode {
                command: run.command,
                expected: invocation.expected_exit_code,
                actual: code,
                output: run.output,
            });
        }

        Ok(CommandResult {
            output: run.output,
            transcript: run.transcript,
            exit_code: code,
            responses_sent: run.responses_sent,
        })
    }
}

/// Mutable bookkeeping of a single run
struct RunLog {
    command: String,
    state: RunState,
    transcript: String,
    output: String,
    responses_sent: usize,
}

impl RunLog {
    fn new(command: String) -> Self {
        Self {
            command,
            state: RunState::Spawned,
            transcript: String::new(),
            output: String::new(),
            responses_sent: 0,
        }
    }

    fn enter(&mut self, state: RunState) {
        debug!(command = %self.command, from = ?self.state, to = ?state, "Run state");
        self.state = state;
    }

    /// Move what the child printed but no cue consumed into the output
    fn collect_unread(&mut self, session: &mut OsSession) {
        match session.check(Regex(UNREAD)) {
            Ok(captures) => {
                let rest = String::from_utf8_lossy(captures.as_bytes());
                self.output.push_str(&rest);
                self.transcript.push_str(&rest);
            }
            Err(e) => debug!(command = %self.command, "Nothing left to read: {}", e),
        }
    }

    fn attach_output(&self, err: &mut HarnessError) {
        match err {
            HarnessError::ProtocolViolation { transcript, .. } => {
                transcript.clone_from(&self.transcript)
            }
            HarnessError::ExitTimeout { output, .. } => output.clone_from(&self.output),
            _ => {}
        }
    }

    fn drive(
        &mut self,
        session: &mut OsSession,
        plan: &PromptPlan,
        driver: &ProcessDriver,
    ) -> Result<i32> {
        session.set_expect_timeout(Some(driver.prompt_timeout));

        for (step, exchange) in plan.exchanges().iter().enumerate() {
            self.enter(RunState::ConsumingPrompt(step));
            let cue = exchange.cue.literal();

            let captures = session
                .expect(cue)
                .map_err(|e| HarnessError::ProtocolViolation {
                    command: self.command.clone(),
                    step,
                    cue: exchange.cue,
                    reason: describe_expect_error(&e, driver.prompt_timeout),
                    transcript: String::new(),
                })?;
            self.transcript
                .push_str(&String::from_utf8_lossy(captures.before()));
            self.transcript.push_str(cue);
            debug!(step, cue, "Matched prompt");

            session.send_line(&exchange.response)?;
            self.responses_sent += 1;
        }

        self.enter(RunState::DrainingOutput);
        session.set_expect_timeout(Some(driver.exit_timeout));
        match session.expect(Eof) {
            // The Eof needle matches the whole remaining buffer
            Ok(captures) => {
                self.output = String::from_utf8_lossy(captures.as_bytes()).into_owned();
                self.transcript.push_str(&self.output);
            }
            Err(expectrl::Error::ExpectTimeout) => {
                return Err(HarnessError::ExitTimeout {
                    command: self.command.clone(),
                    timeout_ms: driver.exit_timeout.as_millis() as u64,
                    output: String::new(),
                });
            }
            Err(e) => return Err(e.into()),
        }

        let status = session
            .get_process()
            .wait()
            .map_err(|e| io::Error::other(e.to_string()))?;
        exit_code(status)
    }
}

fn describe_expect_error(err: &expectrl::Error, timeout: Duration) -> String {
    match err {
        expectrl::Error::ExpectTimeout => format!("cue not seen within {:?}", timeout),
        expectrl::Error::Eof => "process closed its terminal first".to_string(),
        other => other.to_string(),
    }
}

fn exit_code(status: WaitStatus) -> Result<i32> {
    match status {
        WaitStatus::Exited(_, code) => Ok(code),
        WaitStatus::Signaled(_, signal, _) => Ok(128 + signal as i32),
        other => Err(io::Error::other(format!("unexpected wait status {:?}", other)).into()),
    }
}

/// Kill and reap the child of a failed run so it cannot outlive the test
fn terminate(session: &OsSession) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let pid = Pid::from_raw(session.get_process().pid().as_raw());
        if let Err(e) = kill(pid, Signal::SIGKILL) {
            debug!("Child {} already gone: {}", pid, e);
        }
    }
    if let Err(e) = session.get_process().wait() {
        debug!("Child not reaped: {}", e);
    }
}

fn render_command_line(program: &Path, args: &[String]) -> String {
    let mut line = program.display().to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}
