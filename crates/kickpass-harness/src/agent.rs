//! kickpass agent lifecycle
//!
//! The agent (`kickpass agent -d`) is a long-running process caching opened
//! safes. On startup it prints a single line announcing the environment
//! binding clients need to reach it, e.g.
//!
//! ```text
//! KP_AGENT_SOCK=/tmp/kp.a1b2c3/agent.4242; export KP_AGENT_SOCK;
//! ```
//!
//! [`AgentController::start`] parses that line into an [`AgentBinding`] and
//! returns it; callers pass it explicitly into the environment of the CLI
//! processes that should talk to the agent. The harness' own environment is
//! never modified.
//!
//! # Announcement schema, version 1
//!
//! ```text
//! KEY=VALUE[;<ignored metadata>]
//! KEY   = [A-Za-z_][A-Za-z0-9_]*
//! VALUE = bare word without whitespace or ';'
//!       | '…' or "…" literal, taken verbatim (no escapes, no expansion)
//! ```

use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{HarnessError, Result};

/// Version of the announcement grammar [`AgentBinding::parse`] accepts
pub const ANNOUNCEMENT_VERSION: u32 = 1;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// The environment entry announced by a running agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentBinding {
    key: String,
    value: String,
}

impl AgentBinding {
    /// Parse one announcement line
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        let (key, rest) = line
            .split_once('=')
            .ok_or_else(|| announcement_error(line, "missing '='"))?;

        let key = key.trim();
        if !is_identifier(key) {
            return Err(announcement_error(line, "invalid variable name"));
        }

        let value = parse_value(rest.trim_start()).map_err(|why| announcement_error(line, why))?;

        Ok(Self {
            key: key.to_string(),
            value,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// As a `(name, value)` pair for a child's environment
    pub fn as_env(&self) -> (String, String) {
        (self.key.clone(), self.value.clone())
    }
}

fn announcement_error(line: &str, why: &str) -> HarnessError {
    HarnessError::AgentAnnouncement(format!(
        "{} in {:?} (expected announcement v{})",
        why, line, ANNOUNCEMENT_VERSION
    ))
}

fn is_identifier(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

fn parse_value(rest: &str) -> std::result::Result<String, &'static str> {
    match rest.chars().next() {
        Some(quote @ ('\'' | '"')) => {
            let inner = &rest[1..];
            let end = inner.find(quote).ok_or("unterminated quoted value")?;
            let tail = inner[end + 1..].trim_start();
            if !(tail.is_empty() || tail.starts_with(';')) {
                return Err("trailing text after quoted value");
            }
            let value = &inner[..end];
            if value.is_empty() {
                return Err("empty value");
            }
            Ok(value.to_string())
        }
        _ => {
            let value = rest.split(';').next().unwrap_or_default().trim_end();
            if value.is_empty() {
                return Err("empty value");
            }
            if value.chars().any(char::is_whitespace) {
                return Err("unquoted value contains whitespace");
            }
            Ok(value.to_string())
        }
    }
}

/// A running agent process and what it announced
struct RunningAgent {
    child: Child,
    binding: AgentBinding,
    // Held open for the agent's lifetime so it never writes into a closed pipe
    _stdout: BufReader<ChildStdout>,
}

impl Drop for RunningAgent {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            warn!("Force-killing agent {}", self.child.id());
            kill_and_reap(&mut self.child);
        }
    }
}

/// Starts and stops at most one agent at a time
pub struct AgentController {
    program: PathBuf,
    args: Vec<String>,
    env: Vec<(String, String)>,
    timeout: Duration,
    running: Option<RunningAgent>,
}

impl AgentController {
    /// Controller for `<program> agent -d`. `timeout` bounds both the wait
    /// for the announcement and the wait for exit on stop.
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: vec!["agent".to_string(), "-d".to_string()],
            env: Vec::new(),
            timeout,
            running: None,
        }
    }

    /// Replace the default `agent -d` arguments
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, vars: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env.extend(vars);
        self
    }

    /// Spawn the agent and wait for its announcement.
    ///
    /// Fails with [`HarnessError::AgentAlreadyRunning`] if an agent from this
    /// controller has not been stopped yet.
    pub fn start(&mut self) -> Result<AgentBinding> {
        if let Some(agent) = &self.running {
            return Err(HarnessError::AgentAlreadyRunning(agent.binding.key.clone()));
        }

        let command_line = format!("{} {}", self.program.display(), self.args.join(" "));
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| HarnessError::Spawn {
                command: command_line.clone(),
                reason: e.to_string(),
            })?;
        info!(command = %command_line, pid = child.id(), "Started agent");

        let (line, stdout) = match self.read_announcement(&mut child) {
            Ok(announced) => announced,
            Err(e) => {
                kill_and_reap(&mut child);
                return Err(e);
            }
        };

        let binding = match AgentBinding::parse(&line) {
            Ok(binding) => binding,
            Err(e) => {
                kill_and_reap(&mut child);
                return Err(e);
            }
        };
        debug!(key = %binding.key, "Agent announced binding");

        self.running = Some(RunningAgent {
            child,
            binding: binding.clone(),
            _stdout: stdout,
        });
        Ok(binding)
    }

    /// Read exactly one line from the agent's stdout, bounded by the timeout.
    /// The read happens on a helper thread so a silent agent cannot block the
    /// test forever; killing the agent unblocks it.
    fn read_announcement(&self, child: &mut Child) -> Result<(String, BufReader<ChildStdout>)> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("agent stdout was not captured"))?;

        let (tx, rx) = flume::bounded(1);
        thread::Builder::new()
            .name("kp-agent-announce".to_string())
            .spawn(move || {
                let mut reader = BufReader::new(stdout);
                let mut line = String::new();
                let read = reader.read_line(&mut line).map(|_| line);
                let _ = tx.send((read, reader));
            })?;

        match rx.recv_timeout(self.timeout) {
            Ok((Ok(line), _)) if line.is_empty() => Err(HarnessError::AgentAnnouncement(
                "agent closed its output without announcing".to_string(),
            )),
            Ok((Ok(line), reader)) => Ok((line, reader)),
            Ok((Err(e), _)) => Err(e.into()),
            Err(_) => Err(HarnessError::AgentAnnouncement(format!(
                "no announcement within {:?}",
                self.timeout
            ))),
        }
    }

    /// Binding of the running agent, if any
    pub fn binding(&self) -> Option<&AgentBinding> {
        self.running.as_ref().map(|agent| &agent.binding)
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn pid(&self) -> Option<u32> {
        self.running.as_ref().map(|agent| agent.child.id())
    }

    /// Stop the agent.
    ///
    /// The agent must still be alive, must exit after SIGTERM within the
    /// timeout, and is forgotten (binding included) whatever the outcome.
    /// Stopping when nothing runs is a no-op.
    pub fn stop(&mut self) -> Result<()> {
        let Some(mut agent) = self.running.take() else {
            return Ok(());
        };
        info!(pid = agent.child.id(), key = %agent.binding.key, "Stopping agent");

        if let Some(status) = agent.child.try_wait()? {
            return Err(HarnessError::AgentLiveness(format!(
                "agent died before stop ({})",
                status
            )));
        }

        terminate(&agent.child)?;

        let deadline = Instant::now() + self.timeout;
        loop {
            if let Some(status) = agent.child.try_wait()? {
                debug!("Agent exited with {}", status);
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(HarnessError::AgentLiveness(format!(
                    "agent still alive {:?} after SIGTERM",
                    self.timeout
                )));
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Forced teardown: SIGKILL the agent if it is still alive, without any
    /// liveness checks. Used when a test is already failing.
    pub fn kill(&mut self) {
        if let Some(mut agent) = self.running.take() {
            kill_and_reap(&mut agent.child);
        }
    }
}

#[cfg(unix)]
fn terminate(child: &Child) -> Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM).map_err(io::Error::from)?;
    Ok(())
}

#[cfg(not(unix))]
fn terminate(_child: &Child) -> Result<()> {
    Err(io::Error::other("agent termination requires a unix platform").into())
}

fn kill_and_reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;
    use tempfile::TempDir;
    use test_case::test_case;

    #[test_case("KP_AGENT_SOCK=/tmp/kp.x/agent.1", "KP_AGENT_SOCK", "/tmp/kp.x/agent.1"; "plain")]
    #[test_case("KP_AGENT_SOCK=/tmp/kp.x/agent.1; export KP_AGENT_SOCK;\n", "KP_AGENT_SOCK", "/tmp/kp.x/agent.1"; "shell export metadata")]
    #[test_case("KP_AGENT_SOCK='/tmp/with space/agent'", "KP_AGENT_SOCK", "/tmp/with space/agent"; "single quoted")]
    #[test_case("SOCK=\"/tmp/a;b\"; export SOCK", "SOCK", "/tmp/a;b"; "double quoted with separator")]
    #[test_case("_X1=$(id)", "_X1", "$(id)"; "never evaluated")]
    fn parses_announcements(line: &str, key: &str, value: &str) {
        let binding = AgentBinding::parse(line).unwrap();
        assert_eq!(binding.key(), key);
        assert_eq!(binding.value(), value);
    }

    #[test_case(""; "empty")]
    #[test_case("agent started"; "no equals")]
    #[test_case("1SOCK=/tmp/x"; "leading digit")]
    #[test_case("KP SOCK=/tmp/x"; "space in key")]
    #[test_case("KP_AGENT_SOCK="; "empty value")]
    #[test_case("KP_AGENT_SOCK=; export"; "empty value before metadata")]
    #[test_case("KP_AGENT_SOCK='/tmp/x"; "unterminated quote")]
    #[test_case("KP_AGENT_SOCK='/tmp/x' junk"; "junk after quote")]
    #[test_case("KP_AGENT_SOCK=/tmp/x y"; "bare value with space")]
    fn rejects_malformed_announcements(line: &str) {
        let err = AgentBinding::parse(line).unwrap_err();
        assert!(matches!(err, HarnessError::AgentAnnouncement(_)), "{}", err);
    }

    #[test]
    fn parse_error_names_the_grammar_version() {
        let message = AgentBinding::parse("agent started").unwrap_err().to_string();
        assert!(
            message.contains(&format!("v{}", ANNOUNCEMENT_VERSION)),
            "{}",
            message
        );
    }

    fn fake_agent(dir: &TempDir, body: &str) -> AgentController {
        let path = dir.path().join("agent.sh");
        fs::write(&path, body).unwrap();
        AgentController::new("/bin/sh", Duration::from_secs(2))
            .with_args([path.display().to_string()])
    }

    const WELL_BEHAVED: &str =
        "echo \"KP_AGENT_SOCK=/tmp/kp.test/agent.$$; export KP_AGENT_SOCK;\"\nexec sleep 30\n";

    #[test]
    #[serial]
    fn start_returns_binding_and_stop_clears_it() {
        let dir = TempDir::new().unwrap();
        let mut agent = fake_agent(&dir, WELL_BEHAVED);

        let binding = agent.start().unwrap();
        assert_eq!(binding.key(), "KP_AGENT_SOCK");
        assert!(binding.value().starts_with("/tmp/kp.test/agent."));
        assert_eq!(agent.binding(), Some(&binding));
        assert!(agent.is_running());

        agent.stop().unwrap();
        assert!(agent.binding().is_none());
        assert!(!agent.is_running());
    }

    #[test]
    #[serial]
    fn ambient_environment_is_untouched() {
        let dir = TempDir::new().unwrap();
        let mut agent = fake_agent(
            &dir,
            "echo \"KP_HARNESS_TEST_ONLY_SOCK=/tmp/x\"\nexec sleep 30\n",
        );

        agent.start().unwrap();
        assert!(std::env::var("KP_HARNESS_TEST_ONLY_SOCK").is_err());
        agent.stop().unwrap();
    }

    #[test]
    #[serial]
    fn second_start_is_refused() {
        let dir = TempDir::new().unwrap();
        let mut agent = fake_agent(&dir, WELL_BEHAVED);

        let first = agent.start().unwrap();
        let err = agent.start().unwrap_err();
        assert!(matches!(err, HarnessError::AgentAlreadyRunning(_)), "{}", err);
        assert_eq!(agent.binding(), Some(&first));

        agent.stop().unwrap();
    }

    #[test]
    #[serial]
    fn stop_twice_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let mut agent = fake_agent(&dir, WELL_BEHAVED);

        agent.start().unwrap();
        agent.stop().unwrap();
        agent.stop().unwrap();
        assert!(agent.binding().is_none());
    }

    #[test]
    fn stop_without_start_is_a_no_op() {
        let mut agent = AgentController::new("/bin/false", Duration::from_secs(1));
        agent.stop().unwrap();
    }

    #[test]
    #[serial]
    fn premature_death_is_reported_and_binding_removed() {
        let dir = TempDir::new().unwrap();
        let mut agent = fake_agent(&dir, "echo \"KP_AGENT_SOCK=/tmp/x\"\nexit 0\n");

        agent.start().unwrap();
        thread::sleep(Duration::from_millis(200));

        let err = agent.stop().unwrap_err();
        assert!(matches!(err, HarnessError::AgentLiveness(_)), "{}", err);
        assert!(agent.binding().is_none());
    }

    #[test]
    #[serial]
    fn agent_ignoring_sigterm_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stubborn.sh");
        fs::write(
            &path,
            "trap '' TERM\necho \"KP_AGENT_SOCK=/tmp/x\"\nwhile true; do sleep 1; done\n",
        )
        .unwrap();
        let mut agent = AgentController::new("/bin/sh", Duration::from_millis(300))
            .with_args([path.display().to_string()]);

        agent.start().unwrap();
        let err = agent.stop().unwrap_err();
        assert!(matches!(err, HarnessError::AgentLiveness(_)), "{}", err);
        assert!(agent.binding().is_none());
    }

    #[test]
    #[serial]
    fn garbage_announcement_fails_start() {
        let dir = TempDir::new().unwrap();
        let mut agent = fake_agent(&dir, "echo 'agent ready'\nexec sleep 30\n");

        let err = agent.start().unwrap_err();
        assert!(matches!(err, HarnessError::AgentAnnouncement(_)), "{}", err);
        assert!(!agent.is_running());
    }

    #[test]
    #[serial]
    fn silent_agent_times_out() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("silent.sh");
        fs::write(&path, "exec sleep 30\n").unwrap();
        let mut agent = AgentController::new("/bin/sh", Duration::from_millis(300))
            .with_args([path.display().to_string()]);

        let started = Instant::now();
        let err = agent.start().unwrap_err();
        assert!(matches!(err, HarnessError::AgentAnnouncement(_)), "{}", err);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    #[serial]
    #[cfg(unix)]
    fn drop_kills_running_agent() {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let dir = TempDir::new().unwrap();
        let mut agent = fake_agent(&dir, WELL_BEHAVED);
        agent.start().unwrap();
        let pid = Pid::from_raw(agent.pid().unwrap() as i32);

        drop(agent);
        assert!(kill(pid, None).is_err(), "agent {} survived drop", pid);
    }

    #[test]
    #[serial]
    fn agent_receives_configured_environment() {
        let dir = TempDir::new().unwrap();
        let mut agent = fake_agent(&dir, "echo \"KP_AGENT_SOCK=$HOME/agent.sock\"\nexec sleep 30\n")
            .with_env([("HOME".to_string(), "/tmp/kphome".to_string())]);

        let binding = agent.start().unwrap();
        assert_eq!(binding.value(), "/tmp/kphome/agent.sock");
        agent.stop().unwrap();
    }
}
