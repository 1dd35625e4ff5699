//! Per-test kickpass session
//!
//! [`KpSession`] bundles everything one functional test needs: an isolated
//! [`Workspace`], a [`ProcessDriver`] configured from [`HarnessConfig`] and an
//! [`AgentController`]. It exposes one helper per kickpass subcommand with
//! the usual credentials pre-filled, and file/output assertions on top.
//!
//! ```ignore
//! let mut kp = KpSession::new()?;
//! kp.editor(EditorStub::Env, Some("It's a secret"));
//! kp.create("test")?;
//! kp.cat("test")?;
//! kp.assert_stdout_equals(&["It's a secret"]);
//! ```

use tracing::{info, warn};

use crate::agent::{AgentBinding, AgentController};
use crate::assert;
use crate::config::HarnessConfig;
use crate::driver::{CommandResult, Invocation, ProcessDriver};
use crate::error::Result;
use crate::logging::init_test_logging;
use crate::prompt::PromptPlan;
use crate::workspace::{EditorStub, Workspace};

/// Master password every session is initialised with
pub const DEFAULT_MASTER: &str = "test master password";
/// Secret password typed by `create` and `edit` unless overridden
pub const DEFAULT_PASSWORD: &str = "test password";
/// Smallest size a freshly written safe must exceed
pub const MIN_SAFE_SIZE: u64 = 20;

/// Credentials and exit code for one subcommand helper.
///
/// `None` means the corresponding prompt is not expected at all, which is
/// different from answering it with an empty line.
#[derive(Clone, Copy)]
pub struct Prompts<'a> {
    master: Option<&'a str>,
    password: Option<&'a str>,
    yes_no: Option<&'a str>,
    rc: i32,
}

impl Default for Prompts<'_> {
    fn default() -> Self {
        Self {
            master: Some(DEFAULT_MASTER),
            password: Some(DEFAULT_PASSWORD),
            yes_no: None,
            rc: 0,
        }
    }
}

impl<'a> Prompts<'a> {
    pub fn master(mut self, master: Option<&'a str>) -> Self {
        self.master = master;
        self
    }

    pub fn password(mut self, password: Option<&'a str>) -> Self {
        self.password = password;
        self
    }

    pub fn yes_no(mut self, answer: Option<&'a str>) -> Self {
        self.yes_no = answer;
        self
    }

    /// Exit code the command must end with
    pub fn rc(mut self, rc: i32) -> Self {
        self.rc = rc;
        self
    }
}

pub struct KpSession {
    config: HarnessConfig,
    workspace: Workspace,
    driver: ProcessDriver,
    agent: AgentController,
    last: Option<CommandResult>,
}

impl KpSession {
    /// Session from the environment, with the store already initialised
    pub fn new() -> Result<Self> {
        Self::with_config(HarnessConfig::load()?)
    }

    /// Session from an explicit config, with the store already initialised
    pub fn with_config(config: HarnessConfig) -> Result<Self> {
        let mut session = Self::uninitialized(config)?;
        session.init(None)?;
        Ok(session)
    }

    /// Session with an empty home, `init` not run yet
    pub fn uninitialized(config: HarnessConfig) -> Result<Self> {
        init_test_logging();

        let kp = config.kp_binary()?.to_path_buf();
        let workspace = Workspace::setup(config.editor_dir.as_deref())?;
        let driver = ProcessDriver::new(&config);
        let agent = AgentController::new(&kp, config.agent_timeout()).with_env([(
            "HOME".to_string(),
            workspace.root().display().to_string(),
        )]);

        info!(home = %workspace.root().display(), kp = %kp.display(), "New kickpass session");

        Ok(Self {
            config,
            workspace,
            driver,
            agent,
            last: None,
        })
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Select the editor stub for following commands
    pub fn editor(&mut self, stub: EditorStub, payload: Option<&str>) {
        self.workspace.set_editor(stub, payload);
    }

    /// Result of the last successful command
    pub fn last(&self) -> Option<&CommandResult> {
        self.last.as_ref()
    }

    /// Output of the last successful command, empty before any command
    pub fn stdout(&self) -> &str {
        self.last.as_ref().map(|r| r.output.as_str()).unwrap_or_default()
    }

    /// Non-blank output lines of the last successful command
    pub fn stdout_lines(&self) -> Vec<&str> {
        self.last.as_ref().map(CommandResult::lines).unwrap_or_default()
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Run `kickpass <args>` with an explicit prompt plan.
    ///
    /// The child sees the workspace environment plus the agent binding when
    /// an agent is running.
    pub fn cmd<I, S>(&mut self, args: I, plan: PromptPlan, rc: i32) -> Result<CommandResult>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let kp = self.config.kp_binary()?;
        let mut invocation = Invocation::new(kp)
            .args(args)
            .envs(self.workspace.env())
            .plan(plan)
            .expect_exit(rc);
        if let Some(binding) = self.agent.binding() {
            let (key, value) = binding.as_env();
            invocation = invocation.env(key, value);
        }

        self.last = None;
        let result = self.driver.run(&invocation)?;
        self.last = Some(result.clone());
        Ok(result)
    }

    pub fn init(&mut self, path: Option<&str>) -> Result<CommandResult> {
        self.init_with(path, Prompts::default())
    }

    /// `init` with the fast KDF limits from the config
    pub fn init_with(&mut self, path: Option<&str>, prompts: Prompts<'_>) -> Result<CommandResult> {
        let mut args = vec![
            "init".to_string(),
            "--memlimit".to_string(),
            self.config.init_memlimit.to_string(),
            "--opslimit".to_string(),
            self.config.init_opslimit.to_string(),
        ];
        args.extend(path.map(str::to_string));
        self.cmd(args, PromptPlan::init(prompts.master), prompts.rc)
    }

    pub fn create(&mut self, name: &str) -> Result<CommandResult> {
        self.create_with(name, &[], Prompts::default())
    }

    /// `create [options] <name>`. With `-g` the password is generated and no
    /// password prompt is expected.
    pub fn create_with(
        &mut self,
        name: &str,
        options: &[&str],
        prompts: Prompts<'_>,
    ) -> Result<CommandResult> {
        let generate = options.contains(&"-g");
        let password = if generate { None } else { prompts.password };
        let plan = PromptPlan::create(prompts.master, password, generate);
        self.cmd(subcommand("create", options, &[name]), plan, prompts.rc)
    }

    pub fn edit(&mut self, name: &str) -> Result<CommandResult> {
        self.edit_with(name, &[], Prompts::default())
    }

    /// `edit [options] <name>`. Password and metadata are both edited by
    /// default; `-m` alone leaves the password alone, and `-g` generates it,
    /// so neither expects a password prompt.
    pub fn edit_with(
        &mut self,
        name: &str,
        options: &[&str],
        prompts: Prompts<'_>,
    ) -> Result<CommandResult> {
        let generate = options.contains(&"-g");
        let metadata_only = options.contains(&"-m") && !options.contains(&"-p");
        let password = if generate || metadata_only {
            None
        } else {
            prompts.password
        };
        let plan = PromptPlan::edit(prompts.master, password, generate, prompts.yes_no);
        self.cmd(subcommand("edit", options, &[name]), plan, prompts.rc)
    }

    pub fn rename(&mut self, old: &str, new: &str) -> Result<CommandResult> {
        self.rename_with(old, new, &[], Prompts::default())
    }

    pub fn rename_with(
        &mut self,
        old: &str,
        new: &str,
        options: &[&str],
        prompts: Prompts<'_>,
    ) -> Result<CommandResult> {
        let plan = PromptPlan::master_only(prompts.master);
        self.cmd(subcommand("rename", options, &[old, new]), plan, prompts.rc)
    }

    pub fn cat(&mut self, name: &str) -> Result<CommandResult> {
        self.cat_with(name, &[], Prompts::default())
    }

    pub fn cat_with(
        &mut self,
        name: &str,
        options: &[&str],
        prompts: Prompts<'_>,
    ) -> Result<CommandResult> {
        let plan = PromptPlan::master_only(prompts.master);
        self.cmd(subcommand("cat", options, &[name]), plan, prompts.rc)
    }

    pub fn delete(&mut self, name: &str) -> Result<CommandResult> {
        self.delete_with(name, &[], Prompts::default())
    }

    /// `delete [options] <name>`. Pass `master(None)` together with `-f`.
    pub fn delete_with(
        &mut self,
        name: &str,
        options: &[&str],
        prompts: Prompts<'_>,
    ) -> Result<CommandResult> {
        let plan = PromptPlan::master_only(prompts.master);
        self.cmd(subcommand("delete", options, &[name]), plan, prompts.rc)
    }

    pub fn open(&mut self, name: &str) -> Result<CommandResult> {
        self.open_with(name, &[], Prompts::default())
    }

    pub fn open_with(
        &mut self,
        name: &str,
        options: &[&str],
        prompts: Prompts<'_>,
    ) -> Result<CommandResult> {
        let plan = PromptPlan::master_only(prompts.master);
        self.cmd(subcommand("open", options, &[name]), plan, prompts.rc)
    }

    /// `ls [prefix...]`
    pub fn ls(&mut self, prefixes: &[&str]) -> Result<CommandResult> {
        self.ls_with(prefixes, Prompts::default())
    }

    /// `ls` never prompts, so only the exit code of `prompts` is used
    pub fn ls_with(&mut self, prefixes: &[&str], prompts: Prompts<'_>) -> Result<CommandResult> {
        self.cmd(subcommand("ls", &[], prefixes), PromptPlan::list(), prompts.rc)
    }

    // =========================================================================
    // Agent
    // =========================================================================

    pub fn start_agent(&mut self) -> Result<AgentBinding> {
        self.agent.start()
    }

    pub fn stop_agent(&mut self) -> Result<()> {
        self.agent.stop()
    }

    pub fn agent(&self) -> &AgentController {
        &self.agent
    }

    /// Run `body` with an agent started for it. The agent is stopped
    /// afterwards even when `body` fails; the first error wins.
    pub fn with_agent<T, F>(&mut self, body: F) -> Result<T>
    where
        F: FnOnce(&mut Self) -> Result<T>,
    {
        self.start_agent()?;
        let outcome = body(self);
        let stopped = self.stop_agent();
        match (outcome, stopped) {
            (Err(e), _) => Err(e),
            (Ok(_), Err(e)) => Err(e),
            (Ok(value), Ok(())) => Ok(value),
        }
    }

    // =========================================================================
    // Assertions
    // =========================================================================

    fn last_or_panic(&self) -> &CommandResult {
        match &self.last {
            Some(result) => result,
            None => panic!("no successful command to assert on"),
        }
    }

    /// Non-blank output lines equal `expected`, in order
    pub fn assert_stdout_equals(&self, expected: &[&str]) {
        assert::assert_lines_equal(self.last_or_panic(), expected);
    }

    /// Non-blank output lines equal `expected`, in any order
    pub fn assert_stdout_contains(&self, expected: &[&str]) {
        assert::assert_lines_unordered(self.last_or_panic(), expected);
    }

    /// Output of the last command contains `text` anywhere
    pub fn assert_output_contains(&self, text: &str) {
        assert::assert_output_contains(self.last_or_panic(), text);
    }

    pub fn assert_no_password_prompt(&self) {
        assert::assert_no_password_prompt(self.last_or_panic());
    }

    pub fn assert_safe_exists(&self, name: &str) {
        assert!(
            self.workspace.safe_exists(name),
            "safe {} does not exist in {}",
            name,
            self.workspace.kp_ws().display()
        );
    }

    pub fn assert_safe_doesnt_exist(&self, name: &str) {
        assert!(
            !self.workspace.safe_exists(name),
            "safe {} still exists in {}",
            name,
            self.workspace.kp_ws().display()
        );
    }

    pub fn assert_safe_is_big_enough(&self, name: &str) {
        self.assert_safe_bigger_than(name, MIN_SAFE_SIZE);
    }

    pub fn assert_safe_bigger_than(&self, name: &str, size: u64) {
        match self.workspace.safe_size(name) {
            Ok(actual) => assert!(
                actual > size,
                "safe {} is {} bytes, expected more than {}",
                name,
                actual,
                size
            ),
            Err(e) => panic!("cannot stat safe {}: {}", name, e),
        }
    }

    pub fn assert_clear_text_exists(&self) {
        let path = self.workspace.clear_text_path();
        assert!(path.is_file(), "{} does not exist", path.display());
    }

    /// Lines of the editor's saved plaintext equal `expected`
    pub fn assert_clear_text_equals(&self, expected: &[&str]) {
        let path = self.workspace.clear_text_path();
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => panic!("cannot read {}: {}", path.display(), e),
        };
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines, expected, "plaintext in {} differs", path.display());
    }

    /// The kickpass state tree exists, or `sub` inside it
    pub fn assert_ws_exists(&self, sub: Option<&str>) {
        let path = match sub {
            Some(sub) => self.workspace.kp_ws().join(sub),
            None => self.workspace.kp_ws(),
        };
        assert!(path.is_dir(), "{} is not a directory", path.display());
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Kill any agent and remove the workspace. Safe to call repeatedly.
    pub fn teardown(&mut self) -> Result<()> {
        if self.agent.is_running() {
            warn!("Agent still running at teardown, killing it");
            self.agent.kill();
        }
        self.workspace.teardown()
    }
}

impl Drop for KpSession {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            warn!("Session teardown failed: {}", e);
        }
    }
}

fn subcommand(name: &str, options: &[&str], operands: &[&str]) -> Vec<String> {
    std::iter::once(name)
        .chain(options.iter().copied())
        .chain(operands.iter().copied())
        .map(str::to_string)
        .collect()
}
