//! Prompt plans: the ordered cue/response protocol for one invocation
//!
//! A [`PromptPlan`] is a list of tagged [`PromptStep`]s. Each step expands to
//! one or two [`Exchange`]s (a cue to wait for and the line to answer with),
//! and the driver consumes exchanges strictly in order.
//!
//! A step that is not declared is *absent*: the driver will not wait for its
//! cue. That is different from a step whose value is the empty string, which
//! still waits for the cue and answers with an empty line.

use std::fmt;

/// Literal cue the CLI prints before reading a password
pub const PASSWORD_CUE: &str = "password:";
/// Literal cue the CLI prints before reading a password confirmation
pub const CONFIRM_CUE: &str = "confirm:";
/// Literal cue the CLI prints before reading a yes/no answer
pub const YES_NO_CUE: &str = "(y/n)";

/// Which prompt the harness is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptCue {
    MasterPassword,
    SecretPassword,
    Confirm,
    YesNo,
}

impl PromptCue {
    /// Text that must appear in the output before the response is sent
    pub fn literal(&self) -> &'static str {
        match self {
            PromptCue::MasterPassword | PromptCue::SecretPassword => PASSWORD_CUE,
            PromptCue::Confirm => CONFIRM_CUE,
            PromptCue::YesNo => YES_NO_CUE,
        }
    }
}

/// One declared step of a plan
#[derive(Clone, PartialEq, Eq)]
pub enum PromptStep {
    MasterPassword { value: String, confirm: bool },
    SecretPassword { value: String, confirm: bool },
    YesNo { value: String },
}

impl PromptStep {
    fn push_exchanges(&self, out: &mut Vec<Exchange>) {
        match self {
            PromptStep::MasterPassword { value, confirm } => {
                out.push(Exchange::new(PromptCue::MasterPassword, value));
                if *confirm {
                    out.push(Exchange::new(PromptCue::Confirm, value));
                }
            }
            PromptStep::SecretPassword { value, confirm } => {
                out.push(Exchange::new(PromptCue::SecretPassword, value));
                if *confirm {
                    out.push(Exchange::new(PromptCue::Confirm, value));
                }
            }
            PromptStep::YesNo { value } => {
                out.push(Exchange::new(PromptCue::YesNo, value));
            }
        }
    }

    fn label(&self) -> &'static str {
        match self {
            PromptStep::MasterPassword { confirm: true, .. } => "master+confirm",
            PromptStep::MasterPassword { confirm: false, .. } => "master",
            PromptStep::SecretPassword { confirm: true, .. } => "secret+confirm",
            PromptStep::SecretPassword { confirm: false, .. } => "secret",
            PromptStep::YesNo { .. } => "yes/no",
        }
    }
}

// Never print secrets, even in assertion failures.
impl fmt::Debug for PromptStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PromptStep({})", self.label())
    }
}

/// A cue to wait for and the line to send once it shows up
#[derive(Clone, PartialEq, Eq)]
pub struct Exchange {
    pub cue: PromptCue,
    pub response: String,
}

impl Exchange {
    fn new(cue: PromptCue, response: &str) -> Self {
        Self {
            cue,
            response: response.to_string(),
        }
    }
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("cue", &self.cue)
            .field("response_len", &self.response.len())
            .finish()
    }
}

/// Ordered list of prompt steps for one command invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromptPlan {
    steps: Vec<PromptStep>,
}

impl PromptPlan {
    /// A plan with no prompts at all
    pub fn new() -> Self {
        Self::default()
    }

    /// Expect the master password prompt, unless `value` is `None`
    pub fn master(mut self, value: Option<&str>, confirm: bool) -> Self {
        if let Some(value) = value {
            self.steps.push(PromptStep::MasterPassword {
                value: value.to_string(),
                confirm,
            });
        }
        self
    }

    /// Expect the secret password prompt, unless `value` is `None`
    pub fn secret(mut self, value: Option<&str>, confirm: bool) -> Self {
        if let Some(value) = value {
            self.steps.push(PromptStep::SecretPassword {
                value: value.to_string(),
                confirm,
            });
        }
        self
    }

    /// Expect a yes/no question, unless `value` is `None`
    pub fn yes_no(mut self, value: Option<&str>) -> Self {
        if let Some(value) = value {
            self.steps.push(PromptStep::YesNo {
                value: value.to_string(),
            });
        }
        self
    }

    // =========================================================================
    // Canonical shapes per subcommand
    // =========================================================================

    /// `init`: master password, confirmed
    pub fn init(master: Option<&str>) -> Self {
        Self::new().master(master, true)
    }

    /// `create`: master, then the secret password. Confirmation is skipped
    /// when the CLI generates the password itself.
    pub fn create(master: Option<&str>, password: Option<&str>, generate: bool) -> Self {
        Self::new().master(master, false).secret(password, !generate)
    }

    /// `edit`: like `create`, plus an optional yes/no when clearing the
    /// stored password
    pub fn edit(
        master: Option<&str>,
        password: Option<&str>,
        generate: bool,
        yes_no: Option<&str>,
    ) -> Self {
        Self::create(master, password, generate).yes_no(yes_no)
    }

    /// `rename`, `cat`, `delete` and `open`: master password only. Pass
    /// `None` for a forced delete.
    pub fn master_only(master: Option<&str>) -> Self {
        Self::new().master(master, false)
    }

    /// `ls`: no prompts
    pub fn list() -> Self {
        Self::new()
    }

    pub fn steps(&self) -> &[PromptStep] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Flatten the plan into the exact sequence of cues and responses
    pub fn exchanges(&self) -> Vec<Exchange> {
        let mut out = Vec::with_capacity(self.steps.len() * 2);
        for step in &self.steps {
            step.push_exchanges(&mut out);
        }
        out
    }

    /// Short description for logs, without any secret values
    pub fn summary(&self) -> String {
        if self.steps.is_empty() {
            return "no prompts".to_string();
        }
        self.steps
            .iter()
            .map(PromptStep::label)
            .collect::<Vec<_>>()
            .join(", ")
    }
}
