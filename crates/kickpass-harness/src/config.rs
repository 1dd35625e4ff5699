//! Harness configuration
//!
//! Values are resolved in three layers, later ones winning:
//!
//! 1. [`HarnessConfig::default()`]
//! 2. A TOML file named by `KP_HARNESS_CONFIG`, if set
//! 3. Environment variables (`KP`, `EDITOR_PATH`, `VALGRIND_COMMAND`,
//!    `VALGRIND_OPTIONS`, `KP_HARNESS_LOG_DIR`)
//!
//! # Example file
//!
//! ```toml
//! kp = "/usr/local/bin/kickpass"
//! prompt_timeout_ms = 5000
//!
//! [instrumentation]
//! command = "valgrind"
//! options = ["--leak-check=full"]
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{HarnessError, Result};
use crate::instrument::Instrumentation;

/// Environment variable naming an optional TOML config file
pub const CONFIG_FILE_ENV: &str = "KP_HARNESS_CONFIG";
/// Path to the kickpass binary under test
pub const KP_ENV: &str = "KP";
/// Directory containing external editor stubs
pub const EDITOR_PATH_ENV: &str = "EDITOR_PATH";
/// Memory checker to wrap every invocation with
pub const VALGRIND_COMMAND_ENV: &str = "VALGRIND_COMMAND";
/// Extra memory checker options, shell-quoted
pub const VALGRIND_OPTIONS_ENV: &str = "VALGRIND_OPTIONS";
/// Where memory checker logs are written
pub const LOG_DIR_ENV: &str = "KP_HARNESS_LOG_DIR";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// kickpass binary
    pub kp: Option<PathBuf>,
    /// Directory with `TestFunctionalEditor*.sh` stubs. Built-in stubs are
    /// used when unset.
    pub editor_dir: Option<PathBuf>,
    pub instrumentation: Option<Instrumentation>,
    /// Directory for `valgrind-<test>.log` files
    pub instrumentation_log_dir: PathBuf,
    /// Bounded wait for each prompt cue
    pub prompt_timeout_ms: u64,
    /// Bounded wait for the process to exit once the plan is consumed
    pub exit_timeout_ms: u64,
    /// Bounded wait for the agent's announcement and for its exit on stop
    pub agent_timeout_ms: u64,
    /// KDF memory limit passed to `init`
    pub init_memlimit: u64,
    /// KDF ops limit passed to `init`
    pub init_opslimit: u64,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            kp: None,
            editor_dir: None,
            instrumentation: None,
            instrumentation_log_dir: PathBuf::from("."),
            prompt_timeout_ms: 10_000,
            exit_timeout_ms: 30_000,
            agent_timeout_ms: 5_000,
            init_memlimit: 16_777_216,
            init_opslimit: 32_768,
        }
    }
}

impl HarnessConfig {
    /// Load from the optional config file and the process environment
    pub fn load() -> Result<Self> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::load_from(&vars)
    }

    /// Same as [`load`](Self::load) with an explicit variable map
    pub fn load_from(vars: &HashMap<String, String>) -> Result<Self> {
        let mut config = match vars.get(CONFIG_FILE_ENV) {
            Some(path) => Self::from_file(Path::new(path))?,
            None => Self::default(),
        };
        config.apply_env(vars)?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            HarnessError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| HarnessError::Config(e.to_string()))
    }

    fn apply_env(&mut self, vars: &HashMap<String, String>) -> Result<()> {
        if let Some(kp) = non_empty(vars, KP_ENV) {
            self.kp = Some(PathBuf::from(kp));
        }
        if let Some(dir) = non_empty(vars, EDITOR_PATH_ENV) {
            self.editor_dir = Some(PathBuf::from(dir));
        }
        if let Some(dir) = non_empty(vars, LOG_DIR_ENV) {
            self.instrumentation_log_dir = PathBuf::from(dir);
        }
        if let Some(command) = non_empty(vars, VALGRIND_COMMAND_ENV) {
            let options = match non_empty(vars, VALGRIND_OPTIONS_ENV) {
                Some(raw) => shlex::split(raw).ok_or_else(|| {
                    HarnessError::Config(format!("{} is not valid shell syntax", VALGRIND_OPTIONS_ENV))
                })?,
                None => Vec::new(),
            };
            self.instrumentation = Some(Instrumentation::new(command, options));
        }
        Ok(())
    }

    /// The kickpass binary, or a config error telling how to set it
    pub fn kp_binary(&self) -> Result<&Path> {
        self.kp.as_deref().ok_or_else(|| {
            HarnessError::Config(format!(
                "no kickpass binary configured: set {} or `kp` in {}",
                KP_ENV, CONFIG_FILE_ENV
            ))
        })
    }

    pub fn prompt_timeout(&self) -> Duration {
        Duration::from_millis(self.prompt_timeout_ms)
    }

    pub fn exit_timeout(&self) -> Duration {
        Duration::from_millis(self.exit_timeout_ms)
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_millis(self.agent_timeout_ms)
    }
}

fn non_empty<'a>(vars: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    vars.get(key).map(String::as_str).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_without_environment() {
        let config = HarnessConfig::load_from(&HashMap::new()).unwrap();
        assert!(config.kp.is_none());
        assert!(config.instrumentation.is_none());
        assert_eq!(config.prompt_timeout(), Duration::from_secs(10));
        assert_eq!(config.init_memlimit, 16_777_216);
        assert!(config.kp_binary().is_err());
    }

    #[test]
    fn environment_sets_binary_and_instrumentation() {
        let config = HarnessConfig::load_from(&vars(&[
            ("KP", "/opt/kp/bin/kickpass"),
            ("EDITOR_PATH", "/opt/kp/test/editors"),
            ("VALGRIND_COMMAND", "valgrind"),
            ("VALGRIND_OPTIONS", "--leak-check=full --suppressions='my supp.txt'"),
        ]))
        .unwrap();

        assert_eq!(
            config.kp_binary().unwrap(),
            Path::new("/opt/kp/bin/kickpass")
        );
        assert_eq!(
            config.editor_dir.as_deref(),
            Some(Path::new("/opt/kp/test/editors"))
        );
        let instrumentation = config.instrumentation.unwrap();
        assert_eq!(instrumentation.command, "valgrind");
        assert_eq!(
            instrumentation.options,
            vec!["--leak-check=full", "--suppressions=my supp.txt"]
        );
    }

    #[test]
    fn empty_variables_are_ignored() {
        let config = HarnessConfig::load_from(&vars(&[("KP", ""), ("VALGRIND_COMMAND", "")]))
            .unwrap();
        assert!(config.kp.is_none());
        assert!(config.instrumentation.is_none());
    }

    #[test]
    fn unbalanced_quotes_in_options_are_rejected() {
        let err = HarnessConfig::load_from(&vars(&[
            ("VALGRIND_COMMAND", "valgrind"),
            ("VALGRIND_OPTIONS", "--log-fd='9"),
        ]))
        .unwrap_err();
        assert!(matches!(err, HarnessError::Config(_)));
    }

    #[test]
    fn file_is_overridden_by_environment() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
kp = "/from/file/kickpass"
prompt_timeout_ms = 2500

[instrumentation]
command = "valgrind"
options = ["--track-origins=yes"]
"#
        )
        .unwrap();

        let path = file.path().display().to_string();
        let config = HarnessConfig::load_from(&vars(&[
            ("KP_HARNESS_CONFIG", &path),
            ("KP", "/from/env/kickpass"),
        ]))
        .unwrap();

        assert_eq!(config.kp_binary().unwrap(), Path::new("/from/env/kickpass"));
        assert_eq!(config.prompt_timeout_ms, 2500);
        assert_eq!(config.exit_timeout_ms, 30_000);
        assert_eq!(
            config.instrumentation.unwrap().options,
            vec!["--track-origins=yes"]
        );
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let err = HarnessConfig::from_toml_str("prompt_timeout_ms = \"soon\"").unwrap_err();
        assert!(matches!(err, HarnessError::Config(_)));
    }
}
