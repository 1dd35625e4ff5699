//! Per-test kickpass home directory
//!
//! A [`Workspace`] is a fresh temporary directory used as `HOME` for every
//! kickpass process of one test. kickpass keeps its safes under
//! `<HOME>/.kickpass/<name>` and the `save` editor stub drops a copy of the
//! plaintext at `<HOME>/editor-save.txt`.
//!
//! Cleanup is automatic via the `TempDir` RAII guard; [`Workspace::teardown`]
//! does the same eagerly and can be called any number of times.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, warn};

use crate::error::{HarnessError, Result};

/// Name of kickpass' state directory inside `HOME`
pub const KP_WS_DIR: &str = ".kickpass";
/// Scratch plaintext written by the `save` editor stub
pub const CLEAR_TEXT_FILE: &str = "editor-save.txt";
/// Where built-in editor stubs are installed inside the workspace
const EDITORS_DIR: &str = "editors";

/// Editor scripts kickpass is pointed at through `EDITOR`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditorStub {
    /// Writes `$EDITOR_ENV` as the plaintext
    Env,
    /// Writes the current date as the plaintext
    Date,
    /// Copies the plaintext to `<HOME>/editor-save.txt`
    Save,
}

impl EditorStub {
    pub const ALL: [EditorStub; 3] = [EditorStub::Env, EditorStub::Date, EditorStub::Save];

    pub fn file_name(&self) -> &'static str {
        match self {
            EditorStub::Env => "TestFunctionalEditorEnv.sh",
            EditorStub::Date => "TestFunctionalEditorDate.sh",
            EditorStub::Save => "TestFunctionalEditorSave.sh",
        }
    }

    fn script(&self) -> &'static str {
        match self {
            EditorStub::Env => include_str!("../editors/TestFunctionalEditorEnv.sh"),
            EditorStub::Date => include_str!("../editors/TestFunctionalEditorDate.sh"),
            EditorStub::Save => include_str!("../editors/TestFunctionalEditorSave.sh"),
        }
    }
}

/// Isolated `HOME` for one test
pub struct Workspace {
    home: Option<TempDir>,
    root: PathBuf,
    editor_dir: PathBuf,
    editor: Option<EditorStub>,
    editor_env: Option<String>,
}

impl Workspace {
    /// Create a fresh home. Editor stubs come from `editor_dir` when given,
    /// otherwise the built-in ones are installed inside the workspace.
    ///
    /// On error nothing is left behind: the temporary directory is removed
    /// when the half-built `TempDir` is dropped.
    pub fn setup(editor_dir: Option<&Path>) -> Result<Self> {
        let home = tempfile::Builder::new().prefix("kptest-").tempdir()?;
        let root = home.path().to_path_buf();

        let editor_dir = match editor_dir {
            Some(dir) => {
                if !dir.is_dir() {
                    return Err(HarnessError::Config(format!(
                        "editor directory {} does not exist",
                        dir.display()
                    )));
                }
                dir.to_path_buf()
            }
            None => install_editor_stubs(&root.join(EDITORS_DIR))?,
        };

        debug!("Created workspace at {}", root.display());

        Ok(Self {
            home: Some(home),
            root,
            editor_dir,
            editor: None,
            editor_env: None,
        })
    }

    /// Workspace root, used as `HOME`
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// kickpass state tree
    pub fn kp_ws(&self) -> PathBuf {
        self.root.join(KP_WS_DIR)
    }

    pub fn clear_text_path(&self) -> PathBuf {
        self.root.join(CLEAR_TEXT_FILE)
    }

    pub fn safe_path(&self, name: &str) -> PathBuf {
        self.kp_ws().join(name)
    }

    pub fn safe_exists(&self, name: &str) -> bool {
        self.safe_path(name).is_file()
    }

    pub fn safe_size(&self, name: &str) -> Result<u64> {
        Ok(fs::metadata(self.safe_path(name))?.len())
    }

    pub fn editor_path(&self, stub: EditorStub) -> PathBuf {
        self.editor_dir.join(stub.file_name())
    }

    /// Select the editor stub for subsequent invocations. `payload` becomes
    /// `EDITOR_ENV`; `None` leaves a previously set payload in place.
    pub fn set_editor(&mut self, stub: EditorStub, payload: Option<&str>) {
        self.editor = Some(stub);
        if let Some(payload) = payload {
            self.editor_env = Some(payload.to_string());
        }
    }

    /// Environment every kickpass process of this test runs with
    pub fn env(&self) -> Vec<(String, String)> {
        let mut env = vec![("HOME".to_string(), self.root.display().to_string())];
        if let Some(stub) = self.editor {
            env.push((
                "EDITOR".to_string(),
                self.editor_path(stub).display().to_string(),
            ));
        }
        if let Some(payload) = &self.editor_env {
            env.push(("EDITOR_ENV".to_string(), payload.clone()));
        }
        env
    }

    pub fn is_torn_down(&self) -> bool {
        self.home.is_none()
    }

    /// Remove the whole tree. Tolerates a tree that is already gone and is a
    /// no-op on the second call.
    pub fn teardown(&mut self) -> Result<()> {
        let Some(home) = self.home.take() else {
            return Ok(());
        };
        match home.close() {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!("Failed to remove workspace {}: {}", self.root.display(), e);
                Err(e.into())
            }
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        let _ = self.teardown();
    }
}

fn install_editor_stubs(dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    for stub in EditorStub::ALL {
        let path = dir.join(stub.file_name());
        fs::write(&path, stub.script())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
        }
    }
    Ok(dir.to_path_buf())
}
