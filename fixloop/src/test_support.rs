//! Test-only helpers: scripted oracles and runners, and scratch projects.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

use crate::core::types::{CommandResult, FileWrite, Remediation, SolutionType};
use crate::io::oracle::DiagnosisOracle;
use crate::io::process::CommandRunner;

/// One canned oracle reply.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Raw reply text, parsed like a real oracle response.
    Text(String),
    /// The oracle call itself fails.
    Fail(String),
}

/// Oracle that replays queued replies and records every prompt it receives.
///
/// Once the queue is empty, `fallback` is returned for every further call.
pub struct ScriptedOracle {
    replies: RefCell<VecDeque<ScriptedReply>>,
    fallback: ScriptedReply,
    prompts: RefCell<Vec<String>>,
}

impl ScriptedOracle {
    pub fn new(replies: Vec<ScriptedReply>, fallback: ScriptedReply) -> Self {
        Self {
            replies: RefCell::new(replies.into()),
            fallback,
            prompts: RefCell::new(Vec::new()),
        }
    }

    /// Always answers with the same remediation.
    pub fn always(remediation: &Remediation) -> Self {
        Self::new(Vec::new(), ScriptedReply::Text(remediation_json(remediation)))
    }

    /// Always answers with text that contains no JSON.
    pub fn unparseable() -> Self {
        Self::new(
            Vec::new(),
            ScriptedReply::Text("I am not sure what went wrong.".to_string()),
        )
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.borrow().clone()
    }

    pub fn calls(&self) -> usize {
        self.prompts.borrow().len()
    }
}

impl DiagnosisOracle for ScriptedOracle {
    fn complete(&self, prompt: &str) -> Result<String> {
        self.prompts.borrow_mut().push(prompt.to_string());
        let reply = self
            .replies
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        match reply {
            ScriptedReply::Text(text) => Ok(text),
            ScriptedReply::Fail(message) => Err(anyhow!(message)),
        }
    }
}

/// Runner that records commands instead of spawning them.
pub struct RecordingRunner {
    exit_code: i32,
    calls: RefCell<Vec<(String, PathBuf)>>,
}

impl RecordingRunner {
    pub fn succeeding() -> Self {
        Self::with_exit_code(0)
    }

    pub fn failing() -> Self {
        Self::with_exit_code(1)
    }

    pub fn with_exit_code(exit_code: i32) -> Self {
        Self {
            exit_code,
            calls: RefCell::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<(String, PathBuf)> {
        self.calls.borrow().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.calls
            .borrow()
            .iter()
            .map(|(command, _)| command.clone())
            .collect()
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&self, command: &str, workdir: &Path, _timeout: Duration) -> CommandResult {
        self.calls
            .borrow_mut()
            .push((command.to_string(), workdir.to_path_buf()));
        CommandResult {
            command: command.to_string(),
            working_directory: workdir.to_path_buf(),
            stdout: String::new(),
            stderr: if self.exit_code == 0 {
                String::new()
            } else {
                format!("{command}: failed")
            },
            exit_code: self.exit_code,
            succeeded: self.exit_code == 0,
        }
    }
}

/// Scratch project root backed by a temp directory.
pub struct TestProject {
    dir: TempDir,
}

impl TestProject {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp project")?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, relative: &str, contents: &str) -> Result<()> {
        let path = self.dir.path().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
    }

    pub fn read(&self, relative: &str) -> Result<String> {
        let path = self.dir.path().join(relative);
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }
}

/// Remediation with no writes and no commands.
pub fn empty_remediation(root_cause: &str) -> Remediation {
    Remediation {
        root_cause: root_cause.to_string(),
        solution_type: SolutionType::CommandRun,
        files_to_create: Vec::new(),
        files_to_update: Vec::new(),
        commands_to_run: Vec::new(),
        verification_command: None,
    }
}

/// Remediation that writes the given files.
pub fn write_remediation(root_cause: &str, files: &[(&str, &str)]) -> Remediation {
    Remediation {
        files_to_create: files
            .iter()
            .map(|(path, content)| FileWrite::new(*path, *content))
            .collect(),
        solution_type: SolutionType::FileCreate,
        ..empty_remediation(root_cause)
    }
}

/// Render a remediation the way an oracle would reply: prose around a fenced payload.
pub fn remediation_json(remediation: &Remediation) -> String {
    let payload = serde_json::to_string_pretty(remediation).unwrap_or_default();
    format!("Here is the fix.\n```json\n{payload}\n```\n")
}
