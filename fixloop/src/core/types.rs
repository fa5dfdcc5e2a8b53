//! Shared value types for the repair loop.
//!
//! These types are produced once and never mutated afterwards. They carry no I/O and
//! serialize deterministically so they can be logged, reported, and fed back to the
//! diagnosis oracle verbatim.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Exit code reserved for a command killed by its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;
/// Exit code used when the command could not be spawned or waited on.
pub const FAULT_EXIT_CODE: i32 = 1;

/// Captured outcome of a single shell command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub command: String,
    pub working_directory: PathBuf,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub succeeded: bool,
}

impl CommandResult {
    pub fn timed_out(command: &str, working_directory: PathBuf, timeout_secs: u64) -> Self {
        Self {
            command: command.to_string(),
            working_directory,
            stdout: String::new(),
            stderr: format!("Command timed out after {timeout_secs} seconds"),
            exit_code: TIMEOUT_EXIT_CODE,
            succeeded: false,
        }
    }

    pub fn fault(command: &str, working_directory: PathBuf, description: String) -> Self {
        Self {
            command: command.to_string(),
            working_directory,
            stdout: String::new(),
            stderr: description,
            exit_code: FAULT_EXIT_CODE,
            succeeded: false,
        }
    }

    /// stdout followed by stderr, the transcript the context extractor scans.
    pub fn combined_output(&self) -> String {
        let mut combined = String::with_capacity(self.stdout.len() + self.stderr.len() + 1);
        combined.push_str(&self.stdout);
        if !self.stdout.is_empty() && !self.stderr.is_empty() {
            combined.push('\n');
        }
        combined.push_str(&self.stderr);
        combined
    }

    /// Text recorded in history for a failed run.
    pub fn error_snippet(&self) -> String {
        if self.stderr.trim().is_empty() {
            "Unknown error".to_string()
        } else {
            self.stderr.clone()
        }
    }
}

/// Category of fix declared by the oracle.
///
/// `Manual` and `Error` mark degraded remediations that the loop never applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SolutionType {
    FileCreate,
    FileUpdate,
    CommandRun,
    Manual,
    Error,
}

impl SolutionType {
    /// Map a wire name onto a known type. Legacy aliases from older prompts are accepted.
    pub fn from_wire(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_uppercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "FILE_CREATE" => Some(Self::FileCreate),
            "FILE_UPDATE" | "CONFIG_FIX" => Some(Self::FileUpdate),
            "COMMAND_RUN" | "DEPENDENCY_INSTALL" => Some(Self::CommandRun),
            "MANUAL" | "MANUAL_ANALYSIS" => Some(Self::Manual),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn is_degraded(self) -> bool {
        matches!(self, Self::Manual | Self::Error)
    }
}

/// One full-content file write, relative to the project root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileWrite {
    #[serde(rename = "path")]
    pub relative_path: String,
    pub content: String,
}

impl FileWrite {
    pub fn new(relative_path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            relative_path: relative_path.into(),
            content: content.into(),
        }
    }
}

/// Structured fix proposed for the most recent failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Remediation {
    pub root_cause: String,
    pub solution_type: SolutionType,
    pub files_to_create: Vec<FileWrite>,
    pub files_to_update: Vec<FileWrite>,
    pub commands_to_run: Vec<String>,
    pub verification_command: Option<String>,
}

impl Remediation {
    /// A no-op remediation. `solution_type` should be `Manual` or `Error`.
    pub fn degraded(solution_type: SolutionType, root_cause: impl Into<String>) -> Self {
        Self {
            root_cause: root_cause.into(),
            solution_type,
            files_to_create: Vec::new(),
            files_to_update: Vec::new(),
            commands_to_run: Vec::new(),
            verification_command: None,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.solution_type.is_degraded()
    }

    /// True when there is nothing to write and nothing to run.
    pub fn is_empty(&self) -> bool {
        self.files_to_create.is_empty()
            && self.files_to_update.is_empty()
            && self.commands_to_run.is_empty()
    }
}

/// One recorded failed iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub iteration: u32,
    pub command: String,
    pub error_snippet: String,
    pub remediation: Remediation,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_snippet_falls_back_when_stderr_blank() {
        let mut result = CommandResult::fault("false", PathBuf::from("."), "  \n".to_string());
        assert_eq!(result.error_snippet(), "Unknown error");
        result.stderr = "boom".to_string();
        assert_eq!(result.error_snippet(), "boom");
    }

    #[test]
    fn combined_output_joins_streams() {
        let result = CommandResult {
            command: "make".to_string(),
            working_directory: PathBuf::from("."),
            stdout: "building".to_string(),
            stderr: "main.go:3: undefined".to_string(),
            exit_code: 2,
            succeeded: false,
        };
        assert_eq!(result.combined_output(), "building\nmain.go:3: undefined");
    }

    #[test]
    fn timeout_result_uses_reserved_exit_code() {
        let result = CommandResult::timed_out("sleep 5", PathBuf::from("."), 1);
        assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
        assert!(!result.succeeded);
        assert!(result.stderr.contains("timed out after 1 seconds"));
    }

    #[test]
    fn solution_type_accepts_legacy_names() {
        assert_eq!(
            SolutionType::from_wire("dependency_install"),
            Some(SolutionType::CommandRun)
        );
        assert_eq!(
            SolutionType::from_wire("CONFIG_FIX"),
            Some(SolutionType::FileUpdate)
        );
        assert_eq!(
            SolutionType::from_wire("MANUAL_ANALYSIS"),
            Some(SolutionType::Manual)
        );
        assert_eq!(SolutionType::from_wire("rewrite everything"), None);
    }

    #[test]
    fn solution_type_serializes_upper_snake() {
        let raw = serde_json::to_string(&SolutionType::FileCreate).expect("serialize");
        assert_eq!(raw, "\"FILE_CREATE\"");
    }
}
