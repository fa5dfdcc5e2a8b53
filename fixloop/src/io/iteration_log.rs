//! Per-iteration diagnostic artifacts for repair and update sessions.
//!
//! Layout: `<log_dir>/<iteration>/entry.json` holds the history entry and
//! `<log_dir>/<iteration>/output.log` the transcript of the command that failed, when
//! one ran.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::types::{CommandResult, HistoryEntry};

#[derive(Debug, Clone, Serialize)]
pub struct IterationRecord<'a> {
    pub recorded_at: String,
    pub exit_code: Option<i32>,
    pub working_directory: Option<&'a Path>,
    #[serde(flatten)]
    pub entry: &'a HistoryEntry,
    pub applied: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct IterationPaths {
    pub dir: PathBuf,
    pub entry_path: PathBuf,
    pub output_path: PathBuf,
}

impl IterationPaths {
    pub fn new(log_dir: &Path, iteration: u32) -> Self {
        let dir = log_dir.join(iteration.to_string());
        Self {
            entry_path: dir.join("entry.json"),
            output_path: dir.join("output.log"),
            dir,
        }
    }
}

pub struct IterationWriteRequest<'a> {
    pub log_dir: &'a Path,
    pub entry: &'a HistoryEntry,
    /// Command run this iteration; `None` when the session stopped before running one.
    pub result: Option<&'a CommandResult>,
    /// `None` when the remediation was degraded and not applied.
    pub applied: Option<bool>,
    pub recorded_at: DateTime<Utc>,
}

pub fn write_iteration(request: &IterationWriteRequest<'_>) -> Result<IterationPaths> {
    let paths = IterationPaths::new(request.log_dir, request.entry.iteration);
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create iteration dir {}", paths.dir.display()))?;

    let record = IterationRecord {
        recorded_at: request.recorded_at.to_rfc3339(),
        exit_code: request.result.map(|result| result.exit_code),
        working_directory: request
            .result
            .map(|result| result.working_directory.as_path()),
        entry: request.entry,
        applied: request.applied,
    };
    write_json(&paths.entry_path, &record)?;
    if let Some(result) = request.result {
        write_text(&paths.output_path, &transcript(result))?;
    }
    Ok(paths)
}

fn transcript(result: &CommandResult) -> String {
    format!(
        "$ {}\n[exit {}]\n--- stdout ---\n{}\n--- stderr ---\n{}\n",
        result.command, result.exit_code, result.stdout, result.stderr
    )
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    write_text(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::empty_remediation;

    #[test]
    fn iteration_paths_are_stable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = IterationPaths::new(temp.path(), 3);

        assert!(paths.dir.ends_with("3"));
        assert!(paths.entry_path.ends_with("3/entry.json"));
        assert!(paths.output_path.ends_with("3/output.log"));
    }

    #[test]
    fn writes_entry_and_transcript() {
        let temp = tempfile::tempdir().expect("tempdir");
        let result = CommandResult {
            command: "make test".to_string(),
            working_directory: temp.path().to_path_buf(),
            stdout: "running".to_string(),
            stderr: "FAIL".to_string(),
            exit_code: 2,
            succeeded: false,
        };
        let entry = HistoryEntry {
            iteration: 1,
            command: "make test".to_string(),
            error_snippet: "FAIL".to_string(),
            remediation: empty_remediation("flaky"),
        };

        let paths = write_iteration(&IterationWriteRequest {
            log_dir: temp.path(),
            entry: &entry,
            result: Some(&result),
            applied: Some(true),
            recorded_at: Utc::now(),
        })
        .expect("write logs");

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&paths.entry_path).expect("read entry"))
                .expect("parse entry");
        assert_eq!(json["iteration"], 1);
        assert_eq!(json["exit_code"], 2);
        assert_eq!(json["applied"], true);
        assert_eq!(json["remediation"]["root_cause"], "flaky");
        assert!(json["recorded_at"].is_string());

        let output = fs::read_to_string(&paths.output_path).expect("read output");
        assert!(output.starts_with("$ make test\n[exit 2]"));
        assert!(output.contains("--- stderr ---\nFAIL"));
    }

    #[test]
    fn entry_without_command_has_no_transcript() {
        let temp = tempfile::tempdir().expect("tempdir");
        let entry = HistoryEntry {
            iteration: 2,
            command: "make test".to_string(),
            error_snippet: "FAIL".to_string(),
            remediation: empty_remediation("nothing left to change"),
        };

        let paths = write_iteration(&IterationWriteRequest {
            log_dir: temp.path(),
            entry: &entry,
            result: None,
            applied: None,
            recorded_at: Utc::now(),
        })
        .expect("write logs");

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&paths.entry_path).expect("read entry"))
                .expect("parse entry");
        assert!(json["exit_code"].is_null());
        assert!(json["applied"].is_null());
        assert!(!paths.output_path.exists());
    }
}
