//! Repair loop controller for `fixloop repair`.
//!
//! One session runs a target command until it exits 0 or the iteration budget is spent.
//! Each failed run is diagnosed by the oracle, recorded in the session history, and its
//! remediation is applied before the next run. Nothing in the loop escalates to an error:
//! oracle failures become degraded remediations and apply failures are logged.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, info_span, warn};

use crate::core::history::History;
use crate::core::types::{CommandResult, Remediation};
use crate::io::applier::RemediationApplier;
use crate::io::config::RepairConfig;
use crate::io::context::{ContextLimits, extract};
use crate::io::iteration_log::{IterationWriteRequest, write_iteration};
use crate::io::oracle::{DiagnosisOracle, DiagnosisRequest, diagnose};
use crate::io::ports::cleanup_ports;
use crate::io::process::CommandRunner;
use crate::io::prompt::{PromptBuilder, PromptLimits};

/// Knobs shared by every session of one invocation.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub max_iterations: u32,
    pub command_timeout: Duration,
    /// Pause between applying a remediation and the next run.
    pub settle_delay: Duration,
    /// Pause after killing a target's ports before it runs.
    pub port_cleanup_delay: Duration,
    pub context: ContextLimits,
    pub prompt: PromptLimits,
    /// When set, every failed iteration is written under this directory.
    pub log_dir: Option<PathBuf>,
}

impl SessionSettings {
    pub fn from_config(cfg: &RepairConfig) -> Self {
        Self {
            max_iterations: cfg.max_iterations,
            command_timeout: cfg.command_timeout(),
            settle_delay: cfg.settle_delay(),
            port_cleanup_delay: cfg.port_cleanup_delay(),
            context: cfg.context_limits(),
            prompt: cfg.prompt_limits(),
            log_dir: None,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&RepairConfig::default())
    }
}

/// Command to repair and where it runs.
#[derive(Debug, Clone)]
pub struct RepairTarget {
    pub command: String,
    /// Root that bounds context reads and remediation writes.
    pub project_root: PathBuf,
    /// Working directory relative to the root; defaults to the root.
    pub workdir: Option<String>,
    /// Ports freed before every run of the command.
    pub cleanup_ports: Vec<u16>,
}

impl RepairTarget {
    pub fn new(command: impl Into<String>, project_root: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            project_root: project_root.into(),
            workdir: None,
            cleanup_ports: Vec::new(),
        }
    }

    pub fn with_workdir(mut self, workdir: Option<String>) -> Self {
        self.workdir = workdir;
        self
    }

    pub fn with_cleanup_ports(mut self, ports: Vec<u16>) -> Self {
        self.cleanup_ports = ports;
        self
    }

    pub fn working_directory(&self) -> PathBuf {
        match &self.workdir {
            Some(dir) => self.project_root.join(dir),
            None => self.project_root.clone(),
        }
    }

    /// Command line the context extractor scans for a `cd` prefix.
    ///
    /// A configured workdir acts like a leading `cd` so relative paths in the
    /// transcript resolve against it.
    fn context_command_line(&self) -> String {
        match &self.workdir {
            Some(dir) => format!("cd {dir} && {}", self.command),
            None => self.command.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RepairStatus {
    /// The target exited 0 on this iteration.
    Succeeded { iteration: u32 },
    /// Every iteration failed.
    Exhausted { max_iterations: u32 },
}

/// Final state of a session, handed to reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepairOutcome {
    pub command: String,
    #[serde(flatten)]
    pub status: RepairStatus,
    pub history: History,
}

impl RepairOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self.status, RepairStatus::Succeeded { .. })
    }
}

/// Drives repair sessions with one runner and one oracle.
pub struct RepairLoop<'a, R: CommandRunner, O: DiagnosisOracle> {
    runner: &'a R,
    oracle: &'a O,
    prompts: PromptBuilder,
    settings: SessionSettings,
}

impl<'a, R: CommandRunner, O: DiagnosisOracle> RepairLoop<'a, R, O> {
    pub fn new(runner: &'a R, oracle: &'a O, settings: SessionSettings) -> Self {
        Self {
            runner,
            oracle,
            prompts: PromptBuilder::new(settings.prompt),
            settings,
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Run one session with the configured log directory.
    pub fn run(&self, target: &RepairTarget) -> RepairOutcome {
        self.run_logged(target, self.settings.log_dir.as_deref())
    }

    /// Run one session, writing iteration logs under `log_dir` when given.
    pub fn run_logged(&self, target: &RepairTarget, log_dir: Option<&Path>) -> RepairOutcome {
        let max_iterations = self.settings.max_iterations;
        let workdir = target.working_directory();
        let context_line = target.context_command_line();
        let applier = RemediationApplier::new(self.runner, self.settings.command_timeout);
        let mut history = History::new();

        for iteration in 1..=max_iterations {
            let _span = info_span!("iteration", iteration, max_iterations).entered();
            cleanup_ports(
                self.runner,
                &target.project_root,
                &target.cleanup_ports,
                self.settings.port_cleanup_delay,
            );
            info!(command = %target.command, "running target command");
            let result = self
                .runner
                .run(&target.command, &workdir, self.settings.command_timeout);
            if result.succeeded {
                info!("target command succeeded");
                return RepairOutcome {
                    command: target.command.clone(),
                    status: RepairStatus::Succeeded { iteration },
                    history,
                };
            }
            warn!(exit_code = result.exit_code, "target command failed");

            let bundle = extract(
                &result.combined_output(),
                &target.project_root,
                &context_line,
                &self.settings.context,
            );
            let additional_context = additional_context(iteration, max_iterations, &bundle.render());
            let trailing = history.render_trailing(self.settings.prompt.history_window);
            let remediation = diagnose(
                self.oracle,
                &self.prompts,
                &DiagnosisRequest {
                    command: &target.command,
                    result: &result,
                    additional_context: &additional_context,
                    history: trailing.as_deref(),
                },
            );

            let entry = history.record(&target.command, result.error_snippet(), remediation);
            let applied = self.apply(&applier, &entry.remediation, &target.project_root);

            if let Some(dir) = log_dir {
                let request = IterationWriteRequest {
                    log_dir: dir,
                    entry,
                    result: Some(&result),
                    applied,
                    recorded_at: Utc::now(),
                };
                if let Err(err) = write_iteration(&request) {
                    warn!(err = %format!("{err:#}"), "failed to write iteration log");
                }
            }

            if iteration < max_iterations && !self.settings.settle_delay.is_zero() {
                thread::sleep(self.settings.settle_delay);
            }
        }

        warn!(max_iterations, "repair attempts exhausted");
        RepairOutcome {
            command: target.command.clone(),
            status: RepairStatus::Exhausted { max_iterations },
            history,
        }
    }

    /// Apply a remediation and run its verification command.
    ///
    /// Returns `None` for degraded remediations, which are never applied.
    fn apply(
        &self,
        applier: &RemediationApplier<'_, R>,
        remediation: &Remediation,
        project_root: &Path,
    ) -> Option<bool> {
        if remediation.is_degraded() {
            warn!(
                solution_type = ?remediation.solution_type,
                root_cause = %remediation.root_cause,
                "degraded remediation, nothing applied"
            );
            return None;
        }
        let applied = applier.apply(remediation, project_root);
        if applied {
            info!("remediation applied");
        } else {
            warn!("remediation partially applied");
        }
        if let Some(verification) = &remediation.verification_command {
            let check = self
                .runner
                .run(verification, project_root, self.settings.command_timeout);
            log_verification(&check);
        }
        Some(applied)
    }
}

fn log_verification(check: &CommandResult) {
    if check.succeeded {
        info!(command = %check.command, "verification command passed");
    } else {
        warn!(
            command = %check.command,
            exit_code = check.exit_code,
            "verification command failed"
        );
    }
}

fn additional_context(iteration: u32, max_iterations: u32, bundle: &str) -> String {
    let banner = format!("Repair iteration {iteration} of {max_iterations}.");
    if bundle.is_empty() {
        banner
    } else {
        format!("{banner}\n\n{bundle}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{FileWrite, SolutionType};
    use crate::test_support::{
        RecordingRunner, ScriptedOracle, ScriptedReply, TestProject, empty_remediation,
        remediation_json, write_remediation,
    };

    fn settings(max_iterations: u32) -> SessionSettings {
        SessionSettings {
            max_iterations,
            settle_delay: Duration::ZERO,
            port_cleanup_delay: Duration::ZERO,
            ..SessionSettings::default()
        }
    }

    #[test]
    fn passing_command_succeeds_without_diagnosis() {
        let project = TestProject::new().expect("project");
        let runner = RecordingRunner::succeeding();
        let oracle = ScriptedOracle::unparseable();
        let repair = RepairLoop::new(&runner, &oracle, settings(5));

        let outcome = repair.run(&RepairTarget::new("true", project.path()));
        assert!(outcome.succeeded());
        assert_eq!(outcome.status, RepairStatus::Succeeded { iteration: 1 });
        assert!(outcome.history.is_empty());
        assert_eq!(oracle.calls(), 0);
        assert_eq!(runner.commands(), vec!["true"]);
    }

    #[test]
    fn exhaustion_records_every_iteration() {
        let project = TestProject::new().expect("project");
        let runner = RecordingRunner::failing();
        let oracle = ScriptedOracle::always(&empty_remediation("no idea"));
        let repair = RepairLoop::new(&runner, &oracle, settings(3));

        let outcome = repair.run(&RepairTarget::new("exit 1", project.path()));
        assert!(!outcome.succeeded());
        assert_eq!(outcome.status, RepairStatus::Exhausted { max_iterations: 3 });
        let iterations: Vec<u32> = outcome.history.entries().iter().map(|e| e.iteration).collect();
        assert_eq!(iterations, vec![1, 2, 3]);
        assert!(
            outcome
                .history
                .entries()
                .iter()
                .all(|e| e.remediation.is_empty() && e.command == "exit 1")
        );
        assert_eq!(oracle.calls(), 3);
        assert_eq!(runner.commands(), vec!["exit 1"; 3]);
    }

    #[test]
    fn blank_stderr_is_recorded_as_unknown_error() {
        struct SilentFailure;
        impl CommandRunner for SilentFailure {
            fn run(&self, command: &str, workdir: &Path, _timeout: Duration) -> CommandResult {
                CommandResult {
                    command: command.to_string(),
                    working_directory: workdir.to_path_buf(),
                    stdout: "partial output".to_string(),
                    stderr: String::new(),
                    exit_code: 2,
                    succeeded: false,
                }
            }
        }

        let project = TestProject::new().expect("project");
        let oracle = ScriptedOracle::always(&empty_remediation("?"));
        let repair = RepairLoop::new(&SilentFailure, &oracle, settings(1));

        let outcome = repair.run(&RepairTarget::new("make", project.path()));
        assert_eq!(outcome.history.entries()[0].error_snippet, "Unknown error");
    }

    #[test]
    fn applies_remediation_before_next_run() {
        let project = TestProject::new().expect("project");
        let runner = RecordingRunner::failing();
        let oracle = ScriptedOracle::always(&write_remediation(
            "missing config",
            &[("config/app.yaml", "port: 8080\n")],
        ));
        let repair = RepairLoop::new(&runner, &oracle, settings(1));

        let outcome = repair.run(&RepairTarget::new("go run .", project.path()));
        assert!(!outcome.succeeded());
        assert_eq!(
            project.read("config/app.yaml").expect("written"),
            "port: 8080\n"
        );
    }

    #[test]
    fn degraded_remediations_are_not_applied() {
        let project = TestProject::new().expect("project");
        let runner = RecordingRunner::failing();
        let manual = Remediation {
            solution_type: SolutionType::Manual,
            files_to_create: vec![FileWrite::new("should_not_exist.txt", "x")],
            commands_to_run: vec!["rm -rf build".to_string()],
            ..empty_remediation("needs a human")
        };
        let oracle = ScriptedOracle::always(&manual);
        let repair = RepairLoop::new(&runner, &oracle, settings(2));

        let outcome = repair.run(&RepairTarget::new("make", project.path()));
        assert_eq!(outcome.history.len(), 2);
        assert_eq!(
            outcome.history.entries()[0].remediation.solution_type,
            SolutionType::Manual
        );
        assert!(!project.path().join("should_not_exist.txt").exists());
        assert_eq!(runner.commands(), vec!["make", "make"]);
    }

    #[test]
    fn unparseable_replies_still_record_history() {
        let project = TestProject::new().expect("project");
        let runner = RecordingRunner::failing();
        let oracle = ScriptedOracle::unparseable();
        let repair = RepairLoop::new(&runner, &oracle, settings(2));

        let outcome = repair.run(&RepairTarget::new("make", project.path()));
        assert_eq!(outcome.history.len(), 2);
        assert!(outcome.history.entries().iter().all(|e| e.remediation.is_degraded()));
        assert_eq!(oracle.calls(), 4);
    }

    #[test]
    fn oracle_sees_only_trailing_history() {
        let project = TestProject::new().expect("project");
        let runner = RecordingRunner::failing();
        let oracle = ScriptedOracle::always(&empty_remediation("retry"));
        let repair = RepairLoop::new(&runner, &oracle, settings(4));

        repair.run(&RepairTarget::new("make", project.path()));
        let prompts = oracle.prompts();
        assert_eq!(prompts.len(), 4);
        assert!(prompts[0].contains("## Previous attempts (most recent 2)\n\nNone"));
        assert!(prompts[0].contains("Repair iteration 1 of 4."));
        let last = &prompts[3];
        assert!(last.contains("Repair iteration 4 of 4."));
        assert!(!last.contains("\"iteration\": 1,"));
        assert!(last.contains("\"iteration\": 2,"));
        assert!(last.contains("\"iteration\": 3,"));
    }

    #[test]
    fn verification_command_runs_after_apply() {
        let project = TestProject::new().expect("project");
        let runner = RecordingRunner::failing();
        let fix = Remediation {
            commands_to_run: vec!["go mod tidy".to_string()],
            verification_command: Some("go vet ./...".to_string()),
            ..empty_remediation("missing module")
        };
        let oracle = ScriptedOracle::always(&fix);
        let repair = RepairLoop::new(&runner, &oracle, settings(1));

        repair.run(&RepairTarget::new("go build", project.path()));
        assert_eq!(
            runner.commands(),
            vec!["go build", "go mod tidy", "go vet ./..."]
        );
    }

    #[test]
    fn target_runs_in_configured_workdir() {
        let project = TestProject::new().expect("project");
        let runner = RecordingRunner::succeeding();
        let oracle = ScriptedOracle::unparseable();
        let repair = RepairLoop::new(&runner, &oracle, settings(1));

        let target = RepairTarget::new("go build", project.path())
            .with_workdir(Some("backend".to_string()));
        repair.run(&target);
        assert_eq!(runner.calls()[0].1, project.path().join("backend"));
    }

    #[test]
    fn workdir_files_reach_the_oracle_context() {
        let project = TestProject::new().expect("project");
        project.write("backend/main.go", "package main\n").expect("write");
        let runner = RecordingRunner::with_exit_code(2);
        let oracle = ScriptedOracle::always(&empty_remediation("x"));
        let repair = RepairLoop::new(&runner, &oracle, settings(1));

        // RecordingRunner's stderr names the command, which names the file.
        let target = RepairTarget::new("go vet ./main.go", project.path())
            .with_workdir(Some("backend".to_string()));
        repair.run(&target);
        assert!(oracle.prompts()[0].contains("--- START OF ./main.go ---\npackage main"));
    }

    #[test]
    fn writes_iteration_logs_when_configured() {
        let project = TestProject::new().expect("project");
        let logs = tempfile::tempdir().expect("logs");
        let runner = RecordingRunner::failing();
        let oracle = ScriptedOracle::new(
            vec![ScriptedReply::Text(remediation_json(&empty_remediation("first")))],
            ScriptedReply::Text(remediation_json(&empty_remediation("second"))),
        );
        let repair = RepairLoop::new(
            &runner,
            &oracle,
            SessionSettings {
                log_dir: Some(logs.path().to_path_buf()),
                ..settings(2)
            },
        );

        repair.run(&RepairTarget::new("make", project.path()));
        assert!(logs.path().join("1/entry.json").is_file());
        assert!(logs.path().join("2/output.log").is_file());
        let entry = std::fs::read_to_string(logs.path().join("2/entry.json")).expect("read");
        assert!(entry.contains("\"root_cause\": \"second\""));
    }

    #[test]
    fn ports_are_freed_before_every_run() {
        let project = TestProject::new().expect("project");
        let runner = RecordingRunner::failing();
        let oracle = ScriptedOracle::always(&empty_remediation("port busy"));
        let repair = RepairLoop::new(&runner, &oracle, settings(3));

        let target = RepairTarget::new("curl -f http://localhost:8080/health", project.path())
            .with_cleanup_ports(vec![8080]);
        repair.run(&target);
        assert_eq!(
            runner.commands(),
            [
                "fuser -k 8080/tcp || true",
                "curl -f http://localhost:8080/health",
            ]
            .repeat(3)
        );
    }

    #[test]
    fn outcome_serializes_status_and_history() {
        let outcome = RepairOutcome {
            command: "make".to_string(),
            status: RepairStatus::Exhausted { max_iterations: 1 },
            history: History::new(),
        };
        let json = serde_json::to_value(&outcome).expect("serialize");
        assert_eq!(json["status"], "exhausted");
        assert_eq!(json["max_iterations"], 1);
        assert_eq!(json["history"], serde_json::json!([]));
    }
}
