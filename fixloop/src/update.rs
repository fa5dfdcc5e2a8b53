//! Requirements-driven update loop for `fixloop update`.
//!
//! Where a repair session starts from a failing command, an update session starts from a
//! requirements document. Each iteration asks the oracle for a change set, applies it,
//! and runs the verification command; a failed verification is fed into the next
//! request. The session ends when verification passes, when the oracle proposes nothing
//! to apply, when a change set cannot be written, or when iterations run out.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, info_span, warn};

use crate::core::history::History;
use crate::core::types::{CommandResult, HistoryEntry};
use crate::io::applier::RemediationApplier;
use crate::io::config::RepairConfig;
use crate::io::context::project_tree;
use crate::io::iteration_log::{IterationWriteRequest, write_iteration};
use crate::io::oracle::{DiagnosisOracle, UpdateRequest, plan_update};
use crate::io::process::CommandRunner;
use crate::io::prompt::{PromptBuilder, PromptLimits};

/// History text for an iteration that had no verification run before it.
const NOT_VERIFIED: &str = "Not verified yet";

#[derive(Debug, Clone)]
pub struct UpdateSettings {
    pub max_iterations: u32,
    /// Timeout for auxiliary and verification commands.
    pub command_timeout: Duration,
    /// Pause after a failed verification, before the next request.
    pub settle_delay: Duration,
    pub max_tree_entries: usize,
    pub prompt: PromptLimits,
    pub log_dir: Option<PathBuf>,
}

impl UpdateSettings {
    pub fn from_config(cfg: &RepairConfig) -> Self {
        Self {
            max_iterations: cfg.update.max_iterations,
            command_timeout: cfg.command_timeout(),
            settle_delay: cfg.settle_delay(),
            max_tree_entries: cfg.update.max_tree_entries,
            prompt: cfg.prompt_limits(),
            log_dir: None,
        }
    }
}

impl Default for UpdateSettings {
    fn default() -> Self {
        Self::from_config(&RepairConfig::default())
    }
}

/// Requirements to implement and the command that proves them.
#[derive(Debug, Clone)]
pub struct UpdateTarget {
    pub requirements: String,
    pub verification_command: String,
    pub project_root: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UpdateStatus {
    /// The verification command passed after this iteration's changes.
    Verified { iteration: u32 },
    /// The oracle proposed nothing applicable.
    NoChanges { iteration: u32 },
    /// A file write of this iteration's change set was refused or failed.
    ApplyFailed { iteration: u32 },
    Exhausted { max_iterations: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateOutcome {
    pub verification_command: String,
    #[serde(flatten)]
    pub status: UpdateStatus,
    pub history: History,
}

impl UpdateOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self.status, UpdateStatus::Verified { .. })
    }
}

pub struct UpdateLoop<'a, R: CommandRunner, O: DiagnosisOracle> {
    runner: &'a R,
    oracle: &'a O,
    prompts: PromptBuilder,
    settings: UpdateSettings,
}

impl<'a, R: CommandRunner, O: DiagnosisOracle> UpdateLoop<'a, R, O> {
    pub fn new(runner: &'a R, oracle: &'a O, settings: UpdateSettings) -> Self {
        Self {
            runner,
            oracle,
            prompts: PromptBuilder::new(settings.prompt),
            settings,
        }
    }

    pub fn run(&self, target: &UpdateTarget) -> UpdateOutcome {
        let max_iterations = self.settings.max_iterations;
        let root = target.project_root.as_path();
        let verification = target.verification_command.as_str();
        let applier = RemediationApplier::new(self.runner, self.settings.command_timeout);
        let mut history = History::new();
        let mut last_failure: Option<CommandResult> = None;

        for iteration in 1..=max_iterations {
            let _span = info_span!("update_iteration", iteration, max_iterations).entered();
            let tree = project_tree(root, self.settings.max_tree_entries);
            let trailing = history.render_trailing(self.settings.prompt.history_window);
            let test_error = last_failure.as_ref().map(verification_error);
            let remediation = plan_update(
                self.oracle,
                &self.prompts,
                &UpdateRequest {
                    requirements: &target.requirements,
                    project_tree: &tree,
                    history: trailing.as_deref(),
                    verification_command: verification,
                    test_error: test_error.as_deref(),
                },
            );

            let snippet = last_failure
                .as_ref()
                .map(CommandResult::error_snippet)
                .unwrap_or_else(|| NOT_VERIFIED.to_string());
            let entry = history.record(verification, snippet, remediation);

            let stop = if entry.remediation.is_degraded() || entry.remediation.is_empty() {
                warn!(
                    solution_type = ?entry.remediation.solution_type,
                    plan = %entry.remediation.root_cause,
                    "no applicable changes proposed, ending session"
                );
                Some((UpdateStatus::NoChanges { iteration }, None, None))
            } else if !applier.apply(&entry.remediation, root) {
                warn!("change set could not be written, aborting");
                Some((UpdateStatus::ApplyFailed { iteration }, Some(false), None))
            } else {
                info!(command = %verification, "verifying changes");
                let check = self
                    .runner
                    .run(verification, root, self.settings.command_timeout);
                if check.succeeded {
                    info!("verification passed");
                    Some((UpdateStatus::Verified { iteration }, Some(true), Some(check)))
                } else {
                    warn!(exit_code = check.exit_code, "verification failed");
                    write_log(self.settings.log_dir.as_deref(), entry, Some(&check), Some(true));
                    last_failure = Some(check);
                    None
                }
            };

            if let Some((status, applied, check)) = stop {
                write_log(self.settings.log_dir.as_deref(), entry, check.as_ref(), applied);
                return UpdateOutcome {
                    verification_command: verification.to_string(),
                    status,
                    history,
                };
            }

            if iteration < max_iterations && !self.settings.settle_delay.is_zero() {
                thread::sleep(self.settings.settle_delay);
            }
        }

        warn!(max_iterations, "update attempts exhausted");
        UpdateOutcome {
            verification_command: verification.to_string(),
            status: UpdateStatus::Exhausted { max_iterations },
            history,
        }
    }
}

/// stderr, then stdout, of a failed verification.
fn verification_error(result: &CommandResult) -> String {
    format!("{}\n{}", result.stderr.trim_end(), result.stdout.trim_end())
        .trim()
        .to_string()
}

fn write_log(
    log_dir: Option<&Path>,
    entry: &HistoryEntry,
    result: Option<&CommandResult>,
    applied: Option<bool>,
) {
    let Some(dir) = log_dir else {
        return;
    };
    let request = IterationWriteRequest {
        log_dir: dir,
        entry,
        result,
        applied,
        recorded_at: Utc::now(),
    };
    if let Err(err) = write_iteration(&request) {
        warn!(err = %format!("{err:#}"), "failed to write iteration log");
    }
}
