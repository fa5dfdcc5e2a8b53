//! Prompt rendering for diagnosis and feature-update requests.

use anyhow::Result;
use minijinja::{Environment, context};
use tracing::debug;

use crate::core::history::MAX_HISTORY_WINDOW;
use crate::io::oracle::{DiagnosisRequest, UpdateRequest};

const DIAGNOSE_TEMPLATE: &str = include_str!("../prompts/diagnose.md");
const UPDATE_TEMPLATE: &str = include_str!("../prompts/update.md");

/// Limits that keep the oracle request bounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptLimits {
    /// Leading characters of stdout/stderr (or of a verification error) included in the
    /// request.
    pub transcript_char_budget: usize,
    /// Number of trailing history entries included in the request.
    pub history_window: usize,
}

impl Default for PromptLimits {
    fn default() -> Self {
        Self {
            transcript_char_budget: 1000,
            history_window: MAX_HISTORY_WINDOW,
        }
    }
}

/// Template engine wrapper around minijinja.
pub struct PromptBuilder {
    env: Environment<'static>,
    limits: PromptLimits,
}

impl PromptBuilder {
    pub fn new(limits: PromptLimits) -> Self {
        let mut env = Environment::new();
        env.add_template("diagnose", DIAGNOSE_TEMPLATE)
            .expect("diagnose template should be valid");
        env.add_template("update", UPDATE_TEMPLATE)
            .expect("update template should be valid");
        Self { env, limits }
    }

    pub fn limits(&self) -> PromptLimits {
        self.limits
    }

    /// Render the request. `retry_reason` adds the correction section used for the
    /// single retry after an unparseable reply.
    pub fn render(&self, request: &DiagnosisRequest<'_>, retry_reason: Option<&str>) -> Result<String> {
        let result = request.result;
        let budget = self.limits.transcript_char_budget;
        let template = self.env.get_template("diagnose")?;
        let rendered = template.render(context! {
            command => request.command,
            workdir => result.working_directory.display().to_string(),
            exit_code => result.exit_code,
            stdout => head_or(&result.stdout, budget, "No output"),
            stderr => head_or(&result.stderr, budget, "No errors"),
            context => non_blank_or(request.additional_context, "None"),
            history => request.history.map(str::trim).filter(|s| !s.is_empty()),
            history_window => self.limits.history_window,
            retry_reason => retry_reason,
        })?;
        debug!(bytes = rendered.len(), retry = retry_reason.is_some(), "rendered diagnosis prompt");
        Ok(rendered)
    }

    /// Render a feature-update request, with the same retry section as [`Self::render`].
    pub fn render_update(
        &self,
        request: &UpdateRequest<'_>,
        retry_reason: Option<&str>,
    ) -> Result<String> {
        let template = self.env.get_template("update")?;
        let rendered = template.render(context! {
            requirements => request.requirements.trim(),
            project_tree => non_blank_or(request.project_tree, "(no files)"),
            history => request.history.map(str::trim).filter(|s| !s.is_empty()),
            history_window => self.limits.history_window,
            verification_command => request.verification_command,
            test_error => request
                .test_error
                .map(|text| head_or(text, self.limits.transcript_char_budget, "No output")),
            retry_reason => retry_reason,
        })?;
        debug!(bytes = rendered.len(), retry = retry_reason.is_some(), "rendered update prompt");
        Ok(rendered)
    }
}

/// First `budget` characters of `text`, keeping the start where errors usually begin.
fn head_or(text: &str, budget: usize, fallback: &str) -> String {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return fallback.to_string();
    }
    trimmed.chars().take(budget).collect()
}

fn non_blank_or<'a>(text: &'a str, fallback: &'a str) -> &'a str {
    let trimmed = text.trim();
    if trimmed.is_empty() { fallback } else { trimmed }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::CommandResult;
    use std::path::PathBuf;

    fn failed(stdout: &str, stderr: &str) -> CommandResult {
        CommandResult {
            command: "make test".to_string(),
            working_directory: PathBuf::from("/work/app"),
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            exit_code: 2,
            succeeded: false,
        }
    }

    #[test]
    fn renders_command_transcript_and_history() {
        let result = failed("", "main.go:3: undefined: Foo");
        let request = DiagnosisRequest {
            command: "make test",
            result: &result,
            additional_context: "iteration 2/10",
            history: Some("[{\"iteration\": 1}]"),
        };
        let prompt = PromptBuilder::new(PromptLimits::default())
            .render(&request, None)
            .expect("render");

        assert!(prompt.contains("Command executed: make test"));
        assert!(prompt.contains("Working directory: /work/app"));
        assert!(prompt.contains("Exit code: 2"));
        assert!(prompt.contains("No output"));
        assert!(prompt.contains("main.go:3: undefined: Foo"));
        assert!(prompt.contains("iteration 2/10"));
        assert!(prompt.contains("[{\"iteration\": 1}]"));
        assert!(prompt.contains("Do not repeat a fix"));
        assert!(!prompt.contains("## Correction"));
    }

    #[test]
    fn truncates_transcripts_to_budget() {
        let result = failed(&"o".repeat(50), &"e".repeat(50));
        let request = DiagnosisRequest {
            command: "make",
            result: &result,
            additional_context: "",
            history: None,
        };
        let limits = PromptLimits {
            transcript_char_budget: 10,
            history_window: 2,
        };
        let prompt = PromptBuilder::new(limits)
            .render(&request, None)
            .expect("render");

        assert!(prompt.contains(&format!("{}\n", "o".repeat(10))));
        assert!(!prompt.contains(&"o".repeat(11)));
        assert!(!prompt.contains(&"e".repeat(11)));
        assert!(prompt.contains("## Previous attempts (most recent 2)\n\nNone"));
    }

    #[test]
    fn retry_adds_correction_section() {
        let result = failed("", "boom");
        let request = DiagnosisRequest {
            command: "make",
            result: &result,
            additional_context: "",
            history: None,
        };
        let prompt = PromptBuilder::new(PromptLimits::default())
            .render(&request, Some("no JSON object found in reply"))
            .expect("render");

        assert!(prompt.contains("## Correction"));
        assert!(prompt.contains("could not be used (no JSON object found in reply)"));
    }

    fn update_request<'a>(test_error: Option<&'a str>) -> UpdateRequest<'a> {
        UpdateRequest {
            requirements: "Add a GET /version endpoint returning the build tag.\n",
            project_tree: "Makefile\nbackend/\nbackend/main.go",
            history: None,
            verification_command: "make test",
            test_error,
        }
    }

    #[test]
    fn renders_requirements_and_project_files() {
        let prompt = PromptBuilder::new(PromptLimits::default())
            .render_update(&update_request(None), None)
            .expect("render");

        assert!(prompt.contains("## Requirements\n\nAdd a GET /version endpoint"));
        assert!(prompt.contains("backend/main.go"));
        assert!(prompt.contains("`make test`"));
        assert!(prompt.contains("## Previous attempts (most recent 2)\n\nNone"));
        assert!(prompt.contains("\"plan\""));
        assert!(!prompt.contains("## Verification failed"));
        assert!(!prompt.contains("## Correction"));
    }

    #[test]
    fn failed_verification_is_shown_within_budget() {
        let error = format!("--- FAIL: TestVersion\n{}", "x".repeat(50));
        let limits = PromptLimits {
            transcript_char_budget: 30,
            history_window: 1,
        };
        let prompt = PromptBuilder::new(limits)
            .render_update(&update_request(Some(&error)), Some("invalid JSON"))
            .expect("render");

        assert!(prompt.contains("## Verification failed"));
        assert!(prompt.contains("--- FAIL: TestVersion"));
        assert!(!prompt.contains(&"x".repeat(20)));
        assert!(prompt.contains("could not be used (invalid JSON)"));
    }
}
