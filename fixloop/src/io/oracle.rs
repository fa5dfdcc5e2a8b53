//! Diagnosis oracle abstraction.
//!
//! The [`DiagnosisOracle`] trait decouples the repair loop from the reasoning backend
//! (by default an agent CLI such as `codex exec`). The oracle sees one prompt and returns
//! raw text; [`diagnose`] and [`plan_update`] own prompt rendering, payload extraction
//! and the single retry.

use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::remediation_parse::parse_remediation;
use crate::core::types::{CommandResult, Remediation, SolutionType};
use crate::io::process::run_command_with_timeout;
use crate::io::prompt::PromptBuilder;

/// Total oracle exchanges per diagnosis: the first request plus one retry.
pub const MAX_ORACLE_ATTEMPTS: usize = 2;

/// Everything the oracle is told about one failure.
#[derive(Debug, Clone, Copy)]
pub struct DiagnosisRequest<'a> {
    pub command: &'a str,
    pub result: &'a CommandResult,
    /// Iteration banner and context bundle.
    pub additional_context: &'a str,
    /// JSON of the trailing history entries, if any.
    pub history: Option<&'a str>,
}

/// Everything the oracle is told when asked to implement new requirements.
#[derive(Debug, Clone, Copy)]
pub struct UpdateRequest<'a> {
    pub requirements: &'a str,
    /// Sorted listing of the project files.
    pub project_tree: &'a str,
    /// JSON of the trailing history entries, if any.
    pub history: Option<&'a str>,
    pub verification_command: &'a str,
    /// stderr and stdout of the last failed verification.
    pub test_error: Option<&'a str>,
}

/// Abstraction over diagnosis backends.
pub trait DiagnosisOracle {
    /// Send one prompt and return the raw reply text.
    fn complete(&self, prompt: &str) -> Result<String>;
}

impl<F> DiagnosisOracle for F
where
    F: Fn(&str) -> Result<String>,
{
    fn complete(&self, prompt: &str) -> Result<String> {
        self(prompt)
    }
}

/// Oracle that pipes the prompt to an external agent CLI and reads its stdout.
#[derive(Debug, Clone)]
pub struct CommandOracle {
    /// Program and arguments, e.g. `["codex", "exec", "-"]`.
    pub argv: Vec<String>,
    pub timeout: Duration,
    /// Bytes of reply kept in memory.
    pub output_limit_bytes: usize,
}

impl DiagnosisOracle for CommandOracle {
    #[instrument(skip_all, fields(program = ?self.argv.first(), timeout_secs = self.timeout.as_secs()))]
    fn complete(&self, prompt: &str) -> Result<String> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| anyhow!("oracle command is empty"))?;
        info!("querying diagnosis oracle");
        let mut cmd = Command::new(program);
        cmd.args(args);

        let output = run_command_with_timeout(
            cmd,
            Some(prompt.as_bytes()),
            self.timeout,
            self.output_limit_bytes,
        )
        .with_context(|| format!("run oracle command {program}"))?;

        if output.timed_out {
            return Err(anyhow!("oracle timed out after {:?}", self.timeout));
        }
        if !output.status.success() {
            let stderr = output.stderr_lossy();
            return Err(anyhow!(
                "oracle failed with status {:?}: {}",
                output.status.code(),
                stderr.trim()
            ));
        }
        debug!(bytes = output.stdout.len(), "oracle replied");
        Ok(output.stdout_lossy())
    }
}

/// Ask the oracle for a remediation, retrying once with a correction notice.
///
/// Never fails: an unusable reply after both attempts degrades to a `Manual` remediation,
/// and an oracle or rendering error degrades to an `Error` remediation. Degraded
/// remediations carry nothing to apply.
#[instrument(skip_all, fields(command = %request.command))]
pub fn diagnose<O: DiagnosisOracle>(
    oracle: &O,
    prompts: &PromptBuilder,
    request: &DiagnosisRequest<'_>,
) -> Remediation {
    consult(oracle, |retry_reason| prompts.render(request, retry_reason))
}

/// Ask the oracle for the next set of changes toward the requirements.
///
/// Same attempts and degraded fallbacks as [`diagnose`].
#[instrument(skip_all, fields(verification = %request.verification_command))]
pub fn plan_update<O: DiagnosisOracle>(
    oracle: &O,
    prompts: &PromptBuilder,
    request: &UpdateRequest<'_>,
) -> Remediation {
    consult(oracle, |retry_reason| {
        prompts.render_update(request, retry_reason)
    })
}

/// Bounded request/parse exchange shared by every oracle conversation.
fn consult<O, F>(oracle: &O, mut render: F) -> Remediation
where
    O: DiagnosisOracle,
    F: FnMut(Option<&str>) -> Result<String>,
{
    let mut retry_reason: Option<String> = None;
    for attempt in 1..=MAX_ORACLE_ATTEMPTS {
        let prompt = match render(retry_reason.as_deref()) {
            Ok(prompt) => prompt,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "failed to render oracle prompt");
                return Remediation::degraded(
                    SolutionType::Error,
                    format!("Oracle prompt could not be rendered: {err:#}"),
                );
            }
        };
        let reply = match oracle.complete(&prompt) {
            Ok(reply) => reply,
            Err(err) => {
                warn!(attempt, err = %format!("{err:#}"), "oracle call failed");
                return Remediation::degraded(
                    SolutionType::Error,
                    format!("Oracle call failed: {err:#}"),
                );
            }
        };
        match parse_remediation(&reply) {
            Ok(remediation) => {
                debug!(attempt, solution_type = ?remediation.solution_type, "parsed remediation");
                return remediation;
            }
            Err(reason) => {
                warn!(attempt, reason = %reason, "oracle reply could not be parsed");
                retry_reason = Some(reason);
            }
        }
    }
    Remediation::degraded(
        SolutionType::Manual,
        format!(
            "Failed to parse oracle response: {}",
            retry_reason.unwrap_or_default()
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::prompt::PromptLimits;
    use crate::test_support::{ScriptedOracle, ScriptedReply, empty_remediation, remediation_json};
    use std::path::PathBuf;

    fn failed() -> CommandResult {
        CommandResult {
            command: "go build".to_string(),
            working_directory: PathBuf::from("/work"),
            stdout: String::new(),
            stderr: "main.go:1: syntax error".to_string(),
            exit_code: 1,
            succeeded: false,
        }
    }

    fn request(result: &CommandResult) -> DiagnosisRequest<'_> {
        DiagnosisRequest {
            command: "go build",
            result,
            additional_context: "",
            history: None,
        }
    }

    #[test]
    fn returns_parsed_remediation_on_first_reply() {
        let result = failed();
        let oracle = ScriptedOracle::always(&empty_remediation("typo"));
        let prompts = PromptBuilder::new(PromptLimits::default());

        let remediation = diagnose(&oracle, &prompts, &request(&result));
        assert_eq!(remediation, empty_remediation("typo"));
        assert_eq!(oracle.calls(), 1);
    }

    #[test]
    fn retries_once_after_unparseable_reply() {
        let result = failed();
        let oracle = ScriptedOracle::new(
            vec![ScriptedReply::Text("let me think...".to_string())],
            ScriptedReply::Text(remediation_json(&empty_remediation("second try"))),
        );
        let prompts = PromptBuilder::new(PromptLimits::default());

        let remediation = diagnose(&oracle, &prompts, &request(&result));
        assert_eq!(remediation.root_cause, "second try");
        let sent = oracle.prompts();
        assert_eq!(sent.len(), 2);
        assert!(!sent[0].contains("## Correction"));
        assert!(sent[1].contains("## Correction"));
    }

    #[test]
    fn degrades_to_manual_after_two_unparseable_replies() {
        let result = failed();
        let oracle = ScriptedOracle::unparseable();
        let prompts = PromptBuilder::new(PromptLimits::default());

        let remediation = diagnose(&oracle, &prompts, &request(&result));
        assert_eq!(remediation.solution_type, SolutionType::Manual);
        assert!(remediation.is_empty());
        assert!(remediation.root_cause.starts_with("Failed to parse oracle response"));
        assert_eq!(oracle.calls(), MAX_ORACLE_ATTEMPTS);
    }

    #[test]
    fn degrades_to_error_when_oracle_fails() {
        let result = failed();
        let oracle = ScriptedOracle::new(Vec::new(), ScriptedReply::Fail("rate limited".to_string()));
        let prompts = PromptBuilder::new(PromptLimits::default());

        let remediation = diagnose(&oracle, &prompts, &request(&result));
        assert_eq!(remediation.solution_type, SolutionType::Error);
        assert!(remediation.root_cause.contains("rate limited"));
        assert_eq!(oracle.calls(), 1);
    }

    #[test]
    fn update_plans_share_the_retry() {
        let oracle = ScriptedOracle::new(
            vec![ScriptedReply::Text("Sure, here is my plan.".to_string())],
            ScriptedReply::Text(
                r#"{"plan": "add the endpoint", "files_to_create": [{"path": "api.go", "content": "package main\n"}]}"#
                    .to_string(),
            ),
        );
        let prompts = PromptBuilder::new(PromptLimits::default());
        let request = UpdateRequest {
            requirements: "Expose GET /version.",
            project_tree: "main.go",
            history: None,
            verification_command: "make test",
            test_error: None,
        };

        let remediation = plan_update(&oracle, &prompts, &request);
        assert_eq!(remediation.root_cause, "add the endpoint");
        assert_eq!(remediation.solution_type, SolutionType::FileCreate);
        let sent = oracle.prompts();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].contains("Expose GET /version."));
        assert!(sent[1].contains("## Correction"));
    }

    #[test]
    fn closures_act_as_oracles() {
        let result = failed();
        let oracle = |_prompt: &str| -> Result<String> {
            Ok(r#"{"root_cause": "from closure"}"#.to_string())
        };
        let prompts = PromptBuilder::new(PromptLimits::default());

        let remediation = diagnose(&oracle, &prompts, &request(&result));
        assert_eq!(remediation.root_cause, "from closure");
    }

    #[cfg(unix)]
    #[test]
    fn command_oracle_reads_stdout_of_agent_process() {
        let oracle = CommandOracle {
            argv: vec![
                "sh".to_string(),
                "-c".to_string(),
                r#"cat >/dev/null; echo '{"root_cause": "from process"}'"#.to_string(),
            ],
            timeout: Duration::from_secs(5),
            output_limit_bytes: 10_000,
        };
        let reply = oracle.complete("prompt").expect("reply");
        assert!(reply.contains("from process"));
    }

    #[cfg(unix)]
    #[test]
    fn command_oracle_reports_nonzero_exit() {
        let oracle = CommandOracle {
            argv: vec!["sh".to_string(), "-c".to_string(), "echo nope >&2; exit 7".to_string()],
            timeout: Duration::from_secs(5),
            output_limit_bytes: 10_000,
        };
        let err = oracle.complete("prompt").unwrap_err();
        assert!(err.to_string().contains("nope"), "{err}");
    }

    #[cfg(unix)]
    #[test]
    fn command_oracle_times_out_when_agent_ignores_large_prompt() {
        let oracle = CommandOracle {
            argv: vec!["sleep".to_string(), "8".to_string()],
            timeout: Duration::from_secs(1),
            output_limit_bytes: 10_000,
        };
        let prompt = "x".repeat(256 * 1024);
        let started = std::time::Instant::now();
        let err = oracle.complete(&prompt).unwrap_err();
        assert!(err.to_string().contains("timed out"), "{err}");
        assert!(started.elapsed() < Duration::from_secs(6));
    }
}
