//! Extraction of a structured remediation from free-form oracle replies.
//!
//! Replies often wrap the JSON payload in prose or code fences. Parsing runs two stages,
//! each yielding an optional payload: the first fenced block holding a JSON object, then
//! the slice between the first `{` and the last `}`. Every payload is checked against the
//! wire schema before it is deserialized.

use std::sync::LazyLock;

use jsonschema::{Draft, Validator};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use crate::core::types::{FileWrite, Remediation, SolutionType};

const REMEDIATION_SCHEMA: &str = include_str!("../../schemas/remediation.schema.json");

static FENCED_BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```[A-Za-z0-9_-]*[ \t]*\r?\n(.*?)```").expect("fenced block regex")
});

static SCHEMA: LazyLock<Validator> = LazyLock::new(|| {
    let schema: Value =
        serde_json::from_str(REMEDIATION_SCHEMA).expect("remediation schema should be json");
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .expect("remediation schema should compile")
});

/// Wire shape of the oracle payload. Every field is optional; gaps are filled in
/// [`WireRemediation::into_remediation`].
#[derive(Debug, Deserialize)]
struct WireRemediation {
    #[serde(default)]
    root_cause: Option<String>,
    /// Feature-update replies describe their change as a plan instead of a cause.
    #[serde(default)]
    plan: Option<String>,
    #[serde(default)]
    solution_type: Option<String>,
    #[serde(default)]
    files_to_create: Vec<FileWrite>,
    #[serde(default)]
    files_to_update: Vec<FileWrite>,
    #[serde(default)]
    commands_to_run: Vec<String>,
    #[serde(default)]
    verification_command: Option<String>,
}

impl WireRemediation {
    fn into_remediation(self) -> Remediation {
        let solution_type = self
            .solution_type
            .as_deref()
            .and_then(SolutionType::from_wire)
            .unwrap_or_else(|| {
                infer_solution_type(
                    &self.files_to_create,
                    &self.files_to_update,
                    &self.commands_to_run,
                )
            });
        Remediation {
            root_cause: [self.root_cause, self.plan]
                .into_iter()
                .flatten()
                .map(|cause| cause.trim().to_string())
                .find(|cause| !cause.is_empty())
                .unwrap_or_else(|| "Unknown".to_string()),
            solution_type,
            files_to_create: self.files_to_create,
            files_to_update: self.files_to_update,
            commands_to_run: self
                .commands_to_run
                .into_iter()
                .filter(|command| !command.trim().is_empty())
                .collect(),
            verification_command: self
                .verification_command
                .filter(|command| !command.trim().is_empty()),
        }
    }
}

fn infer_solution_type(
    creates: &[FileWrite],
    updates: &[FileWrite],
    commands: &[String],
) -> SolutionType {
    if !creates.is_empty() {
        SolutionType::FileCreate
    } else if !updates.is_empty() {
        SolutionType::FileUpdate
    } else if !commands.is_empty() {
        SolutionType::CommandRun
    } else {
        SolutionType::Manual
    }
}

/// Run both extraction stages. The error names why the last candidate was rejected.
pub fn parse_remediation(reply: &str) -> Result<Remediation, String> {
    let mut last_error = "no JSON object found in reply".to_string();
    for payload in [fenced_block(reply), brace_slice(reply)].into_iter().flatten() {
        match parse_payload(payload) {
            Ok(remediation) => return Ok(remediation),
            Err(err) => last_error = err,
        }
    }
    Err(last_error)
}

/// Body of the first fenced code block that holds a JSON object.
pub fn fenced_block(reply: &str) -> Option<&str> {
    FENCED_BLOCK_RE
        .captures_iter(reply)
        .filter_map(|caps| caps.get(1))
        .map(|body| body.as_str().trim())
        .find(|body| body.starts_with('{'))
}

/// Text from the first `{` through the last `}`.
pub fn brace_slice(reply: &str) -> Option<&str> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    (end > start).then(|| &reply[start..=end])
}

/// Validate and convert one JSON payload.
pub fn parse_payload(payload: &str) -> Result<Remediation, String> {
    let value: Value =
        serde_json::from_str(payload).map_err(|err| format!("invalid JSON: {err}"))?;
    let violations: Vec<String> = SCHEMA
        .iter_errors(&value)
        .map(|err| err.to_string())
        .collect();
    if !violations.is_empty() {
        return Err(format!("schema violations: {}", violations.join("; ")));
    }
    let wire: WireRemediation =
        serde_json::from_value(value).map_err(|err| format!("unexpected shape: {err}"))?;
    Ok(wire.into_remediation())
}
