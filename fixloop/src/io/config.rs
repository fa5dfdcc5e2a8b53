//! Repair configuration stored under `.fixloop/config.toml`.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::candidates::CandidateLimits;
use crate::core::history::MAX_HISTORY_WINDOW;
use crate::io::context::ContextLimits;
use crate::io::oracle::CommandOracle;
use crate::io::prompt::PromptLimits;

/// Directory under the project root that holds fixloop state.
pub const STATE_DIR: &str = ".fixloop";
/// Config file name inside [`STATE_DIR`].
pub const CONFIG_FILE: &str = "config.toml";

/// Default config location for a project root.
pub fn default_config_path(project_root: &Path) -> PathBuf {
    project_root.join(STATE_DIR).join(CONFIG_FILE)
}

/// Repair configuration (TOML).
///
/// Intended to be edited by humans. Missing fields take the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RepairConfig {
    /// Iterations per repair session before giving up.
    pub max_iterations: u32,

    /// Timeout for target, auxiliary and verification commands.
    pub command_timeout_secs: u64,

    /// Pause after applying a remediation, before the next run.
    pub settle_delay_ms: u64,

    /// Pause after killing processes on checklist ports.
    pub port_cleanup_delay_ms: u64,

    pub oracle: OracleConfig,
    pub context: ContextConfig,
    pub prompt: PromptConfig,
    pub update: UpdateConfig,

    /// Target commands for `fixloop checklist`, run in order.
    pub checklist: Vec<ChecklistItemConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OracleConfig {
    /// Agent command that reads the prompt on stdin and replies on stdout.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    /// Truncate oracle replies beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            command: ["codex", "exec", "--skip-git-repo-check", "-"]
                .map(String::from)
                .to_vec(),
            timeout_secs: 600,
            output_limit_bytes: 1_000_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ContextConfig {
    pub file_char_budget: usize,
    pub max_files: usize,
    pub max_directories: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        let limits = ContextLimits::default();
        Self {
            file_char_budget: limits.file_char_budget,
            max_files: limits.candidates.max_files,
            max_directories: limits.candidates.max_directories,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PromptConfig {
    pub transcript_char_budget: usize,
    pub history_window: usize,
}

impl Default for PromptConfig {
    fn default() -> Self {
        let limits = PromptLimits::default();
        Self {
            transcript_char_budget: limits.transcript_char_budget,
            history_window: limits.history_window,
        }
    }
}

/// Settings for `fixloop update`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UpdateConfig {
    /// Change sets proposed before giving up.
    pub max_iterations: u32,
    /// Command that decides whether the requirements are met.
    pub verification_command: String,
    /// Project files listed in each update request.
    pub max_tree_entries: usize,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            verification_command: "make test".to_string(),
            max_tree_entries: 500,
        }
    }
}

/// One named checklist item. It succeeds when every step's session succeeds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChecklistItemConfig {
    pub name: String,
    pub steps: Vec<ChecklistStep>,
    /// Ports freed with `fuser -k` before every run of each step.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cleanup_ports: Vec<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChecklistStep {
    pub command: String,
    /// Directory relative to the project root; defaults to the root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
}

impl ChecklistStep {
    fn new(command: &str, workdir: Option<&str>) -> Self {
        Self {
            command: command.to_string(),
            workdir: workdir.map(str::to_string),
        }
    }
}

impl ChecklistItemConfig {
    fn single(name: &str, command: &str) -> Self {
        Self {
            name: name.to_string(),
            steps: vec![ChecklistStep::new(command, None)],
            cleanup_ports: Vec::new(),
        }
    }
}

/// Full-stack validation list: Go backend, npm frontend, Tilt, a health check and tests.
pub fn default_checklist() -> Vec<ChecklistItemConfig> {
    vec![
        ChecklistItemConfig {
            name: "dependencies".to_string(),
            steps: vec![
                ChecklistStep::new("go mod tidy", Some("backend")),
                ChecklistStep::new("npm install", Some("frontend")),
            ],
            cleanup_ports: Vec::new(),
        },
        ChecklistItemConfig::single("backend_build", "cd backend && go build"),
        ChecklistItemConfig::single("frontend_build", "cd frontend && npm run build"),
        ChecklistItemConfig::single("tilt_setup", "tilt doctor"),
        ChecklistItemConfig {
            cleanup_ports: vec![8080],
            ..ChecklistItemConfig::single(
                "application_start",
                "timeout 10s bash -c 'cd backend && go run main.go &' && sleep 2 && curl -f http://localhost:8080/health",
            )
        },
        ChecklistItemConfig::single("tests", "make test"),
    ]
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            command_timeout_secs: 60,
            settle_delay_ms: 1000,
            port_cleanup_delay_ms: 2000,
            oracle: OracleConfig::default(),
            context: ContextConfig::default(),
            prompt: PromptConfig::default(),
            update: UpdateConfig::default(),
            checklist: default_checklist(),
        }
    }
}

impl RepairConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.command_timeout_secs == 0 {
            return Err(anyhow!("command_timeout_secs must be > 0"));
        }
        if self.oracle.command.is_empty() || self.oracle.command[0].trim().is_empty() {
            return Err(anyhow!("oracle.command must be a non-empty array"));
        }
        if self.oracle.timeout_secs == 0 {
            return Err(anyhow!("oracle.timeout_secs must be > 0"));
        }
        if self.oracle.output_limit_bytes == 0 {
            return Err(anyhow!("oracle.output_limit_bytes must be > 0"));
        }
        if self.context.file_char_budget == 0 {
            return Err(anyhow!("context.file_char_budget must be > 0"));
        }
        if self.prompt.transcript_char_budget == 0 {
            return Err(anyhow!("prompt.transcript_char_budget must be > 0"));
        }
        if !(1..=MAX_HISTORY_WINDOW).contains(&self.prompt.history_window) {
            return Err(anyhow!(
                "prompt.history_window must be between 1 and {MAX_HISTORY_WINDOW}"
            ));
        }

        if self.update.max_iterations == 0 {
            return Err(anyhow!("update.max_iterations must be > 0"));
        }
        if self.update.verification_command.trim().is_empty() {
            return Err(anyhow!("update.verification_command must be non-empty"));
        }
        if self.update.max_tree_entries == 0 {
            return Err(anyhow!("update.max_tree_entries must be > 0"));
        }

        let mut names = HashSet::new();
        for item in &self.checklist {
            if item.name.trim().is_empty() {
                return Err(anyhow!("checklist item names must be non-empty"));
            }
            if !names.insert(item.name.as_str()) {
                return Err(anyhow!("duplicate checklist item {}", item.name));
            }
            if item.steps.is_empty() {
                return Err(anyhow!("checklist item {} has no steps", item.name));
            }
            if item.steps.iter().any(|step| step.command.trim().is_empty()) {
                return Err(anyhow!("checklist item {} has an empty command", item.name));
            }
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn port_cleanup_delay(&self) -> Duration {
        Duration::from_millis(self.port_cleanup_delay_ms)
    }

    pub fn context_limits(&self) -> ContextLimits {
        ContextLimits {
            file_char_budget: self.context.file_char_budget,
            candidates: CandidateLimits {
                max_files: self.context.max_files,
                max_directories: self.context.max_directories,
            },
        }
    }

    pub fn prompt_limits(&self) -> PromptLimits {
        PromptLimits {
            transcript_char_budget: self.prompt.transcript_char_budget,
            history_window: self.prompt.history_window,
        }
    }

    pub fn command_oracle(&self) -> CommandOracle {
        CommandOracle {
            argv: self.oracle.command.clone(),
            timeout: Duration::from_secs(self.oracle.timeout_secs),
            output_limit_bytes: self.oracle.output_limit_bytes,
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RepairConfig::default()`.
pub fn load_config(path: &Path) -> Result<RepairConfig> {
    if !path.exists() {
        let cfg = RepairConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RepairConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RepairConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
