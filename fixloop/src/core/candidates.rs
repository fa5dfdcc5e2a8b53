//! Heuristic discovery of paths worth showing to the diagnosis oracle.
//!
//! This is a best-effort scan, not a parser. It tolerates false positives (a version
//! string that happens to end in `.json`) and false negatives (source files with an
//! extension outside [`RECOGNIZED_EXTENSIONS`]). Output order is first-seen order, so the
//! same transcript always yields the same candidates.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

/// Extensions whose files are read into the context bundle.
pub const RECOGNIZED_EXTENSIONS: &[&str] = &[
    "go", "mod", "sum", "js", "jsx", "ts", "tsx", "mjs", "cjs", "json", "py", "rs", "toml",
    "yaml", "yml", "html", "css", "scss", "sh", "sql", "md", "txt", "cfg", "ini", "conf",
    "log", "lock",
];

/// Extensionless file names that are always interesting.
pub const RECOGNIZED_FILE_NAMES: &[&str] =
    &["Makefile", "Dockerfile", "Tiltfile", "Procfile", ".env"];

static PATH_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\w./-]+").expect("path token regex"));
static LOG_REDIRECT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r">>?\s*([\w./-]+\.log)\b").expect("log redirect regex"));
static CD_PREFIX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:^|[\s'"(;&])cd\s+([^\s&;|'"]+)\s*&&"#).expect("cd prefix regex")
});
static DIRECTORY_PHRASE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"directory\s+['"]([^'"\n]+)['"]"#).expect("directory phrase regex")
});
static QUOTED_DIR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"['"]([^'"\s]+/)['"]"#).expect("quoted dir regex"));

/// Caps applied to candidate discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandidateLimits {
    pub max_files: usize,
    pub max_directories: usize,
}

impl Default for CandidateLimits {
    fn default() -> Self {
        Self {
            max_files: 10,
            max_directories: 5,
        }
    }
}

/// Paths discovered from one failure transcript and its command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Candidates {
    /// File paths as written in the transcript.
    pub files: Vec<String>,
    /// Log file the command redirected its output to.
    pub log_file: Option<String>,
    /// Directory the command changed into before running (`cd <dir> && ...`).
    pub command_subdir: Option<String>,
    /// Directories mentioned in the transcript.
    pub directories: Vec<String>,
}

pub fn discover(failure_text: &str, command_line: &str, limits: CandidateLimits) -> Candidates {
    Candidates {
        files: file_candidates(failure_text, limits.max_files),
        log_file: log_redirect_target(command_line),
        command_subdir: command_subdir(command_line),
        directories: directory_candidates(failure_text, limits.max_directories),
    }
}

/// Path-like tokens that name a recognized file, plus explicit `./` and `../` paths.
pub fn file_candidates(text: &str, max: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for token in PATH_TOKEN_RE.find_iter(text) {
        if out.len() >= max {
            break;
        }
        let token = token.as_str().trim_end_matches('.');
        if token.is_empty() || token.contains("//") {
            continue;
        }
        if (is_recognized_file(token) || is_explicit_relative(token))
            && seen.insert(token.to_string())
        {
            out.push(token.to_string());
        }
    }
    out
}

/// Directories named by `directory '<path>'` phrases or quoted paths ending in `/`.
pub fn directory_candidates(text: &str, max: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    let phrases = DIRECTORY_PHRASE_RE.captures_iter(text);
    let quoted = QUOTED_DIR_RE.captures_iter(text);
    for caps in phrases.chain(quoted) {
        if out.len() >= max {
            break;
        }
        let raw = caps[1].trim();
        if raw.is_empty() {
            continue;
        }
        if seen.insert(raw.trim_end_matches('/').to_string()) {
            out.push(raw.to_string());
        }
    }
    out
}

/// `server.log` in `go run main.go > server.log 2>&1`.
pub fn log_redirect_target(command_line: &str) -> Option<String> {
    LOG_REDIRECT_RE
        .captures(command_line)
        .map(|caps| caps[1].to_string())
}

/// `backend` in `cd backend && go build`.
pub fn command_subdir(command_line: &str) -> Option<String> {
    CD_PREFIX_RE
        .captures(command_line)
        .map(|caps| caps[1].to_string())
}

fn is_recognized_file(token: &str) -> bool {
    let name = token.rsplit('/').next().unwrap_or(token);
    if RECOGNIZED_FILE_NAMES.contains(&name) {
        return true;
    }
    match name.rsplit_once('.') {
        Some((stem, ext)) => !stem.is_empty() && RECOGNIZED_EXTENSIONS.contains(&ext),
        None => false,
    }
}

fn is_explicit_relative(token: &str) -> bool {
    let rest = token
        .strip_prefix("./")
        .or_else(|| token.strip_prefix("../"));
    matches!(rest, Some(rest) if rest.chars().any(|c| c.is_alphanumeric()))
}
