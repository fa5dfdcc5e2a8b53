//! Context extraction: turn a failure transcript into bounded file and directory blocks.
//!
//! Every filesystem access is confined to the project root. A path that resolves outside
//! of it (lexically, or through a symlink) renders as an "access restricted" marker and is
//! never read. Missing paths render as "not found" markers so the oracle can tell an absent
//! file from one that was skipped.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::core::candidates::{CandidateLimits, discover};
use crate::core::containment::{Containment, normalize, resolve_within};
use crate::io::config::STATE_DIR;

/// Directory names never descended into by [`project_tree`].
const SKIPPED_DIRS: &[&str] = &[".git", "node_modules", STATE_DIR];
/// File names left out of [`project_tree`].
const SKIPPED_FILES: &[&str] = &[".DS_Store"];

/// Bounds applied while building a [`ContextBundle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextLimits {
    /// Maximum characters of file content per block.
    pub file_char_budget: usize,
    pub candidates: CandidateLimits,
}

impl Default for ContextLimits {
    fn default() -> Self {
        Self {
            file_char_budget: 1000,
            candidates: CandidateLimits::default(),
        }
    }
}

/// Advisory text blocks for the diagnosis oracle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextBundle {
    blocks: Vec<String>,
}

impl ContextBundle {
    pub fn blocks(&self) -> &[String] {
        &self.blocks
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn render(&self) -> String {
        self.blocks.join("\n\n")
    }
}

/// Build the context bundle for one failed command.
pub fn extract(
    failure_text: &str,
    project_root: &Path,
    command_line: &str,
    limits: &ContextLimits,
) -> ContextBundle {
    let root = canonical_root(project_root);
    let candidates = discover(failure_text, command_line, limits.candidates);
    let subdir = candidates.command_subdir.as_deref();
    debug!(
        files = candidates.files.len(),
        directories = candidates.directories.len(),
        log_file = ?candidates.log_file,
        "extracting context"
    );

    let mut blocks = Vec::new();
    let mut seen = HashSet::new();
    for token in &candidates.files {
        if let Some(block) = file_block(&root, subdir, token, limits.file_char_budget, &mut seen)
        {
            blocks.push(block);
        }
    }
    if let Some(log) = &candidates.log_file {
        let display = match subdir {
            Some(dir) => format!("{}/{}", dir.trim_end_matches('/'), log),
            None => log.clone(),
        };
        if let Some(block) =
            file_block(&root, None, &display, limits.file_char_budget, &mut seen)
        {
            blocks.push(block);
        }
    }
    for dir in &candidates.directories {
        blocks.push(directory_block(&root, subdir, dir));
    }
    ContextBundle { blocks }
}

/// Render one file as a bounded block, or as a marker when it cannot be shown.
pub fn read_file_block(project_root: &Path, path: &str, char_budget: usize) -> String {
    let root = canonical_root(project_root);
    file_block(&root, None, path, char_budget, &mut HashSet::new()).unwrap_or_default()
}

/// Sorted `/`-separated paths of the files under the project root, one per line.
///
/// VCS metadata, `node_modules` and fixloop state are skipped, and symlinked directories
/// are listed without being followed. At most `max_entries` paths are shown; a final line
/// counts the rest.
pub fn project_tree(project_root: &Path, max_entries: usize) -> String {
    let root = canonical_root(project_root);
    let mut files = Vec::new();
    let mut pending = vec![PathBuf::new()];
    while let Some(relative) = pending.pop() {
        let entries = match fs::read_dir(root.join(&relative)) {
            Ok(entries) => entries,
            Err(err) => {
                debug!(dir = %relative.display(), err = %err, "skipping unreadable directory");
                continue;
            }
        };
        for entry in entries.filter_map(|entry| entry.ok()) {
            let name = entry.file_name().to_string_lossy().into_owned();
            let path = relative.join(&name);
            let is_dir = entry.file_type().is_ok_and(|kind| kind.is_dir());
            if is_dir {
                if !SKIPPED_DIRS.contains(&name.as_str()) {
                    pending.push(path);
                }
            } else if !SKIPPED_FILES.contains(&name.as_str()) {
                files.push(display_path(&path));
            }
        }
    }
    files.sort();

    let hidden = files.len().saturating_sub(max_entries);
    files.truncate(max_entries);
    let mut listing = files.join("\n");
    if hidden > 0 {
        listing.push_str(&format!("\n... ({hidden} more files not shown)"));
    }
    listing
}

fn display_path(path: &Path) -> String {
    path.components()
        .map(|part| part.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Render a directory listing, or a marker when it cannot be shown.
pub fn list_directory_block(project_root: &Path, path: &str) -> String {
    directory_block(&canonical_root(project_root), None, path)
}

enum Resolved {
    Found(PathBuf),
    Missing,
    Restricted,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Kind {
    File,
    Directory,
}

/// Returns `None` when the same file was already rendered.
fn file_block(
    root: &Path,
    subdir: Option<&str>,
    display: &str,
    char_budget: usize,
    seen: &mut HashSet<PathBuf>,
) -> Option<String> {
    match resolve(root, subdir, display, Kind::File) {
        Resolved::Restricted => Some(restricted_marker(display)),
        Resolved::Missing => Some(format!("--- {display}: not found ---")),
        Resolved::Found(path) => {
            if !seen.insert(path.clone()) {
                return None;
            }
            let block = match fs::read(&path) {
                Ok(bytes) => {
                    let text = String::from_utf8_lossy(&bytes);
                    format!(
                        "--- START OF {display} ---\n{}\n--- END OF {display} ---",
                        truncate_chars(&text, char_budget)
                    )
                }
                Err(err) => format!("--- {display}: unreadable ({err}) ---"),
            };
            Some(block)
        }
    }
}

fn directory_block(root: &Path, subdir: Option<&str>, display: &str) -> String {
    let path = match resolve(root, subdir, display, Kind::Directory) {
        Resolved::Restricted => return restricted_marker(display),
        Resolved::Missing => return format!("--- DIRECTORY {display}: not found ---"),
        Resolved::Found(path) => path,
    };
    let entries = match fs::read_dir(&path) {
        Ok(entries) => entries,
        Err(err) => return format!("--- DIRECTORY {display}: unreadable ({err}) ---"),
    };
    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().is_ok_and(|kind| kind.is_dir()) {
                format!("{name}/")
            } else {
                name
            }
        })
        .collect();
    names.sort();
    let listing = if names.is_empty() {
        "(empty)".to_string()
    } else {
        names.join("\n")
    };
    format!("--- DIRECTORY {display} ---\n{listing}\n--- END OF DIRECTORY {display} ---")
}

fn restricted_marker(display: &str) -> String {
    format!("--- {display}: access restricted (outside project root) ---")
}

/// Try the path relative to the root, then relative to the command's `cd` target.
fn resolve(root: &Path, subdir: Option<&str>, token: &str, kind: Kind) -> Resolved {
    let token_path = Path::new(token);
    let mut bases = vec![PathBuf::new()];
    if let Some(dir) = subdir
        && !token_path.is_absolute()
    {
        bases.push(PathBuf::from(dir));
    }

    // Restricted only when no base keeps the token inside the root.
    let mut escaped_every_base = true;
    for base in bases {
        let candidate = base.join(token_path);
        let lexical = match resolve_within(root, &candidate) {
            Containment::Inside(path) => path,
            Containment::Outside => continue,
        };
        escaped_every_base = false;
        let Ok(canonical) = fs::canonicalize(&lexical) else {
            continue;
        };
        if !canonical.starts_with(root) {
            return Resolved::Restricted;
        }
        let matches_kind = match kind {
            Kind::File => canonical.is_file(),
            Kind::Directory => canonical.is_dir(),
        };
        if matches_kind {
            return Resolved::Found(canonical);
        }
    }
    if escaped_every_base {
        Resolved::Restricted
    } else {
        Resolved::Missing
    }
}

/// Absolute, symlink-free form of the project root used for containment checks.
pub fn canonical_root(project_root: &Path) -> PathBuf {
    if let Ok(canonical) = fs::canonicalize(project_root) {
        return canonical;
    }
    let absolute = std::path::absolute(project_root).unwrap_or_else(|_| project_root.into());
    normalize(&absolute).unwrap_or(absolute)
}

fn truncate_chars(text: &str, budget: usize) -> String {
    match text.char_indices().nth(budget) {
        Some((cut, _)) => format!(
            "{}\n[... truncated {} chars]",
            &text[..cut],
            text[cut..].chars().count()
        ),
        None => text.to_string(),
    }
}
