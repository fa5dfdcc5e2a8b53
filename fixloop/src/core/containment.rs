//! Lexical confinement of paths to a project root.

use std::path::{Component, Path, PathBuf};

/// Where a candidate path lands relative to the project root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Containment {
    /// Normalized absolute path that lies under the root.
    Inside(PathBuf),
    /// The path escapes the root (absolute elsewhere, or too many `..`).
    Outside,
}

/// Resolve `candidate` against `root` without touching the filesystem.
///
/// Relative candidates are joined onto `root`; absolute candidates are taken as-is.
/// `.` and `..` components are folded lexically, so `a/../../etc` escapes even when
/// `a` does not exist. `root` is expected to be absolute and already normalized.
pub fn resolve_within(root: &Path, candidate: &Path) -> Containment {
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root.join(candidate)
    };
    let Some(normalized) = normalize(&joined) else {
        return Containment::Outside;
    };
    if normalized.starts_with(root) {
        Containment::Inside(normalized)
    } else {
        Containment::Outside
    }
}

/// Fold `.`/`..` components. Returns `None` when `..` would climb above the filesystem root.
pub fn normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            Component::Normal(name) => out.push(name),
        }
    }
    Some(out)
}
