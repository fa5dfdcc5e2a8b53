//! Best-effort application of a remediation to the project tree.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{info, instrument, warn};

use crate::core::containment::{Containment, resolve_within};
use crate::core::types::{FileWrite, Remediation};
use crate::io::context::canonical_root;
use crate::io::process::CommandRunner;

/// Applies file writes and auxiliary commands.
///
/// Creates are written before updates, each list in the order given. A failed write is
/// logged and makes [`RemediationApplier::apply`] return `false`, but later writes still
/// run. Auxiliary commands run afterwards in the project root; their failures are logged
/// and never affect the result. Nothing is rolled back.
pub struct RemediationApplier<'a, R: CommandRunner> {
    runner: &'a R,
    command_timeout: Duration,
}

impl<'a, R: CommandRunner> RemediationApplier<'a, R> {
    pub fn new(runner: &'a R, command_timeout: Duration) -> Self {
        Self {
            runner,
            command_timeout,
        }
    }

    #[instrument(skip_all, fields(solution_type = ?remediation.solution_type))]
    pub fn apply(&self, remediation: &Remediation, project_root: &Path) -> bool {
        info!(root_cause = %remediation.root_cause, "applying remediation");
        let root = canonical_root(project_root);
        let mut applied = true;

        for file in remediation
            .files_to_create
            .iter()
            .chain(&remediation.files_to_update)
        {
            match write_contained(&root, file) {
                Ok(path) => info!(path = %path.display(), "wrote file"),
                Err(err) => {
                    warn!(path = %file.relative_path, err = %format!("{err:#}"), "file write failed");
                    applied = false;
                }
            }
        }

        for command in &remediation.commands_to_run {
            let result = self.runner.run(command, &root, self.command_timeout);
            if !result.succeeded {
                warn!(
                    command = %command,
                    exit_code = result.exit_code,
                    "auxiliary command failed, continuing"
                );
            }
        }

        applied
    }
}

/// Write one file under `root`, refusing targets that escape it.
pub fn write_contained(root: &Path, file: &FileWrite) -> Result<PathBuf> {
    let relative = Path::new(&file.relative_path);
    if relative.is_absolute() {
        return Err(anyhow!(
            "refusing absolute path {} (paths must be relative to the project root)",
            file.relative_path
        ));
    }
    let target = match resolve_within(root, relative) {
        Containment::Inside(path) => path,
        Containment::Outside => {
            return Err(anyhow!(
                "refusing {} (resolves outside the project root)",
                file.relative_path
            ));
        }
    };
    if target == root {
        return Err(anyhow!("refusing to overwrite the project root"));
    }
    let parent = target
        .parent()
        .with_context(|| format!("path missing parent {}", target.display()))?;
    // Symlinked ancestors could point outside the root; check before creating anything.
    let ancestor = existing_ancestor(parent);
    ensure_inside(root, &ancestor, file, "parent directory links")?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    ensure_inside(root, parent, file, "parent directory links")?;
    if fs::symlink_metadata(&target).is_ok_and(|meta| meta.file_type().is_symlink()) {
        ensure_inside(root, &target, file, "file links")?;
    }
    fs::write(&target, &file.content).with_context(|| format!("write {}", target.display()))?;
    Ok(target)
}

/// Deepest ancestor of `path` that exists on disk.
fn existing_ancestor(path: &Path) -> PathBuf {
    path.ancestors()
        .find(|ancestor| ancestor.exists())
        .unwrap_or(path)
        .to_path_buf()
}

/// Refuse `file` unless `path` canonicalizes to a location under `root`.
fn ensure_inside(root: &Path, path: &Path, file: &FileWrite, what: &str) -> Result<()> {
    let canonical = fs::canonicalize(path).with_context(|| {
        format!(
            "refusing {} (cannot resolve {})",
            file.relative_path,
            path.display()
        )
    })?;
    if !canonical.starts_with(root) {
        return Err(anyhow!(
            "refusing {} ({what} outside the project root)",
            file.relative_path
        ));
    }
    Ok(())
}
