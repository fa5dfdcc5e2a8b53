//! End-of-run JSON reports (`--report PATH`).

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::io::iteration_log::write_json;

/// Write `report` as pretty JSON, creating parent directories.
pub fn write_report<T: Serialize>(path: &Path, report: &T) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("create report directory {}", parent.display()))?;
    }
    write_json(path, report).with_context(|| format!("write report {}", path.display()))
}
