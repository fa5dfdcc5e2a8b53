//! Composite repair over a checklist of target commands (`fixloop checklist`).
//!
//! Items run strictly in order and every item runs, whatever happened before it. Each
//! step of an item is an independent repair session; sessions share only the project
//! root.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;
use tracing::{info, info_span, warn};

use crate::io::config::ChecklistItemConfig;
use crate::io::oracle::DiagnosisOracle;
use crate::io::process::CommandRunner;
use crate::repair::{RepairLoop, RepairOutcome, RepairTarget};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChecklistItemReport {
    pub name: String,
    pub success: bool,
    pub sessions: Vec<RepairOutcome>,
}

/// Ordered per-item results of a checklist run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChecklistReport {
    pub items: Vec<ChecklistItemReport>,
}

impl ChecklistReport {
    /// Item name to success.
    pub fn success_map(&self) -> BTreeMap<String, bool> {
        self.items
            .iter()
            .map(|item| (item.name.clone(), item.success))
            .collect()
    }

    pub fn all_succeeded(&self) -> bool {
        self.items.iter().all(|item| item.success)
    }

    pub fn failed(&self) -> impl Iterator<Item = &ChecklistItemReport> {
        self.items.iter().filter(|item| !item.success)
    }
}

/// Run every checklist item against `project_root`.
///
/// An item's ports are freed before every run of each of its steps.
///
/// Iteration logs, when the loop has a log directory, go under
/// `<log_dir>/<item>/<step>/`.
pub fn run_checklist<R: CommandRunner, O: DiagnosisOracle>(
    repair: &RepairLoop<'_, R, O>,
    project_root: &Path,
    items: &[ChecklistItemConfig],
) -> ChecklistReport {
    let mut report = ChecklistReport::default();
    for item in items {
        let _span = info_span!("checklist_item", name = %item.name).entered();
        let mut sessions = Vec::with_capacity(item.steps.len());
        for (index, step) in item.steps.iter().enumerate() {
            let target = RepairTarget::new(step.command.clone(), project_root)
                .with_workdir(step.workdir.clone())
                .with_cleanup_ports(item.cleanup_ports.clone());
            let log_dir = repair
                .settings()
                .log_dir
                .as_ref()
                .map(|dir| dir.join(&item.name).join((index + 1).to_string()));
            sessions.push(repair.run_logged(&target, log_dir.as_deref()));
        }
        let success = sessions.iter().all(RepairOutcome::succeeded);
        if success {
            info!("checklist item passed");
        } else {
            warn!("checklist item failed");
        }
        report.items.push(ChecklistItemReport {
            name: item.name.clone(),
            success,
            sessions,
        });
    }
    report
}
