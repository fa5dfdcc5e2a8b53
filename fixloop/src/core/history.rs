//! Append-only record of failed repair iterations.

use serde::Serialize;

use crate::core::types::{HistoryEntry, Remediation};

/// Largest number of trailing entries shown to the oracle.
pub const MAX_HISTORY_WINDOW: usize = 2;

/// Ordered history owned by a single repair session.
///
/// Entries are only ever appended, and each entry's `iteration` equals its 1-based
/// position.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct History {
    entries: Vec<HistoryEntry>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a new entry numbered after the last one and return it.
    pub fn record(
        &mut self,
        command: &str,
        error_snippet: String,
        remediation: Remediation,
    ) -> &HistoryEntry {
        let iteration = self.next_iteration();
        self.entries.push(HistoryEntry {
            iteration,
            command: command.to_string(),
            error_snippet,
            remediation,
        });
        &self.entries[self.entries.len() - 1]
    }

    pub fn next_iteration(&self) -> u32 {
        self.entries.len() as u32 + 1
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The most recent `window` entries, oldest first.
    pub fn trailing(&self, window: usize) -> &[HistoryEntry] {
        let start = self.entries.len().saturating_sub(window);
        &self.entries[start..]
    }

    /// Lossless JSON of the trailing window, or `None` when nothing was recorded yet.
    pub fn render_trailing(&self, window: usize) -> Option<String> {
        let trailing = self.trailing(window);
        if trailing.is_empty() {
            return None;
        }
        // HistoryEntry contains only strings, integers and enums.
        serde_json::to_string_pretty(trailing).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::SolutionType;

    fn remediation(cause: &str) -> Remediation {
        Remediation::degraded(SolutionType::Manual, cause)
    }

    #[test]
    fn record_numbers_entries_by_position() {
        let mut history = History::new();
        for cause in ["a", "b", "c"] {
            history.record("make", "err".to_string(), remediation(cause));
        }
        let iterations: Vec<u32> = history.entries().iter().map(|e| e.iteration).collect();
        assert_eq!(iterations, vec![1, 2, 3]);
        assert_eq!(history.next_iteration(), 4);
    }

    #[test]
    fn trailing_keeps_most_recent_in_order() {
        let mut history = History::new();
        for cause in ["a", "b", "c"] {
            history.record("make", "err".to_string(), remediation(cause));
        }
        let causes: Vec<&str> = history
            .trailing(2)
            .iter()
            .map(|e| e.remediation.root_cause.as_str())
            .collect();
        assert_eq!(causes, vec!["b", "c"]);
        assert_eq!(history.trailing(10).len(), 3);
    }

    #[test]
    fn render_trailing_is_none_when_empty() {
        assert!(History::new().render_trailing(2).is_none());
    }

    #[test]
    fn render_trailing_round_trips_entries() {
        let mut history = History::new();
        history.record("go build", "main.go:1: bad\n\"quoted\"".to_string(), remediation("x"));
        let rendered = history.render_trailing(2).expect("rendered");
        let parsed: Vec<HistoryEntry> = serde_json::from_str(&rendered).expect("parse");
        assert_eq!(parsed, history.entries());
    }
}
