//! Stable exit codes for fixloop CLI commands.

/// The target command passes (or every checklist item does).
pub const OK: i32 = 0;
/// Invalid arguments or config, or another internal error.
pub const INVALID: i32 = 1;
/// Repair attempts were exhausted, or at least one checklist item failed.
pub const EXHAUSTED: i32 = 2;
