//! Iterative command-driven repair loop.
//!
//! Runs a target shell command, and while it fails, asks a diagnosis oracle for a
//! structured remediation, applies it to the project tree, and tries again until the
//! command passes or the iteration budget is spent. The architecture keeps a strict
//! separation:
//!
//! - **[`core`]**: Pure, deterministic logic (value types, history, candidate discovery,
//!   path containment, reply parsing). No I/O.
//! - **[`io`]**: Side-effecting operations (processes, filesystem, oracle, logs).
//!   Behind traits where tests need scripted stand-ins.
//!
//! Orchestration modules ([`repair`], [`checklist`], [`update`]) coordinate core logic with I/O to
//! implement CLI commands.

pub mod checklist;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod repair;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod update;
