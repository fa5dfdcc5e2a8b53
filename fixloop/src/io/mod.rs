//! I/O for the repair loop: processes, filesystem, oracle, and on-disk artifacts.

pub mod applier;
pub mod config;
pub mod context;
pub mod iteration_log;
pub mod oracle;
pub mod ports;
pub mod process;
pub mod prompt;
pub mod report;
