//! Deterministic, pure logic shared by the repair loop.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod candidates;
pub mod containment;
pub mod history;
pub mod remediation_parse;
pub mod types;
