//! Deterministic, pure logic shared by the pipeline.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod branch;
pub mod budget;
pub mod labels;
pub mod sanitize;
pub mod skip;
pub mod types;
