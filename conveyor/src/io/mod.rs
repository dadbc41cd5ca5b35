//! Side-effecting adapters: processes, git, files, tracker and agents.

pub mod agent;
pub mod atomic;
pub mod checkpoint;
pub mod config;
pub mod git;
pub mod process;
pub mod prompt;
pub mod registry;
pub mod report;
pub mod stream;
pub mod tracker;
pub mod workspace;
