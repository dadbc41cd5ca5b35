//! Autonomous work-item pipeline orchestrator.
//!
//! Work items from an external tracker are run through an ordered list of
//! agent steps (implement, review, fix, audit, merge) inside isolated git
//! worktrees, then integrated with trunk one at a time. The architecture
//! enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (skip rules, label state
//!   machine, budget, branch validation). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting adapters (processes, agents, git, worktrees,
//!   checkpoints, reports, config, prompts). Isolated behind traits where
//!   tests need fakes.
//!
//! Orchestration modules ([`step`], [`merge`], [`classify`],
//! [`orchestrator`], [`shutdown`]) coordinate the two; [`verify`] and
//! [`notify`] are services shared between them.

pub mod classify;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod merge;
pub mod notify;
pub mod orchestrator;
pub mod shutdown;
pub mod step;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod verify;
