//! Stable exit codes for conveyor commands.

/// Command succeeded; every processed item completed or awaits review.
pub const OK: i32 = 0;
/// Invalid configuration, missing checkpoint or other operator errors.
pub const INVALID: i32 = 1;
/// At least one work item failed.
pub const FAILED: i32 = 2;
/// Stopped by SIGINT/SIGTERM, on either shutdown tier.
pub const INTERRUPTED: i32 = 130;
