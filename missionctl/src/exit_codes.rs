//! Stable exit codes for missionctl CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Command failed: unreadable config, runtime error or bad arguments.
pub const INVALID: i32 = 1;
/// `missionctl validate` found hard errors in the workflow document.
pub const FINDINGS: i32 = 2;
/// `missionctl wake` or `submit` named an agent or mission that does not exist.
pub const UNKNOWN: i32 = 3;
