//! Stable exit codes for `devloop` CLI commands.

/// Command succeeded; for `run`/`resume`, every task was processed.
pub const OK: i32 = 0;
/// The run failed, or the command hit invalid input/config.
pub const FAILED: i32 = 1;
/// The run is paused or waiting on input that could not be collected.
pub const SUSPENDED: i32 = 2;
