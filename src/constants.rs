//! Application-wide constants for twoway.
//!
//! This module centralizes the numeric defaults used across the relay so
//! they can be found in one place.
//!
//! # Categories
//!
//! - **Transfer**: buffer sizing for the relay loop
//! - **Timeouts**: half-close and polling intervals
//! - **Line editing**: prompt tracking and history limits
//! - **Processes**: child shutdown grace period

use std::time::Duration;

// ============================================================================
// Transfer
// ============================================================================

/// Default size of the per-direction transfer buffer (`-b`).
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Upper bound accepted for `-b` / `TWOWAY_BUFSIZE`.
pub const MAX_BUFFER_SIZE: usize = 16 * 1024 * 1024;

// ============================================================================
// Timeouts
// ============================================================================

/// How long the relay keeps running after the first direction reached EOF
/// (`-t`). The other direction usually finishes well within this window.
pub const DEFAULT_HALF_CLOSE_TIMEOUT: Duration = Duration::from_millis(500);

/// Upper bound on a single `poll(2)` wait.
///
/// Signals and timeouts are checked at loop boundaries, so the wait is kept
/// short enough that a latched signal is handled promptly even if the
/// kernel restarted the call.
pub const POLL_TICK: Duration = Duration::from_millis(250);

// ============================================================================
// Line editing
// ============================================================================

/// Capacity of the dynamic prompt ring in bytes.
pub const PROMPT_CAPACITY: usize = 512;

/// Maximum number of history entries kept in memory and written back.
pub const HISTORY_LIMIT: usize = 1000;

// ============================================================================
// Processes
// ============================================================================

/// Time a child gets to exit after its pipes are closed before SIGTERM.
pub const CHILD_EXIT_GRACE: Duration = Duration::from_millis(500);

/// Time a child gets after SIGTERM before SIGKILL.
pub const CHILD_TERM_GRACE: Duration = Duration::from_secs(2);

/// Interval between `try_wait` checks while reaping a child.
pub const CHILD_REAP_INTERVAL: Duration = Duration::from_millis(50);

/// Default listen backlog for `tcp-listen` / `unix-listen`.
pub const DEFAULT_BACKLOG: i32 = 5;
