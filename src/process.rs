//! Child process shutdown for `exec` and `system` endpoints.
//!
//! A child gets a grace period to exit on its own once its pipes are
//! closed, then SIGTERM, then SIGKILL. The exit status is logged; a child
//! that did not exit cleanly is a warning.

// Rust guideline compliant 2026-02

use std::fmt;
use std::io;
use std::time::{Duration, Instant};

use portable_pty::{Child as _, ChildKiller as _};

use crate::constants::{CHILD_EXIT_GRACE, CHILD_REAP_INTERVAL, CHILD_TERM_GRACE};

/// How a child ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildExit {
    /// Exited with status 0.
    pub success: bool,
    /// Human-readable status for diagnostics.
    pub description: String,
}

/// A child spawned on pipes or on a pseudo-terminal.
pub enum ChildProcess {
    /// Spawned with `std::process`, talking over pipes.
    Piped(std::process::Child),
    /// Spawned on the slave side of a pseudo-terminal.
    Pty(Box<dyn portable_pty::Child + Send + Sync>),
}

impl fmt::Debug for ChildProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Piped(child) => f.debug_tuple("Piped").field(&child.id()).finish(),
            Self::Pty(child) => f.debug_tuple("Pty").field(&child.process_id()).finish(),
        }
    }
}

impl ChildProcess {
    /// Process id, if still known.
    pub fn id(&self) -> Option<u32> {
        match self {
            Self::Piped(child) => Some(child.id()),
            Self::Pty(child) => child.process_id(),
        }
    }

    fn try_wait(&mut self) -> io::Result<Option<ChildExit>> {
        Ok(match self {
            Self::Piped(child) => child.try_wait()?.map(|status| ChildExit {
                success: status.success(),
                description: status.to_string(),
            }),
            Self::Pty(child) => child.try_wait()?.map(|status| ChildExit {
                success: status.success(),
                description: format!("exit status {}", status.exit_code()),
            }),
        })
    }

    fn kill(&mut self) -> io::Result<()> {
        match self {
            Self::Piped(child) => child.kill(),
            Self::Pty(child) => child.kill(),
        }
    }

    /// Kills a child that never got to run its course, then collects it.
    pub fn discard(mut self) {
        if let Err(e) = self.kill() {
            log::debug!("kill({:?}): {}", self.id(), e);
        }
        wait_with_timeout(&mut self, CHILD_TERM_GRACE);
    }

    fn terminate(&self) {
        if let Some(pid) = self.id() {
            // SAFETY: `pid` is our own unreaped child, so it cannot have been recycled.
            unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        }
    }
}

/// Polls `try_wait` until the child exits or `timeout` elapses.
pub fn wait_with_timeout(child: &mut ChildProcess, timeout: Duration) -> Option<ChildExit> {
    let start = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(exit)) => return Some(exit),
            Ok(None) if start.elapsed() < timeout => std::thread::sleep(CHILD_REAP_INTERVAL),
            Ok(None) => return None,
            Err(e) => {
                log::warn!("waitpid({:?}): {}", child.id(), e);
                return None;
            }
        }
    }
}

/// Waits for the child, escalating to SIGTERM and SIGKILL.
///
/// The caller must already have closed the child's input, so a
/// well-behaved child exits within [`CHILD_EXIT_GRACE`].
pub fn reap(child: &mut ChildProcess, label: &str) -> Option<ChildExit> {
    let pid = child.id();
    let exit = wait_with_timeout(child, CHILD_EXIT_GRACE)
        .or_else(|| {
            log::debug!("{}: sending SIGTERM to child {:?}", label, pid);
            child.terminate();
            wait_with_timeout(child, CHILD_TERM_GRACE)
        })
        .or_else(|| {
            log::debug!("{}: force killing child {:?} with SIGKILL", label, pid);
            if let Err(e) = child.kill() {
                log::warn!("kill({:?}): {}", pid, e);
            }
            wait_with_timeout(child, CHILD_TERM_GRACE)
        });
    match &exit {
        Some(exit) if exit.success => {
            log::debug!("{}: child {:?} exited with {}", label, pid, exit.description);
        }
        Some(exit) => log::warn!("{}: child {:?} exited with {}", label, pid, exit.description),
        None => log::warn!("{}: child {:?} could not be reaped", label, pid),
    }
    exit
}
