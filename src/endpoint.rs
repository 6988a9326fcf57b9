//! Opened addresses.
//!
//! An [`Endpoint`] owns everything an open entry point acquired: the
//! descriptors, the saved terminal attributes, a child process, paths to
//! remove. Closing releases all of it in a fixed order and is idempotent;
//! dropping an endpoint closes it.
//!
//! # Close order
//!
//! 1. Behavior cleanup (history is written back).
//! 2. Saved terminal attributes are restored.
//! 3. Descriptors are closed (standard streams are left open), including a
//!    held pseudo-terminal slave.
//! 4. The child process is reaped.
//! 5. Listed paths are unlinked.

// Rust guideline compliant 2026-02

use std::fmt;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::path::PathBuf;

use crate::hook::{Behavior, TermIo};
use crate::process::{self, ChildProcess};
use crate::signals;
use crate::terminal::{self, TermFlags, TtySnapshot};

/// A descriptor held by an endpoint.
#[derive(Debug)]
pub enum Handle {
    /// Closed when the endpoint closes.
    Owned(OwnedFd),
    /// A standard stream; never closed.
    Std(RawFd),
}

impl AsRawFd for Handle {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Self::Owned(fd) => fd.as_raw_fd(),
            Self::Std(fd) => *fd,
        }
    }
}

impl AsFd for Handle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Self::Owned(fd) => fd.as_fd(),
            // SAFETY: standard streams stay open for the life of the process.
            Self::Std(fd) => unsafe { BorrowedFd::borrow_raw(*fd) },
        }
    }
}

impl From<OwnedFd> for Handle {
    fn from(fd: OwnedFd) -> Self {
        Self::Owned(fd)
    }
}

/// The descriptors of an endpoint.
#[derive(Debug)]
pub enum Descriptors {
    /// One descriptor for both directions.
    Single(Handle),
    /// Separate descriptors; either may be absent for one-way endpoints.
    Pair {
        /// Read side.
        read: Option<Handle>,
        /// Write side.
        write: Option<Handle>,
    },
}

impl Descriptors {
    /// A read/write pair.
    pub fn pair(read: Handle, write: Handle) -> Self {
        Self::Pair {
            read: Some(read),
            write: Some(write),
        }
    }

    /// The descriptor options act on: the shared one, else the read side,
    /// else the write side.
    pub fn primary(&self) -> Option<BorrowedFd<'_>> {
        match self {
            Self::Single(h) => Some(h.as_fd()),
            Self::Pair { read, write } => read.as_ref().or(write.as_ref()).map(AsFd::as_fd),
        }
    }

    fn read_fd(&self) -> Option<RawFd> {
        match self {
            Self::Single(h) => Some(h.as_raw_fd()),
            Self::Pair { read, .. } => read.as_ref().map(AsRawFd::as_raw_fd),
        }
    }

    fn write_fd(&self) -> Option<RawFd> {
        match self {
            Self::Single(h) => Some(h.as_raw_fd()),
            Self::Pair { write, .. } => write.as_ref().map(AsRawFd::as_raw_fd),
        }
    }
}

/// Shutdown progress of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    /// Both directions usable.
    Open,
    /// Reading reached end of input.
    HalfClosedRead,
    /// The write half was shut down.
    HalfClosedWrite,
    /// Nothing more can move; closing only releases resources.
    Closed,
}

/// How the write half is shut down when the peer's input ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPolicy {
    /// Nothing is done; the descriptor stays open until close.
    None,
    /// The write descriptor is closed (standard output is redirected to
    /// `/dev/null` instead, so fd 1 stays valid).
    CloseWrite,
    /// `shutdown(SHUT_WR)` on the socket.
    SocketWrite,
}

/// Extra duties on close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosePolicy {
    /// Close the descriptors.
    Close,
    /// Leave standard streams alone.
    KeepStd,
    /// Close, then wait for the child process.
    ReapChild,
}

/// One opened address.
pub struct Endpoint {
    label: String,
    fds: Option<Descriptors>,
    behavior: Behavior,
    tty: Option<TtySnapshot>,
    read_eof: bool,
    write_shut: bool,
    closed: bool,
    shutdown: ShutdownPolicy,
    close_policy: ClosePolicy,
    child: Option<ChildProcess>,
    pty_slave: Option<Box<dyn portable_pty::SlavePty + Send>>,
    unlink: Vec<PathBuf>,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("label", &self.label)
            .field("fds", &self.fds)
            .field("state", &self.state())
            .field("shutdown", &self.shutdown)
            .field("close_policy", &self.close_policy)
            .field("child", &self.child)
            .finish_non_exhaustive()
    }
}

impl Endpoint {
    /// Creates a plain endpoint that closes its descriptors on close.
    pub fn new(label: impl Into<String>, fds: Descriptors) -> Self {
        Self {
            label: label.into(),
            fds: Some(fds),
            behavior: Behavior::Plain,
            tty: None,
            read_eof: false,
            write_shut: false,
            closed: false,
            shutdown: ShutdownPolicy::None,
            close_policy: ClosePolicy::Close,
            child: None,
            pty_slave: None,
            unlink: Vec::new(),
        }
    }

    /// Endpoint over one owned socket, shut down with `SHUT_WR`.
    pub fn from_socket(label: impl Into<String>, fd: impl Into<OwnedFd>) -> Self {
        Self::new(label, Descriptors::Single(Handle::Owned(fd.into())))
            .with_shutdown(ShutdownPolicy::SocketWrite)
    }

    /// Sets the hook pair.
    #[must_use]
    pub fn with_behavior(mut self, behavior: Behavior) -> Self {
        self.behavior = behavior;
        self
    }

    /// Terminal attributes to restore on close.
    #[must_use]
    pub fn with_tty(mut self, snapshot: Option<TtySnapshot>) -> Self {
        self.tty = snapshot;
        self
    }

    /// Sets the write-half shutdown policy.
    #[must_use]
    pub fn with_shutdown(mut self, policy: ShutdownPolicy) -> Self {
        self.shutdown = policy;
        self
    }

    /// Sets the close policy.
    #[must_use]
    pub fn with_close(mut self, policy: ClosePolicy) -> Self {
        self.close_policy = policy;
        self
    }

    /// Child process to reap on close.
    #[must_use]
    pub fn with_child(mut self, child: ChildProcess) -> Self {
        self.child = Some(child);
        self.close_policy = ClosePolicy::ReapChild;
        self
    }

    /// Keeps the slave side of a pseudo-terminal open until close, so reads
    /// on the master do not fail before a peer attaches.
    #[must_use]
    pub fn with_pty_slave(mut self, slave: Box<dyn portable_pty::SlavePty + Send>) -> Self {
        self.pty_slave = Some(slave);
        self
    }

    /// Removes `path` on close.
    #[must_use]
    pub fn unlink_on_close(mut self, path: PathBuf) -> Self {
        self.unlink.push(path);
        self
    }

    /// Name used in diagnostics.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Current shutdown progress.
    pub fn state(&self) -> ShutdownState {
        if self.closed || (self.read_eof && self.write_shut) {
            ShutdownState::Closed
        } else if self.read_eof {
            ShutdownState::HalfClosedRead
        } else if self.write_shut {
            ShutdownState::HalfClosedWrite
        } else {
            ShutdownState::Open
        }
    }

    /// Descriptor to poll for input.
    pub fn read_fd(&self) -> Option<RawFd> {
        if self.closed {
            return None;
        }
        self.fds.as_ref().and_then(Descriptors::read_fd)
    }

    /// Descriptor to poll for output.
    pub fn write_fd(&self) -> Option<RawFd> {
        if self.closed || self.write_shut {
            return None;
        }
        self.fds.as_ref().and_then(Descriptors::write_fd)
    }

    /// True if the behavior holds input `poll(2)` cannot report.
    pub fn has_buffered_input(&self) -> bool {
        !self.closed && !self.read_eof && self.behavior.has_buffered_input()
    }

    /// The behavior of this endpoint.
    pub fn behavior(&self) -> &Behavior {
        &self.behavior
    }

    /// Reads through the behavior's read hook. `Ok(0)` is end of input.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut io = RawIo {
            read_fd: self.read_fd(),
            write_fd: self.write_fd(),
        };
        self.behavior.read(&mut io, buf)
    }

    /// Writes raw bytes, then hands exactly the written ones to the
    /// write-observed hook.
    pub fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut io = RawIo {
            read_fd: self.read_fd(),
            write_fd: self.write_fd(),
        };
        let n = io.write_output(data)?;
        self.behavior.observe_write(&data[..n]);
        Ok(n)
    }

    /// Records end of input on the read side.
    pub fn mark_read_eof(&mut self) {
        self.read_eof = true;
    }

    /// Shuts the write half down per the endpoint's policy.
    pub fn shutdown_write(&mut self) {
        if self.closed || self.write_shut {
            return;
        }
        self.write_shut = true;
        log::debug!("{}: shutting down write half", self.label);
        match self.shutdown {
            ShutdownPolicy::None => {}
            ShutdownPolicy::SocketWrite => {
                if let Some(fd) = self.fds.as_ref().and_then(Descriptors::write_fd) {
                    // SAFETY: plain syscall on a descriptor this endpoint holds.
                    if unsafe { libc::shutdown(fd, libc::SHUT_WR) } < 0 {
                        let e = io::Error::last_os_error();
                        if e.raw_os_error() != Some(libc::ENOTCONN) {
                            log::warn!("shutdown({}, SHUT_WR): {}", fd, e);
                        }
                    }
                }
            }
            ShutdownPolicy::CloseWrite => self.close_write_half(),
        }
    }

    fn close_write_half(&mut self) {
        match &mut self.fds {
            Some(Descriptors::Pair { write, .. }) => match write.take() {
                Some(Handle::Std(fd)) => redirect_to_null(fd),
                Some(Handle::Owned(fd)) => drop(fd),
                None => {}
            },
            Some(Descriptors::Single(Handle::Std(fd))) => redirect_to_null(*fd),
            Some(Descriptors::Single(Handle::Owned(fd))) => {
                // SAFETY: shutting down a descriptor this endpoint owns.
                unsafe { libc::shutdown(fd.as_raw_fd(), libc::SHUT_WR) };
            }
            None => {}
        }
    }

    /// Releases everything the endpoint holds. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        log::debug!("{}: closing", self.label);

        self.behavior.close();
        if let Some(snapshot) = self.tty.take() {
            if let Err(e) = snapshot.restore() {
                log::warn!("{}: cannot restore terminal on fd {}: {}", self.label, snapshot.fd(), e);
            }
        }
        if self.close_policy != ClosePolicy::KeepStd {
            drop(self.fds.take());
        }
        drop(self.pty_slave.take());
        if let Some(mut child) = self.child.take() {
            process::reap(&mut child, &self.label);
        }
        for path in self.unlink.drain(..) {
            match std::fs::remove_file(&path) {
                Ok(()) => log::debug!("{}: removed {}", self.label, path.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => log::warn!("unlink(\"{}\"): {}", path.display(), e),
            }
        }
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.close();
    }
}

/// Points a standard stream at `/dev/null` so readers of the old file see
/// end of input while the descriptor number stays in use.
fn redirect_to_null(fd: RawFd) {
    match std::fs::OpenOptions::new().write(true).open("/dev/null") {
        Ok(null) => {
            // SAFETY: both descriptors are valid; dup2 atomically replaces `fd`.
            if unsafe { libc::dup2(null.as_raw_fd(), fd) } < 0 {
                log::warn!("dup2(/dev/null, {}): {}", fd, io::Error::last_os_error());
            }
        }
        Err(e) => log::warn!("open(\"/dev/null\"): {}", e),
    }
}

/// Descriptor view handed to the hooks.
struct RawIo {
    read_fd: Option<RawFd>,
    write_fd: Option<RawFd>,
}

fn missing(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::Unsupported, format!("endpoint has no {what} side"))
}

impl TermIo for RawIo {
    fn read_input(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let fd = self.read_fd.ok_or_else(|| missing("read"))?;
        // SAFETY: `buf` is valid for `buf.len()` bytes.
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn write_output(&mut self, data: &[u8]) -> io::Result<usize> {
        let fd = self.write_fd.ok_or_else(|| missing("write"))?;
        // SAFETY: `data` is valid for `data.len()` bytes.
        let n = unsafe { libc::write(fd, data.as_ptr().cast(), data.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn term_flags(&self) -> io::Result<TermFlags> {
        terminal::flags(self.read_fd.ok_or_else(|| missing("read"))?)
    }

    fn set_term_flags(&mut self, flags: TermFlags) -> io::Result<()> {
        terminal::set_flags(self.read_fd.ok_or_else(|| missing("read"))?, flags)
    }

    fn wait_input(&mut self) -> io::Result<()> {
        signals::wait_readable(self.read_fd.ok_or_else(|| missing("read"))?)
    }

    fn has_output(&self) -> bool {
        self.write_fd.is_some()
    }
}
