//! Per-endpoint I/O hooks.
//!
//! An endpoint's [`Behavior`] sits between the relay and the raw
//! descriptors. The relay calls [`Behavior::read`] instead of `read(2)`,
//! and after every physical write it hands the exact bytes written to
//! [`Behavior::observe_write`].
//!
//! ```text
//! relay ──read──▶ Behavior ──read_input──▶ TermIo (endpoint fds)
//! relay ──write─▶ endpoint fd ──bytes written──▶ Behavior::observe_write
//! ```
//!
//! Hooks never touch descriptors directly; they go through [`TermIo`], which
//! the endpoint implements and tests fake.

pub mod line_edit;
pub mod prompt;

use std::io;

pub use line_edit::LineEdit;
pub use prompt::PromptRing;

use crate::terminal::TermFlags;

/// Raw access to an endpoint's descriptors, as seen by a hook.
pub trait TermIo {
    /// Reads from the input descriptor.
    fn read_input(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes to the output descriptor.
    fn write_output(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Canonical/echo bits of the input terminal.
    fn term_flags(&self) -> io::Result<TermFlags>;

    /// Sets the canonical/echo bits of the input terminal.
    fn set_term_flags(&mut self, flags: TermFlags) -> io::Result<()>;

    /// Blocks until input can be read without blocking. Fails with
    /// `ErrorKind::Interrupted` once a termination signal is latched.
    fn wait_input(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// False once the output side has been shut down.
    fn has_output(&self) -> bool {
        true
    }
}

/// Which hook pair an endpoint uses.
#[derive(Debug, Default)]
pub enum Behavior {
    /// Raw reads, nothing observed.
    #[default]
    Plain,
    /// Line editing with prompt tracking and echo suppression.
    LineEdit(Box<LineEdit>),
}

impl Behavior {
    /// Reads up to `buf.len()` bytes. `Ok(0)` is end of input.
    pub fn read(&mut self, io: &mut dyn TermIo, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain => io.read_input(buf),
            Self::LineEdit(edit) => edit.read(io, buf),
        }
    }

    /// Sees bytes right after they were written to the endpoint.
    pub fn observe_write(&mut self, data: &[u8]) {
        if let Self::LineEdit(edit) = self {
            edit.observe_write(data);
        }
    }

    /// True if the hook holds input that `poll(2)` cannot report.
    pub fn has_buffered_input(&self) -> bool {
        match self {
            Self::Plain => false,
            Self::LineEdit(edit) => edit.has_buffered_input(),
        }
    }

    /// Runs when the endpoint closes.
    pub fn close(&mut self) {
        if let Self::LineEdit(edit) = self {
            edit.save_history();
        }
    }
}
