//! `readline`: standard input through the line editor, output to standard
//! output.
//!
//! Like `stdio`, the endpoint only holds the halves its direction uses.
//!
//! The console is left with echo and canonical input off between reads; the
//! editor turns echo on for the duration of a line. Closing puts the
//! terminal back and writes the history file.

use std::io;
use std::os::fd::AsFd;

use super::OpenRequest;
use crate::editor;
use crate::endpoint::{Descriptors, Endpoint, Handle};
use crate::error::OpenError;
use crate::hook::line_edit::Prompt;
use crate::hook::{Behavior, LineEdit};
use crate::option::PendingOptions;
use crate::terminal::{self, TermFlags};

/// Opens the line-editing console.
pub fn open(req: &OpenRequest<'_>, pending: &mut PendingOptions) -> Result<Endpoint, OpenError> {
    let mut params = super::early_params(pending)?;
    let tty = super::tty_snapshot(libc::STDIN_FILENO);
    super::apply_to_fd(pending, &mut params, io::stdin().as_fd(), tty.as_ref())?;

    let readline = std::mem::take(&mut params.readline);
    if tty.is_some() {
        let quiet = TermFlags {
            canonical: false,
            echo: false,
        };
        if let Err(e) = terminal::set_flags(libc::STDIN_FILENO, quiet) {
            log::warn!("{}: cannot turn off terminal echo: {}", req.label, e);
        }
    }
    if let Some(path) = &readline.history_file {
        log::debug!(
            "{}: {} history entries from {}",
            req.label,
            readline.history.len(),
            path.display()
        );
    }

    let line_edit = LineEdit::new(
        Prompt::from(readline.prompt),
        readline.noecho,
        readline.history_file,
        editor::for_stdin(readline.history),
    );
    // The editor draws prompts on stdout whatever the direction; the
    // endpoint's write side only exists when data is relayed to it.
    let fds = Descriptors::Pair {
        read: req
            .direction
            .reads()
            .then_some(Handle::Std(libc::STDIN_FILENO)),
        write: req
            .direction
            .writes()
            .then_some(Handle::Std(libc::STDOUT_FILENO)),
    };
    Ok(Endpoint::new(req.label, fds)
        .with_behavior(Behavior::LineEdit(Box::new(line_edit)))
        .with_tty(tty)
        .with_shutdown(req.descriptor.shutdown)
        .with_close(req.descriptor.close))
}
