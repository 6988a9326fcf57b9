//! Line-editing behavior for the `readline` address.
//!
//! Reads go through the line editor, one edited line per read, with the
//! prompt the user is looking at redrawn in front of the input. Writes to
//! the console are observed so the partial line the peer last printed can
//! serve as that prompt.
//!
//! When the tracked prompt matches the `noecho` pattern (typically a
//! password prompt) the editor is bypassed: the terminal is switched to
//! canonical mode without echo for one raw read and then put back.

use std::io;
use std::path::PathBuf;

use regex::bytes::Regex;

use super::{PromptRing, TermIo};
use crate::editor::LineReader;
use crate::option::PromptMode;
use crate::terminal::TermFlags;

/// Prompt source of a line-editing endpoint.
#[derive(Debug)]
pub enum Prompt {
    /// Fixed text.
    Static(String),
    /// Tail of the console output since the last line break.
    Dynamic(PromptRing),
    /// No prompt.
    Disabled,
}

impl From<PromptMode> for Prompt {
    fn from(mode: PromptMode) -> Self {
        match mode {
            PromptMode::Dynamic => Self::Dynamic(PromptRing::default()),
            PromptMode::Static(text) => Self::Static(text),
            PromptMode::Disabled => Self::Disabled,
        }
    }
}

/// State of the line-editing hook pair.
#[derive(Debug)]
pub struct LineEdit {
    prompt: Prompt,
    noecho: Option<Regex>,
    history_file: Option<PathBuf>,
    editor: Box<dyn LineReader>,
}

impl LineEdit {
    /// Creates the hook state around an editor.
    pub fn new(
        prompt: Prompt,
        noecho: Option<Regex>,
        history_file: Option<PathBuf>,
        editor: Box<dyn LineReader>,
    ) -> Self {
        Self {
            prompt,
            noecho,
            history_file,
            editor,
        }
    }

    /// The prompt source.
    pub fn prompt(&self) -> &Prompt {
        &self.prompt
    }

    /// Read hook. Returns `Ok(0)` at end of input.
    pub fn read(&mut self, io: &mut dyn TermIo, buf: &mut [u8]) -> io::Result<usize> {
        if self.echo_suppressed() {
            let n = read_without_echo(io, buf)?;
            self.clear_prompt();
            return Ok(n);
        }

        match io.term_flags() {
            Ok(flags) => {
                if let Err(e) = io.set_term_flags(TermFlags { echo: true, ..flags }) {
                    log::warn!("cannot enable echo: {}", e);
                }
            }
            Err(e) => log::trace!("terminal flags unavailable: {}", e),
        }

        let prompt = match &self.prompt {
            Prompt::Static(text) => Some(text.clone()),
            Prompt::Dynamic(ring) => Some(ring.text()),
            Prompt::Disabled => None,
        };
        if prompt.is_some() && io.has_output() {
            match io.write_output(b"\r") {
                Ok(1) => {}
                Ok(n) => log::warn!("write() only wrote {} of 1 byte", n),
                Err(e) => log::warn!("write(\"\\r\"): {}", e),
            }
        }

        let line = self.editor.read_line(prompt.as_deref().unwrap_or(""))?;
        self.clear_prompt();
        let Some(line) = line else {
            return Ok(0);
        };

        self.editor.add_history(&line);
        if let Ok(flags) = io.term_flags() {
            if let Err(e) = io.set_term_flags(TermFlags {
                echo: false,
                ..flags
            }) {
                log::warn!("cannot disable echo: {}", e);
            }
        }

        let bytes = line.as_bytes();
        let n = bytes.len().min(buf.len());
        buf[..n].copy_from_slice(&bytes[..n]);
        if n < buf.len() {
            buf[n] = b'\n';
            return Ok(n + 1);
        }
        Ok(n)
    }

    /// Write-observed hook: tracks the dynamic prompt.
    pub fn observe_write(&mut self, data: &[u8]) {
        if let Prompt::Dynamic(ring) = &mut self.prompt {
            ring.observe(data);
        }
    }

    /// True if the editor holds input `poll(2)` cannot see.
    pub fn has_buffered_input(&self) -> bool {
        self.editor.has_buffered_input()
    }

    /// Writes history back to the history file, if one was given.
    pub fn save_history(&self) {
        if let Some(path) = &self.history_file {
            if let Err(e) = self.editor.save_history(path) {
                log::warn!("write_history(\"{}\"): {}", path.display(), e);
            }
        }
    }

    fn echo_suppressed(&self) -> bool {
        match (&self.noecho, &self.prompt) {
            (Some(pattern), Prompt::Dynamic(ring)) => pattern.is_match(&ring.to_vec()),
            _ => false,
        }
    }

    fn clear_prompt(&mut self) {
        if let Prompt::Dynamic(ring) = &mut self.prompt {
            ring.clear();
        }
    }
}

/// One raw read in canonical mode with echo off; flags are restored on
/// every exit path.
fn read_without_echo(io: &mut dyn TermIo, buf: &mut [u8]) -> io::Result<usize> {
    let saved = match io.term_flags() {
        Ok(flags) => flags,
        Err(e) => {
            log::warn!("cannot query terminal settings: {}", e);
            return read_retrying(io, buf);
        }
    };
    io.set_term_flags(TermFlags {
        canonical: true,
        echo: false,
    })?;
    let mut io = scopeguard::guard(io, |io| {
        if let Err(e) = io.set_term_flags(saved) {
            log::warn!("cannot restore terminal settings: {}", e);
        }
    });
    read_retrying(&mut **io, buf)
}

/// A latched termination signal ends the wait with `Interrupted`.
fn read_retrying(io: &mut dyn TermIo, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        io.wait_input()?;
        match io.read_input(buf) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}
