//! Line editor used by the `readline` address.
//!
//! The line-editing hook only needs a handful of primitives, captured by
//! [`LineReader`]: read one edited line with a prompt, remember a line in
//! history, write the history back. Two implementations exist:
//!
//! - [`ConsoleEditor`] for an interactive terminal. Keys come from
//!   `crossterm` in raw mode; the line buffer and cursor are a
//!   [`tui_input::Input`].
//! - [`PipeLineReader`] when standard input is not a terminal. It reads
//!   fd 0 one byte at a time so nothing is held in a userspace buffer that
//!   `poll(2)` cannot see.
//!
//! # Key bindings
//!
//! | Key | Action |
//! |---|---|
//! | Enter | Submit the line |
//! | Ctrl-D | End of input on an empty line, otherwise delete forward |
//! | Ctrl-C | Discard the line |
//! | Up / Ctrl-P, Down / Ctrl-N | Walk history |
//! | Left, Right, Home, End, Ctrl-A/E/B/F | Move |
//! | Ctrl-Left/Right, Alt-B/F | Move by word |
//! | Backspace, Delete | Delete a character |
//! | Ctrl-W, Alt-Backspace, Alt-D | Delete a word |
//! | Ctrl-U, Ctrl-K | Delete line, delete to end |

// Rust guideline compliant 2026-02

use std::fmt;
use std::io::{self, Write};
use std::path::Path;

use crossterm::cursor::MoveToColumn;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::style::Print;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, Clear, ClearType};
use crossterm::queue;
use tui_input::{Input, InputRequest};

use crate::constants::{HISTORY_LIMIT, POLL_TICK};
use crate::terminal;

// ============================================================================
// History
// ============================================================================

/// Previously entered lines, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct History {
    entries: Vec<String>,
}

impl History {
    /// Loads one entry per line. A missing file is an empty history.
    pub fn load(path: &Path) -> io::Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e),
        };
        let mut history = Self::default();
        for line in text.lines() {
            history.push(line);
        }
        Ok(history)
    }

    /// Writes every entry, one per line.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let mut text = String::new();
        for entry in &self.entries {
            text.push_str(entry);
            text.push('\n');
        }
        std::fs::write(path, text)
    }

    /// Appends a line. Empty lines and repeats of the newest entry are
    /// skipped; the oldest entry is dropped beyond [`HISTORY_LIMIT`].
    pub fn push(&mut self, line: &str) {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() || self.entries.last().is_some_and(|last| last == line) {
            return;
        }
        if self.entries.len() == HISTORY_LIMIT {
            self.entries.remove(0);
        }
        self.entries.push(line.to_string());
    }

    /// All entries, oldest first.
    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// LineReader
// ============================================================================

/// Line-editing primitive.
pub trait LineReader: fmt::Debug {
    /// Shows `prompt` and reads one edited line, without its terminator.
    ///
    /// `Ok(None)` is end of input. `ErrorKind::Interrupted` means a signal
    /// arrived; the caller may retry.
    fn read_line(&mut self, prompt: &str) -> io::Result<Option<String>>;

    /// Records a line in history.
    fn add_history(&mut self, line: &str);

    /// Writes history to `path`.
    fn save_history(&self, path: &Path) -> io::Result<()>;

    /// True if input is already buffered inside the editor, where `poll(2)`
    /// on the descriptor would not report it.
    fn has_buffered_input(&self) -> bool {
        false
    }
}

/// Picks the editor for standard input.
pub fn for_stdin(history: History) -> Box<dyn LineReader> {
    if terminal::is_tty(libc::STDIN_FILENO) {
        Box::new(ConsoleEditor::new(history))
    } else {
        Box::new(PipeLineReader::new(history))
    }
}

// ============================================================================
// Editing state
// ============================================================================

/// What a key asks the editor to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyAction {
    Edit(InputRequest),
    Submit,
    EndOfInput,
    Discard,
    HistoryPrev,
    HistoryNext,
    Ignore,
}

fn key_action(key: KeyEvent) -> KeyAction {
    let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
    let alt = key.modifiers.contains(KeyModifiers::ALT);
    match key.code {
        KeyCode::Enter => KeyAction::Submit,
        KeyCode::Char('d') if ctrl => KeyAction::EndOfInput,
        KeyCode::Char('c') if ctrl => KeyAction::Discard,
        KeyCode::Char('a') if ctrl => KeyAction::Edit(InputRequest::GoToStart),
        KeyCode::Char('e') if ctrl => KeyAction::Edit(InputRequest::GoToEnd),
        KeyCode::Char('b') if ctrl => KeyAction::Edit(InputRequest::GoToPrevChar),
        KeyCode::Char('f') if ctrl => KeyAction::Edit(InputRequest::GoToNextChar),
        KeyCode::Char('w') if ctrl => KeyAction::Edit(InputRequest::DeletePrevWord),
        KeyCode::Char('u') if ctrl => KeyAction::Edit(InputRequest::DeleteLine),
        KeyCode::Char('k') if ctrl => KeyAction::Edit(InputRequest::DeleteTillEnd),
        KeyCode::Char('p') if ctrl => KeyAction::HistoryPrev,
        KeyCode::Char('n') if ctrl => KeyAction::HistoryNext,
        KeyCode::Char('b') if alt => KeyAction::Edit(InputRequest::GoToPrevWord),
        KeyCode::Char('f') if alt => KeyAction::Edit(InputRequest::GoToNextWord),
        KeyCode::Char('d') if alt => KeyAction::Edit(InputRequest::DeleteNextWord),
        KeyCode::Char(_) if ctrl || alt => KeyAction::Ignore,
        KeyCode::Char(c) => KeyAction::Edit(InputRequest::InsertChar(c)),
        KeyCode::Backspace if alt || ctrl => KeyAction::Edit(InputRequest::DeletePrevWord),
        KeyCode::Backspace => KeyAction::Edit(InputRequest::DeletePrevChar),
        KeyCode::Delete => KeyAction::Edit(InputRequest::DeleteNextChar),
        KeyCode::Left if ctrl => KeyAction::Edit(InputRequest::GoToPrevWord),
        KeyCode::Right if ctrl => KeyAction::Edit(InputRequest::GoToNextWord),
        KeyCode::Left => KeyAction::Edit(InputRequest::GoToPrevChar),
        KeyCode::Right => KeyAction::Edit(InputRequest::GoToNextChar),
        KeyCode::Home => KeyAction::Edit(InputRequest::GoToStart),
        KeyCode::End => KeyAction::Edit(InputRequest::GoToEnd),
        KeyCode::Up => KeyAction::HistoryPrev,
        KeyCode::Down => KeyAction::HistoryNext,
        _ => KeyAction::Ignore,
    }
}

/// Result of applying one key.
#[derive(Debug, PartialEq, Eq)]
enum Step {
    Continue,
    Submit(String),
    EndOfInput,
}

/// Line buffer plus history browsing position.
#[derive(Debug, Default)]
struct LineState {
    input: Input,
    /// Index of the history entry shown, while browsing.
    recall: Option<usize>,
    /// Line being typed before browsing started.
    draft: String,
}

impl LineState {
    fn apply(&mut self, action: KeyAction, history: &History) -> Step {
        match action {
            KeyAction::Submit => {
                let line = self.input.value().to_string();
                self.reset();
                return Step::Submit(line);
            }
            KeyAction::EndOfInput if self.input.value().is_empty() => return Step::EndOfInput,
            KeyAction::EndOfInput => {
                self.input.handle(InputRequest::DeleteNextChar);
            }
            KeyAction::Discard => self.reset(),
            KeyAction::Edit(request) => {
                self.input.handle(request);
            }
            KeyAction::HistoryPrev => self.recall_prev(history),
            KeyAction::HistoryNext => self.recall_next(history),
            KeyAction::Ignore => {}
        }
        Step::Continue
    }

    fn recall_prev(&mut self, history: &History) {
        let entries = history.entries();
        let index = match self.recall {
            None if entries.is_empty() => return,
            None => {
                self.draft = self.input.value().to_string();
                entries.len() - 1
            }
            Some(i) => i.saturating_sub(1),
        };
        self.recall = Some(index);
        self.input = Input::new(entries[index].clone());
    }

    fn recall_next(&mut self, history: &History) {
        let Some(i) = self.recall else {
            return;
        };
        if i + 1 < history.len() {
            self.recall = Some(i + 1);
            self.input = Input::new(history.entries()[i + 1].clone());
        } else {
            self.recall = None;
            self.input = Input::new(std::mem::take(&mut self.draft));
        }
    }

    fn reset(&mut self) {
        self.input.reset();
        self.recall = None;
        self.draft.clear();
    }
}

// ============================================================================
// ConsoleEditor
// ============================================================================

/// Disables raw mode when dropped, including on panic.
struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> io::Result<Self> {
        enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

/// Interactive editor on the controlling terminal.
#[derive(Debug)]
pub struct ConsoleEditor {
    history: History,
}

impl ConsoleEditor {
    /// Creates an editor seeded with `history`.
    pub fn new(history: History) -> Self {
        Self { history }
    }

    fn redraw(out: &mut impl Write, prompt: &str, input: &Input) -> io::Result<()> {
        let column = prompt.chars().count() + input.visual_cursor();
        queue!(
            out,
            MoveToColumn(0),
            Print(prompt),
            Print(input.value()),
            Clear(ClearType::UntilNewLine),
            MoveToColumn(u16::try_from(column).unwrap_or(u16::MAX)),
        )?;
        out.flush()
    }
}

impl LineReader for ConsoleEditor {
    fn read_line(&mut self, prompt: &str) -> io::Result<Option<String>> {
        let _raw = RawModeGuard::enable()?;
        let mut out = io::stdout();
        let mut state = LineState::default();
        Self::redraw(&mut out, prompt, &state.input)?;

        loop {
            if crate::signals::pending().is_some() {
                return Err(io::Error::from(io::ErrorKind::Interrupted));
            }
            if !event::poll(POLL_TICK)? {
                continue;
            }
            let action = match event::read()? {
                Event::Key(key) if key.kind != KeyEventKind::Release => key_action(key),
                Event::Paste(text) => {
                    for c in text.chars().filter(|c| !c.is_control()) {
                        state.apply(KeyAction::Edit(InputRequest::InsertChar(c)), &self.history);
                    }
                    KeyAction::Ignore
                }
                _ => KeyAction::Ignore,
            };
            match state.apply(action, &self.history) {
                Step::Continue => Self::redraw(&mut out, prompt, &state.input)?,
                Step::Submit(line) => {
                    queue!(out, Print("\r\n"))?;
                    out.flush()?;
                    return Ok(Some(line));
                }
                Step::EndOfInput => {
                    queue!(out, Print("\r\n"))?;
                    out.flush()?;
                    return Ok(None);
                }
            }
        }
    }

    fn add_history(&mut self, line: &str) {
        self.history.push(line);
    }

    fn save_history(&self, path: &Path) -> io::Result<()> {
        self.history.save(path)
    }

    fn has_buffered_input(&self) -> bool {
        event::poll(std::time::Duration::ZERO).unwrap_or(false)
    }
}

// ============================================================================
// PipeLineReader
// ============================================================================

/// Line reader for a non-terminal standard input.
#[derive(Debug)]
pub struct PipeLineReader {
    history: History,
    /// Bytes of a line interrupted by a signal.
    partial: Vec<u8>,
    eof: bool,
}

impl PipeLineReader {
    /// Creates a reader seeded with `history`.
    pub fn new(history: History) -> Self {
        Self {
            history,
            partial: Vec::new(),
            eof: false,
        }
    }
}

impl LineReader for PipeLineReader {
    fn read_line(&mut self, prompt: &str) -> io::Result<Option<String>> {
        if self.eof {
            return Ok(None);
        }
        if !prompt.is_empty() && self.partial.is_empty() {
            let mut out = io::stdout();
            out.write_all(prompt.as_bytes())?;
            out.flush()?;
        }
        loop {
            // Bytes read so far stay in `partial` for the retry.
            crate::signals::wait_readable(libc::STDIN_FILENO)?;
            let mut byte = 0u8;
            // SAFETY: reading one byte into a valid stack location. fd 0 is
            // read directly so no bytes hide in std's stdin buffer.
            let n = unsafe {
                libc::read(
                    libc::STDIN_FILENO,
                    std::ptr::from_mut(&mut byte).cast(),
                    1,
                )
            };
            match n {
                0 => {
                    self.eof = true;
                    if self.partial.is_empty() {
                        return Ok(None);
                    }
                    break;
                }
                n if n < 0 => {
                    let e = io::Error::last_os_error();
                    if e.kind() == io::ErrorKind::Interrupted {
                        continue;
                    }
                    return Err(e);
                }
                _ if byte == b'\n' => break,
                _ => self.partial.push(byte),
            }
        }
        let line = String::from_utf8_lossy(&self.partial)
            .trim_end_matches('\r')
            .to_string();
        self.partial.clear();
        Ok(Some(line))
    }

    fn add_history(&mut self, line: &str) {
        self.history.push(line);
    }

    fn save_history(&self, path: &Path) -> io::Result<()> {
        self.history.save(path)
    }
}
