//! Terminal attribute control for terminal-backed endpoints.
//!
//! Thin wrappers over `tcgetattr`/`tcsetattr`. The line-editing hook only
//! ever needs two local-mode bits (canonical input and echo), which are
//! exposed as [`TermFlags`] so the hook can be tested without a real tty.
//! [`TtySnapshot`] captures the full attribute block so an endpoint can put
//! the terminal back exactly as it found it.

// Rust guideline compliant 2026-02

use std::io;
use std::mem::MaybeUninit;
use std::os::fd::RawFd;

/// The local-mode bits the line-editing hook toggles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TermFlags {
    /// `ICANON`: line-buffered input processed by the kernel.
    pub canonical: bool,
    /// `ECHO`: the kernel echoes typed characters.
    pub echo: bool,
}

/// Returns true if `fd` refers to a terminal.
pub fn is_tty(fd: RawFd) -> bool {
    // SAFETY: isatty only inspects the descriptor number.
    unsafe { libc::isatty(fd) == 1 }
}

fn get_attrs(fd: RawFd) -> io::Result<libc::termios> {
    let mut attrs = MaybeUninit::<libc::termios>::uninit();
    // SAFETY: tcgetattr fully initializes `attrs` when it returns 0.
    let rc = unsafe { libc::tcgetattr(fd, attrs.as_mut_ptr()) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: checked rc above.
    Ok(unsafe { attrs.assume_init() })
}

fn set_attrs(fd: RawFd, attrs: &libc::termios) -> io::Result<()> {
    // SAFETY: `attrs` is a valid termios obtained from tcgetattr.
    let rc = unsafe { libc::tcsetattr(fd, libc::TCSANOW, attrs) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Reads the canonical/echo bits of `fd`.
pub fn flags(fd: RawFd) -> io::Result<TermFlags> {
    let attrs = get_attrs(fd)?;
    Ok(TermFlags {
        canonical: attrs.c_lflag & libc::ICANON != 0,
        echo: attrs.c_lflag & libc::ECHO != 0,
    })
}

/// Sets the canonical/echo bits of `fd`, leaving every other attribute alone.
pub fn set_flags(fd: RawFd, flags: TermFlags) -> io::Result<()> {
    let mut attrs = get_attrs(fd)?;
    set_bit(&mut attrs.c_lflag, libc::ICANON, flags.canonical);
    set_bit(&mut attrs.c_lflag, libc::ECHO, flags.echo);
    set_attrs(fd, &attrs)
}

/// Sets a single local-mode bit (`libc::ECHO`, `libc::ICANON`, ...).
pub fn set_local_flag(fd: RawFd, flag: libc::tcflag_t, on: bool) -> io::Result<()> {
    let mut attrs = get_attrs(fd)?;
    set_bit(&mut attrs.c_lflag, flag, on);
    set_attrs(fd, &attrs)
}

/// Puts `fd` into raw mode (`cfmakeraw`).
pub fn make_raw(fd: RawFd) -> io::Result<()> {
    let mut attrs = get_attrs(fd)?;
    // SAFETY: cfmakeraw only modifies the struct it is given.
    unsafe { libc::cfmakeraw(&mut attrs) };
    set_attrs(fd, &attrs)
}

fn set_bit(field: &mut libc::tcflag_t, bit: libc::tcflag_t, on: bool) {
    if on {
        *field |= bit;
    } else {
        *field &= !bit;
    }
}

/// Saved terminal attributes of one descriptor.
///
/// Restoring does not take ownership of the descriptor; the endpoint that
/// took the snapshot restores it before closing.
#[derive(Clone, Copy)]
pub struct TtySnapshot {
    fd: RawFd,
    attrs: libc::termios,
}

impl std::fmt::Debug for TtySnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtySnapshot").field("fd", &self.fd).finish_non_exhaustive()
    }
}

impl TtySnapshot {
    /// Captures the current attributes of `fd`.
    pub fn save(fd: RawFd) -> io::Result<Self> {
        Ok(Self {
            fd,
            attrs: get_attrs(fd)?,
        })
    }

    /// Writes the captured attributes back.
    pub fn restore(&self) -> io::Result<()> {
        set_attrs(self.fd, &self.attrs)
    }

    /// Descriptor the snapshot belongs to.
    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn test_set_bit() {
        let mut field: libc::tcflag_t = 0;
        set_bit(&mut field, libc::ECHO, true);
        assert_ne!(field & libc::ECHO, 0);
        set_bit(&mut field, libc::ECHO, false);
        assert_eq!(field, 0);
    }

    #[test]
    fn test_non_tty_reports_error() {
        let file = tempfile::tempfile().unwrap();
        assert!(!is_tty(file.as_raw_fd()));
        assert!(flags(file.as_raw_fd()).is_err());
        assert!(TtySnapshot::save(file.as_raw_fd()).is_err());
    }
}
