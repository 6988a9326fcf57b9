//! Termination signal latch.
//!
//! SIGINT, SIGTERM and SIGHUP only store their number in an atomic; the
//! relay loop and the line editor look at it at their loop boundaries and
//! unwind from there, so endpoints are closed and terminals restored on the
//! normal path.

use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::flag;

use crate::constants::POLL_TICK;

static INSTALLED: OnceLock<ShutdownSignal> = OnceLock::new();

/// Shared "a termination signal arrived" latch.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    latch: Arc<AtomicUsize>,
}

impl ShutdownSignal {
    /// A latch not connected to any signal (raised by hand in tests).
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers SIGINT, SIGTERM and SIGHUP with the process-wide latch.
    ///
    /// Installing twice returns the same latch.
    pub fn install() -> io::Result<Self> {
        if let Some(installed) = INSTALLED.get() {
            return Ok(installed.clone());
        }
        let signal = Self::new();
        for signo in [SIGINT, SIGTERM, SIGHUP] {
            flag::register_usize(signo, Arc::clone(&signal.latch), signo as usize)?;
        }
        Ok(INSTALLED.get_or_init(|| signal).clone())
    }

    /// Number of the latched signal, if any.
    pub fn pending(&self) -> Option<i32> {
        match self.latch.load(Ordering::SeqCst) {
            0 => None,
            signo => Some(signo as i32),
        }
    }

    /// Latches `signo` as if it had been delivered.
    pub fn raise(&self, signo: i32) {
        self.latch.store(signo as usize, Ordering::SeqCst);
    }
}

/// Latched signal of the installed handler, if any.
pub fn pending() -> Option<i32> {
    INSTALLED.get().and_then(ShutdownSignal::pending)
}

/// Blocks until `fd` is readable (or hung up).
///
/// The handlers are installed with `SA_RESTART`, so a blocking `read(2)`
/// would never see `EINTR`. Waiting in `poll(2)` with [`POLL_TICK`] lets
/// the latch be checked instead: once a signal is latched this fails with
/// `ErrorKind::Interrupted`.
pub fn wait_readable(fd: RawFd) -> io::Result<()> {
    wait_readable_with(fd, pending)
}

fn wait_readable_with(fd: RawFd, latched: impl Fn() -> Option<i32>) -> io::Result<()> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let tick = libc::c_int::try_from(POLL_TICK.as_millis()).unwrap_or(libc::c_int::MAX);
    loop {
        if let Some(signo) = latched() {
            return Err(io::Error::new(
                io::ErrorKind::Interrupted,
                format!("signal {signo}"),
            ));
        }
        // SAFETY: `pfd` is a single valid pollfd.
        let rc = unsafe { libc::poll(&mut pfd, 1, tick) };
        if rc < 0 {
            let e = io::Error::last_os_error();
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e);
        }
        if rc > 0 {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    use super::*;

    #[test]
    fn test_manual_latch() {
        let signal = ShutdownSignal::new();
        assert_eq!(signal.pending(), None);
        let clone = signal.clone();
        clone.raise(SIGTERM);
        assert_eq!(signal.pending(), Some(SIGTERM));
    }

    #[test]
    fn test_wait_readable_returns_once_data_arrives() {
        let (ours, mut theirs) = UnixStream::pair().unwrap();
        theirs.write_all(b"x").unwrap();
        wait_readable_with(ours.as_raw_fd(), || None).unwrap();
    }

    #[test]
    fn test_wait_readable_gives_up_on_latched_signal() {
        let (ours, _theirs) = UnixStream::pair().unwrap();
        let signal = ShutdownSignal::new();
        let latch = signal.clone();
        let raiser = std::thread::spawn(move || {
            std::thread::sleep(POLL_TICK / 2);
            latch.raise(SIGTERM);
        });

        let err = wait_readable_with(ours.as_raw_fd(), || signal.pending()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
        raiser.join().unwrap();
    }
}
