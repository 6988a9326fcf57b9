//! The relay engine: moves bytes between two endpoints until both
//! directions are done.
//!
//! One thread owns both endpoints and multiplexes their descriptors with
//! `poll(2)`. Each direction ("lane") keeps its own pending buffer, so
//! bytes read from a source wait there until the destination accepts them
//! and a slow destination never stalls the other direction.
//!
//! # Loop boundary
//!
//! Every iteration first checks, in order: a latched termination signal, a
//! latched fatal diagnostic, whether every lane is done, the half-close
//! timeout and the idle timeout. The wait itself is bounded by
//! [`POLL_TICK`] so these checks run even when no descriptor is ready.
//!
//! # Half-close
//!
//! End of input (or a read error) on a source ends reading on that lane.
//! Once its pending bytes are flushed, the destination's write half is shut
//! down per its policy, which is how the peer learns there is no more data.

use std::io;
use std::time::Instant;

use thiserror::Error;

use crate::config::RelayConfig;
use crate::constants::POLL_TICK;
use crate::diag::{self, Fatal};
use crate::endpoint::Endpoint;
use crate::signals::ShutdownSignal;

const LEFT: usize = 0;
const RIGHT: usize = 1;

/// How a relay run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Every direction reached end of input and was flushed.
    Completed,
    /// One direction finished and the other did not within the half-close
    /// timeout.
    HalfCloseTimeout,
    /// No data moved for the idle timeout.
    IdleTimeout,
    /// A termination signal arrived.
    Signalled(i32),
}

/// Failure that ends a relay run.
#[derive(Debug, Error)]
pub enum RelayError {
    /// A diagnostic at or above the exit severity was logged.
    #[error(transparent)]
    Fatal(#[from] Fatal),
    /// `poll(2)` itself failed.
    #[error("poll: {0}")]
    Poll(#[source] io::Error),
}

/// One direction of the relay.
#[derive(Debug)]
struct Lane {
    from: usize,
    to: usize,
    pending: Vec<u8>,
    offset: usize,
    read_done: bool,
    done: bool,
}

impl Lane {
    fn new(from: usize, to: usize) -> Self {
        Self {
            from,
            to,
            pending: Vec::new(),
            offset: 0,
            read_done: false,
            done: false,
        }
    }

    fn has_pending(&self) -> bool {
        self.offset < self.pending.len()
    }
}

/// What a lane waits for in one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wait {
    Readable,
    Writable,
}

/// Drives two endpoints to completion.
#[derive(Debug)]
pub struct Relay {
    endpoints: [Endpoint; 2],
    lanes: Vec<Lane>,
    config: RelayConfig,
    buf: Vec<u8>,
    last_activity: Instant,
    first_done: Option<Instant>,
}

impl Relay {
    /// Creates a relay between `left` and `right`.
    pub fn new(left: Endpoint, right: Endpoint, config: RelayConfig) -> Self {
        let mut lanes = Vec::with_capacity(2);
        if config.flow.left_to_right() {
            lanes.push(Lane::new(LEFT, RIGHT));
        }
        if config.flow.right_to_left() {
            lanes.push(Lane::new(RIGHT, LEFT));
        }
        Self {
            endpoints: [left, right],
            lanes,
            buf: vec![0; config.buffer_size.max(1)],
            config,
            last_activity: Instant::now(),
            first_done: None,
        }
    }

    /// Runs until termination, then closes both endpoints.
    pub fn run(&mut self, signal: &ShutdownSignal) -> Result<RelayOutcome, RelayError> {
        let result = self.run_loop(signal);
        match &result {
            Ok(outcome) => log::debug!("relay finished: {:?}", outcome),
            Err(e) => log::debug!("relay aborted: {}", e),
        }
        for endpoint in &mut self.endpoints {
            endpoint.close();
        }
        result
    }

    /// The endpoints, left first.
    pub fn endpoints(&self) -> &[Endpoint; 2] {
        &self.endpoints
    }

    fn run_loop(&mut self, signal: &ShutdownSignal) -> Result<RelayOutcome, RelayError> {
        loop {
            if let Some(outcome) = self.check_boundary(signal)? {
                return Ok(outcome);
            }

            let mut pollfds = Vec::with_capacity(self.lanes.len());
            let mut waiting = Vec::with_capacity(self.lanes.len());
            let mut ready = Vec::new();
            for index in 0..self.lanes.len() {
                match self.prepare(index) {
                    Some((_, Wait::Readable)) if self.source_buffered(index) => ready.push(index),
                    Some((fd, wait)) => {
                        let events = match wait {
                            Wait::Readable => libc::POLLIN,
                            Wait::Writable => libc::POLLOUT,
                        };
                        pollfds.push(libc::pollfd {
                            fd,
                            events,
                            revents: 0,
                        });
                        waiting.push(index);
                    }
                    None => {}
                }
            }

            let timeout = if ready.is_empty() {
                libc::c_int::try_from(POLL_TICK.as_millis()).unwrap_or(libc::c_int::MAX)
            } else {
                0
            };
            // SAFETY: `pollfds` is a valid, exclusively borrowed array of its length.
            let rc = unsafe {
                libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout)
            };
            if rc < 0 {
                let e = io::Error::last_os_error();
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(RelayError::Poll(e));
            }
            for (pfd, index) in pollfds.iter().zip(waiting) {
                if pfd.revents != 0 {
                    ready.push(index);
                }
            }
            for index in ready {
                self.service(index);
            }
        }
    }

    /// Checks run before every wait. `Some` ends the run.
    fn check_boundary(
        &mut self,
        signal: &ShutdownSignal,
    ) -> Result<Option<RelayOutcome>, RelayError> {
        if let Some(signo) = signal.pending() {
            log::info!("terminating on signal {}", signo);
            return Ok(Some(RelayOutcome::Signalled(signo)));
        }
        if let Some(fatal) = diag::take_fatal() {
            return Err(fatal.into());
        }
        if self.lanes.iter().all(|lane| lane.done) {
            return Ok(Some(RelayOutcome::Completed));
        }
        if let (Some(limit), Some(first)) = (self.config.half_close_timeout, self.first_done) {
            if first.elapsed() >= limit {
                log::info!("half-close timeout: closing the remaining direction");
                return Ok(Some(RelayOutcome::HalfCloseTimeout));
            }
        }
        if let Some(limit) = self.config.idle_timeout {
            if self.last_activity.elapsed() >= limit {
                log::info!("no data for {:?}: terminating", limit);
                return Ok(Some(RelayOutcome::IdleTimeout));
            }
        }
        Ok(None)
    }

    /// Decides what lane `index` waits for, finishing it if nothing is left.
    fn prepare(&mut self, index: usize) -> Option<(libc::c_int, Wait)> {
        let lane = &self.lanes[index];
        if lane.done {
            return None;
        }
        if lane.has_pending() {
            match self.endpoints[lane.to].write_fd() {
                Some(fd) => return Some((fd, Wait::Writable)),
                None => {
                    log::warn!(
                        "{}: output closed, dropping {} bytes",
                        self.endpoints[lane.to].label(),
                        lane.pending.len() - lane.offset
                    );
                    self.finish_lane(index, false);
                    return None;
                }
            }
        }
        if !lane.read_done {
            if let Some(fd) = self.endpoints[lane.from].read_fd() {
                return Some((fd, Wait::Readable));
            }
            self.endpoints[lane.from].mark_read_eof();
        }
        self.finish_lane(index, true);
        None
    }

    fn source_buffered(&self, index: usize) -> bool {
        self.endpoints[self.lanes[index].from].has_buffered_input()
    }

    /// Marks lane `index` done, shutting the destination's write half if
    /// the lane ended in an orderly way.
    fn finish_lane(&mut self, index: usize, orderly: bool) {
        let lane = &mut self.lanes[index];
        lane.done = true;
        lane.pending.clear();
        lane.offset = 0;
        if orderly {
            self.endpoints[lane.to].shutdown_write();
        }
        if self.first_done.is_none() {
            self.first_done = Some(Instant::now());
        }
        log::debug!(
            "{} -> {}: direction finished",
            self.endpoints[lane.from].label(),
            self.endpoints[lane.to].label()
        );
    }

    /// Moves data on a lane whose descriptor is ready.
    fn service(&mut self, index: usize) {
        if self.lanes[index].has_pending() {
            self.flush(index);
        } else {
            self.fill(index);
        }
    }

    fn fill(&mut self, index: usize) {
        let lane = &mut self.lanes[index];
        let source = &mut self.endpoints[lane.from];
        match source.read(&mut self.buf) {
            Ok(0) => {
                log::debug!("{}: end of input", source.label());
                source.mark_read_eof();
                lane.read_done = true;
            }
            Ok(n) => {
                log::trace!("{}: read {} bytes", source.label(), n);
                lane.pending.extend_from_slice(&self.buf[..n]);
                self.last_activity = Instant::now();
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
                ) => {}
            Err(e) => {
                log::warn!("{}: read: {}", source.label(), e);
                source.mark_read_eof();
                lane.read_done = true;
            }
        }
    }

    fn flush(&mut self, index: usize) {
        let lane = &mut self.lanes[index];
        let destination = &mut self.endpoints[lane.to];
        match destination.write(&lane.pending[lane.offset..]) {
            Ok(n) => {
                log::trace!("{}: wrote {} bytes", destination.label(), n);
                lane.offset += n;
                if lane.offset == lane.pending.len() {
                    lane.pending.clear();
                    lane.offset = 0;
                }
                if n > 0 {
                    self.last_activity = Instant::now();
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
                ) => {}
            Err(e) => {
                log::warn!("{}: write: {}", destination.label(), e);
                self.finish_lane(index, false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::Shutdown;
    use std::os::fd::OwnedFd;
    use std::os::unix::net::UnixStream;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::config::Flow;
    use crate::editor::scripted::ScriptedReader;
    use crate::endpoint::{Descriptors, Handle, ShutdownPolicy, ShutdownState};
    use crate::hook::line_edit::Prompt;
    use crate::hook::{Behavior, LineEdit};

    fn socket_endpoint(label: &str) -> (Endpoint, UnixStream) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        (Endpoint::from_socket(label, ours), theirs)
    }

    fn waiting_config() -> RelayConfig {
        RelayConfig {
            half_close_timeout: None,
            idle_timeout: Some(Duration::from_secs(10)),
            ..RelayConfig::default()
        }
    }

    #[test]
    fn test_pending_bytes_flushed_before_half_close() {
        let (left, mut left_peer) = socket_endpoint("left");
        let (right, mut right_peer) = socket_endpoint("right");

        left_peer.write_all(&[0x5a; 200]).unwrap();
        left_peer.shutdown(Shutdown::Write).unwrap();
        right_peer.shutdown(Shutdown::Write).unwrap();

        let mut relay = Relay::new(left, right, waiting_config());
        let outcome = relay.run(&ShutdownSignal::new()).unwrap();
        assert_eq!(outcome, RelayOutcome::Completed);

        let mut got = Vec::new();
        right_peer.read_to_end(&mut got).unwrap();
        assert_eq!(got, vec![0x5a; 200]);
        let mut back = Vec::new();
        left_peer.read_to_end(&mut back).unwrap();
        assert!(back.is_empty());
    }

    #[test]
    fn test_large_transfer_both_directions() {
        const SIZE: usize = 1 << 20;
        let (left, mut left_peer) = socket_endpoint("left");
        let (right, mut right_peer) = socket_endpoint("right");
        let payload: Vec<u8> = (0..SIZE).map(|i| (i % 251) as u8).collect();

        let mut left_writer = left_peer.try_clone().unwrap();
        let expected = payload.clone();
        let writer = thread::spawn(move || {
            left_writer.write_all(&payload).unwrap();
            left_writer.shutdown(Shutdown::Write).unwrap();
        });
        let mut right_writer = right_peer.try_clone().unwrap();
        let echo = thread::spawn(move || {
            right_writer.write_all(b"reply").unwrap();
            right_writer.shutdown(Shutdown::Write).unwrap();
        });
        let reader = thread::spawn(move || {
            let mut got = Vec::new();
            right_peer.read_to_end(&mut got).unwrap();
            got
        });

        let config = RelayConfig {
            buffer_size: 4096,
            ..waiting_config()
        };
        let outcome = Relay::new(left, right, config).run(&ShutdownSignal::new()).unwrap();
        assert_eq!(outcome, RelayOutcome::Completed);

        writer.join().unwrap();
        echo.join().unwrap();
        assert_eq!(reader.join().unwrap(), expected);
        let mut back = Vec::new();
        left_peer.read_to_end(&mut back).unwrap();
        assert_eq!(back, b"reply");
    }

    #[test]
    fn test_unidirectional_flow() {
        let (left, mut left_peer) = socket_endpoint("left");
        let (right, mut right_peer) = socket_endpoint("right");
        right_peer.write_all(b"ignored").unwrap();
        left_peer.write_all(b"forward").unwrap();
        left_peer.shutdown(Shutdown::Write).unwrap();

        let config = RelayConfig {
            flow: Flow::LeftToRight,
            ..waiting_config()
        };
        let outcome = Relay::new(left, right, config).run(&ShutdownSignal::new()).unwrap();
        assert_eq!(outcome, RelayOutcome::Completed);

        let mut got = Vec::new();
        right_peer.read_to_end(&mut got).unwrap();
        assert_eq!(got, b"forward");
    }

    #[test]
    fn test_half_close_timeout() {
        let (left, left_peer) = socket_endpoint("left");
        let (right, _right_peer) = socket_endpoint("right");
        left_peer.shutdown(Shutdown::Write).unwrap();

        let config = RelayConfig {
            half_close_timeout: Some(Duration::from_millis(100)),
            ..RelayConfig::default()
        };
        let outcome = Relay::new(left, right, config).run(&ShutdownSignal::new()).unwrap();
        assert_eq!(outcome, RelayOutcome::HalfCloseTimeout);
    }

    #[test]
    fn test_idle_timeout() {
        let (left, _left_peer) = socket_endpoint("left");
        let (right, _right_peer) = socket_endpoint("right");
        let config = RelayConfig {
            idle_timeout: Some(Duration::from_millis(150)),
            ..RelayConfig::default()
        };
        let start = Instant::now();
        let outcome = Relay::new(left, right, config).run(&ShutdownSignal::new()).unwrap();
        assert_eq!(outcome, RelayOutcome::IdleTimeout);
        assert!(start.elapsed() >= Duration::from_millis(150));
    }

    #[test]
    fn test_signal_closes_both_endpoints() {
        let (left, mut left_peer) = socket_endpoint("left");
        let (right, mut right_peer) = socket_endpoint("right");
        let signal = ShutdownSignal::new();
        signal.raise(libc::SIGTERM);

        let mut relay = Relay::new(left, right, RelayConfig::default());
        assert_eq!(relay.run(&signal).unwrap(), RelayOutcome::Signalled(libc::SIGTERM));
        assert!(relay
            .endpoints()
            .iter()
            .all(|e| e.state() == ShutdownState::Closed));

        let mut rest = Vec::new();
        assert_eq!(left_peer.read_to_end(&mut rest).unwrap(), 0);
        assert_eq!(right_peer.read_to_end(&mut rest).unwrap(), 0);
    }

    #[test]
    fn test_write_error_ends_only_that_direction() {
        let (left, mut left_peer) = socket_endpoint("left");
        let (right, right_peer) = socket_endpoint("right");
        drop(right_peer);
        left_peer.write_all(b"nobody listens").unwrap();

        let outcome = Relay::new(left, right, RelayConfig::default())
            .run(&ShutdownSignal::new())
            .unwrap();
        assert!(matches!(
            outcome,
            RelayOutcome::Completed | RelayOutcome::HalfCloseTimeout
        ));
    }

    /// Console on the left with a static prompt, a responder on the right
    /// that answers each line in upper case.
    #[test]
    fn test_line_editing_console_against_responder() {
        let script = ScriptedReader::new([
            Ok(Some("hello".to_string())),
            Ok(Some("world".to_string())),
            Ok(None),
        ]);
        let (console_in, _console_in_peer) = UnixStream::pair().unwrap();
        let (console_out, mut screen) = UnixStream::pair().unwrap();
        let console = Endpoint::new(
            "readline",
            Descriptors::pair(
                Handle::Owned(OwnedFd::from(console_in)),
                Handle::Owned(OwnedFd::from(console_out)),
            ),
        )
        .with_shutdown(ShutdownPolicy::CloseWrite)
        .with_behavior(Behavior::LineEdit(Box::new(LineEdit::new(
            Prompt::Static("> ".to_string()),
            None,
            None,
            Box::new(script.clone()),
        ))));

        let (responder_end, responder) = UnixStream::pair().unwrap();
        let responder = thread::spawn(move || {
            let mut output = responder.try_clone().unwrap();
            for line in BufReader::new(responder).lines() {
                let line = line.unwrap();
                writeln!(output, "{}", line.to_uppercase()).unwrap();
            }
        });
        let peer = Endpoint::from_socket("responder", responder_end);

        let outcome = Relay::new(console, peer, waiting_config())
            .run(&ShutdownSignal::new())
            .unwrap();
        assert_eq!(outcome, RelayOutcome::Completed);
        responder.join().unwrap();

        let mut shown = Vec::new();
        screen.read_to_end(&mut shown).unwrap();
        let shown: Vec<u8> = shown.into_iter().filter(|&b| b != b'\r').collect();
        assert_eq!(shown, b"HELLO\nWORLD\n");
        assert_eq!(script.prompts(), ["> ", "> ", "> "]);
        assert_eq!(script.history(), ["hello", "world"]);
    }
}
