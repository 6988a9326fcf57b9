//! Relay configuration.
//!
//! Built once at startup from the command line, with environment variable
//! overrides applied on top (see [`RelayConfig::apply_env_overrides`]).
//! Diagnostics have their own configuration in [`crate::diag::DiagConfig`].

use std::time::Duration;

use crate::constants::{DEFAULT_BUFFER_SIZE, DEFAULT_HALF_CLOSE_TIMEOUT, MAX_BUFFER_SIZE};

/// Which directions the relay moves data in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Flow {
    /// Both directions (default).
    #[default]
    Both,
    /// Only from the first address to the second (`-u`).
    LeftToRight,
    /// Only from the second address to the first (`-U`).
    RightToLeft,
}

impl Flow {
    /// Whether data read from the first address is forwarded.
    pub fn left_to_right(self) -> bool {
        matches!(self, Self::Both | Self::LeftToRight)
    }

    /// Whether data read from the second address is forwarded.
    pub fn right_to_left(self) -> bool {
        matches!(self, Self::Both | Self::RightToLeft)
    }
}

/// Tunables for one relay run.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Bytes read per hook call, per direction.
    pub buffer_size: usize,
    /// Directions to relay.
    pub flow: Flow,
    /// Time to keep going after the first direction finished. `None` waits
    /// for both directions.
    pub half_close_timeout: Option<Duration>,
    /// Stop when no data moved for this long. `None` disables it.
    pub idle_timeout: Option<Duration>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            flow: Flow::Both,
            half_close_timeout: Some(DEFAULT_HALF_CLOSE_TIMEOUT),
            idle_timeout: None,
        }
    }
}

impl RelayConfig {
    /// Applies environment variable overrides.
    ///
    /// - `TWOWAY_BUFSIZE`: transfer buffer size in bytes
    ///
    /// Invalid values are ignored with a warning.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("TWOWAY_BUFSIZE") {
            match parse_buffer_size(&value) {
                Some(size) => self.buffer_size = size,
                None => log::warn!("ignoring invalid TWOWAY_BUFSIZE \"{}\"", value),
            }
        }
    }
}

/// Parses a buffer size, accepting `1..=MAX_BUFFER_SIZE`.
pub fn parse_buffer_size(value: &str) -> Option<usize> {
    value
        .trim()
        .parse::<usize>()
        .ok()
        .filter(|size| (1..=MAX_BUFFER_SIZE).contains(size))
}

/// Parses a timeout given in (possibly fractional) seconds. `0` disables it.
pub fn parse_seconds(value: &str) -> Option<Option<Duration>> {
    let secs: f64 = value.trim().parse().ok()?;
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    if secs == 0.0 {
        Some(None)
    } else {
        Duration::try_from_secs_f64(secs).ok().map(Some)
    }
}
