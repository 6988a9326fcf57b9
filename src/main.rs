//! twoway - relays bytes between two addresses.
//!
//! This is the binary entry point. See the `twoway` library for the
//! address registry, endpoints and the relay loop.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use mimalloc::MiMalloc;
use twoway::config::{parse_buffer_size, parse_seconds};
use twoway::diag::{self, DiagConfig, Diagnostics, Facility, Severity};
use twoway::terminal::{self, TtySnapshot};
use twoway::{resolve_and_open, Direction, Flow, Relay, RelayConfig, RelayError, RelayOutcome};
use twoway::{OpenError, ShutdownSignal};

/// Global allocator configured per M-MIMALLOC-APPS guideline.
/// mimalloc provides better multi-threaded performance than the system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// A timeout in seconds; `0` disables it.
#[derive(Debug, Clone, Copy)]
struct Seconds(Option<Duration>);

fn seconds(value: &str) -> Result<Seconds, String> {
    parse_seconds(value)
        .map(Seconds)
        .ok_or_else(|| format!("invalid number of seconds \"{value}\""))
}

fn buffer_size(value: &str) -> Result<usize, String> {
    parse_buffer_size(value).ok_or_else(|| format!("invalid buffer size \"{value}\""))
}

#[derive(Parser, Debug)]
#[command(name = "twoway")]
#[command(version, about = "Relay bytes between two addresses", long_about = None)]
struct Cli {
    /// Show one more level of diagnostics (repeatable)
    #[arg(short = 'd', action = ArgAction::Count)]
    debug: u8,

    /// Lowest severity shown: debug, info, notice, warning, error, fatal (or 0-5)
    #[arg(short = 'D', value_name = "LEVEL")]
    min_severity: Option<Severity>,

    /// Severity at which the program exits
    #[arg(short = 'e', value_name = "LEVEL")]
    exit_severity: Option<Severity>,

    /// Exit status used when a diagnostic ends the program
    #[arg(short = 'x', value_name = "STATUS")]
    exit_status: Option<i32>,

    /// Append diagnostics to FILE instead of standard error
    #[arg(short = 'L', value_name = "FILE")]
    log_file: Option<PathBuf>,

    /// Send diagnostics to syslog; `-y=FACILITY` picks the facility (default: daemon)
    #[arg(
        short = 'y',
        value_name = "FACILITY",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "daemon"
    )]
    syslog: Option<String>,

    /// Keep going after errors; only fatal diagnostics end the program
    #[arg(short = 's')]
    sloppy: bool,

    /// Only relay from the first address to the second
    #[arg(short = 'u', conflicts_with = "reverse")]
    forward: bool,

    /// Only relay from the second address to the first
    #[arg(short = 'U')]
    reverse: bool,

    /// Transfer buffer size in bytes
    #[arg(short = 'b', value_name = "SIZE", value_parser = buffer_size)]
    buffer_size: Option<usize>,

    /// Seconds to wait for the other direction after one has ended (0: wait forever)
    #[arg(short = 't', value_name = "SECS", value_parser = seconds)]
    half_close_timeout: Option<Seconds>,

    /// Stop after SECS without data (0: never)
    #[arg(short = 'T', value_name = "SECS", value_parser = seconds)]
    idle_timeout: Option<Seconds>,

    /// Prefix diagnostics with the host name
    #[arg(long)]
    hostname: bool,

    /// Add microseconds to diagnostic timestamps
    #[arg(long)]
    micros: bool,

    /// Program name shown in diagnostics
    #[arg(short = 'P', value_name = "NAME")]
    progname: Option<String>,

    /// First address, e.g. `-`, `readline`, `tcp:host:port`
    address1: String,

    /// Second address
    address2: String,
}

impl Cli {
    fn flow(&self) -> Flow {
        if self.forward {
            Flow::LeftToRight
        } else if self.reverse {
            Flow::RightToLeft
        } else {
            Flow::Both
        }
    }

    fn diag_config(&self) -> Result<DiagConfig> {
        let mut config = DiagConfig::default();
        config.apply_env_overrides();
        if let Some(name) = &self.progname {
            config.progname.clone_from(name);
        }
        let mut min = self.min_severity.unwrap_or(config.min_severity);
        for _ in 0..self.debug {
            min = min.lower();
        }
        config.min_severity = min;
        if let Some(level) = self.exit_severity {
            config.exit_severity = level;
        }
        if self.sloppy {
            config.exit_severity = Severity::Critical;
        }
        if let Some(status) = self.exit_status {
            config.exit_status = status;
        }
        if let Some(path) = &self.log_file {
            config.log_file = Some(path.clone());
            config.stderr = false;
        }
        if let Some(name) = &self.syslog {
            let facility = Facility::from_name(name)
                .with_context(|| format!("unknown syslog facility \"{name}\""))?;
            config.syslog = Some(facility);
            config.stderr = false;
        }
        config.with_hostname = self.hostname;
        config.micros = self.micros;
        Ok(config)
    }

    fn relay_config(&self) -> RelayConfig {
        let mut config = RelayConfig::default();
        config.apply_env_overrides();
        if let Some(size) = self.buffer_size {
            config.buffer_size = size;
        }
        if let Some(Seconds(timeout)) = self.half_close_timeout {
            config.half_close_timeout = timeout;
        }
        if let Some(Seconds(timeout)) = self.idle_timeout {
            config.idle_timeout = timeout;
        }
        config.flow = self.flow();
        config
    }
}

/// Directions the two addresses are opened for.
fn directions(flow: Flow) -> (Direction, Direction) {
    match flow {
        Flow::Both => (Direction::ReadWrite, Direction::ReadWrite),
        Flow::LeftToRight => (Direction::ReadOnly, Direction::WriteOnly),
        Flow::RightToLeft => (Direction::WriteOnly, Direction::ReadOnly),
    }
}

/// Exit status after an address failed to open.
fn open_failed(diag: &Diagnostics, signal: &ShutdownSignal, error: &OpenError) -> i32 {
    if let Some(signo) = signal.pending() {
        log::info!("terminating on signal {}", signo);
        diag.exit_notice(signo);
        return signo;
    }
    log::error!("{}", error);
    let status = diag
        .take_fatal()
        .map_or_else(|| diag.exit_status(), |fatal| fatal.status);
    diag.exit_notice(status);
    status
}

fn run(cli: &Cli) -> Result<i32> {
    let diag = diag::init(cli.diag_config()?).context("cannot set up diagnostics")?;
    let signal = ShutdownSignal::install().context("cannot install signal handlers")?;
    let config = cli.relay_config();
    log::debug!("relay configuration: {:?}", config);

    let (left_dir, right_dir) = directions(config.flow);
    let left = match resolve_and_open(&cli.address1, left_dir) {
        Ok(endpoint) => endpoint,
        Err(e) => return Ok(open_failed(diag, &signal, &e)),
    };
    let right = match resolve_and_open(&cli.address2, right_dir) {
        Ok(endpoint) => endpoint,
        Err(e) => {
            drop(left);
            return Ok(open_failed(diag, &signal, &e));
        }
    };
    log::info!("relaying between {} and {}", left.label(), right.label());

    let mut relay = Relay::new(left, right, config);
    let status = match relay.run(&signal) {
        Ok(RelayOutcome::Signalled(signo)) => {
            diag.set_exit_status(signo);
            diag.exit_notice(signo);
            signo
        }
        Ok(_) => 0,
        Err(RelayError::Fatal(fatal)) => {
            diag.exit_notice(fatal.status);
            fatal.status
        }
        Err(e) => {
            log::error!("{}", e);
            let status = diag.exit_status();
            diag.exit_notice(status);
            status
        }
    };
    drop(relay);
    log::logger().flush();
    Ok(status)
}

fn main() {
    let cli = Cli::parse();

    // Put the console back if anything panics while it is in raw mode.
    let stdin_tty = if terminal::is_tty(libc::STDIN_FILENO) {
        TtySnapshot::save(libc::STDIN_FILENO).ok()
    } else {
        None
    };
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        log::error!("PANIC: {:?}", panic_info);
        let _ = crossterm::terminal::disable_raw_mode();
        if let Some(snapshot) = &stdin_tty {
            let _ = snapshot.restore();
        }
        default_hook(panic_info);
    }));

    let status = match run(&cli) {
        Ok(status) => status,
        Err(e) => {
            eprintln!("twoway: {e:#}");
            1
        }
    };
    std::process::exit(status);
}
