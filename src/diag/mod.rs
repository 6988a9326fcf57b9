//! Diagnostics service: leveled messages, sinks and exit-on-severity.
//!
//! The service is installed as the backend of the `log` facade, so the rest
//! of the crate logs with the usual macros. It adds what `log` does not have:
//!
//! - six severities, `Debug < Info < Notice < Warning < Error < Critical`;
//! - line prefixes with timestamp, optional hostname and `progname[pid]`;
//! - several sinks at once (stderr, syslog, an appended log file);
//! - an *exit severity*: a message at or above it is written out and then
//!   latched as a [`Fatal`] value that the outermost control loop turns into
//!   process termination with the configured status.
//!
//! # Level mapping
//!
//! | `log` macro | severity |
//! |---|---|
//! | `trace!` | Debug |
//! | `debug!` | Info |
//! | `info!` | Notice |
//! | `warn!` | Warning |
//! | `error!` | Error |
//! | `error!(target: "critical", ..)` | Critical |
//!
//! # Output format
//!
//! ```text
//! 2026/10/19 14:02:11 twoway[4711] N opening readline on stdin
//! 2026/10/19 14:02:11.123456 myhost twoway[4711] W write(1): broken pipe
//! ```
//!
//! Sink failures are swallowed: the service never logs about itself, so a
//! broken sink cannot recurse back into it.

// Rust guideline compliant 2026-02

pub mod syslog;

use std::fmt;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};

use chrono::{DateTime, Local};
use log::{Level, LevelFilter, Log, Metadata, Record};
use thiserror::Error;

pub use syslog::Facility;
use syslog::Syslog;

/// Log target that lifts an `error!` record to [`Severity::Critical`].
pub const CRITICAL_TARGET: &str = "critical";

/// Target used for records emitted through [`Diagnostics::emit`].
const EMIT_TARGET: &str = "twoway";

/// Message severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    /// Detailed tracing.
    Debug,
    /// Informational.
    Info,
    /// Normal but significant events.
    Notice,
    /// Something went wrong but work continues.
    Warning,
    /// An operation failed.
    Error,
    /// The program cannot continue.
    Critical,
}

impl Severity {
    /// One-letter code used in log lines (`D I N W E F`).
    pub fn letter(self) -> char {
        match self {
            Self::Debug => 'D',
            Self::Info => 'I',
            Self::Notice => 'N',
            Self::Warning => 'W',
            Self::Error => 'E',
            Self::Critical => 'F',
        }
    }

    /// Severity of a `log` record, given its level and target.
    pub fn from_parts(level: Level, target: &str) -> Self {
        match level {
            Level::Error if target == CRITICAL_TARGET => Self::Critical,
            Level::Error => Self::Error,
            Level::Warn => Self::Warning,
            Level::Info => Self::Notice,
            Level::Debug => Self::Info,
            Level::Trace => Self::Debug,
        }
    }

    fn to_log(self) -> (Level, &'static str) {
        match self {
            Self::Debug => (Level::Trace, EMIT_TARGET),
            Self::Info => (Level::Debug, EMIT_TARGET),
            Self::Notice => (Level::Info, EMIT_TARGET),
            Self::Warning => (Level::Warn, EMIT_TARGET),
            Self::Error => (Level::Error, EMIT_TARGET),
            Self::Critical => (Level::Error, CRITICAL_TARGET),
        }
    }

    /// The `log` max-level that lets this severity and above through.
    pub fn level_filter(self) -> LevelFilter {
        match self {
            Self::Debug => LevelFilter::Trace,
            Self::Info => LevelFilter::Debug,
            Self::Notice => LevelFilter::Info,
            Self::Warning => LevelFilter::Warn,
            Self::Error | Self::Critical => LevelFilter::Error,
        }
    }

    /// The next lower severity (saturating at `Debug`). Used for `-d`.
    pub fn lower(self) -> Self {
        match self {
            Self::Debug | Self::Info => Self::Debug,
            Self::Notice => Self::Info,
            Self::Warning => Self::Notice,
            Self::Error => Self::Warning,
            Self::Critical => Self::Error,
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "0" | "d" | "debug" => Ok(Self::Debug),
            "1" | "i" | "info" => Ok(Self::Info),
            "2" | "n" | "notice" => Ok(Self::Notice),
            "3" | "w" | "warn" | "warning" => Ok(Self::Warning),
            "4" | "e" | "error" => Ok(Self::Error),
            "5" | "f" | "fatal" | "critical" => Ok(Self::Critical),
            other => Err(format!("unknown severity \"{other}\"")),
        }
    }
}

/// Diagnostics configuration.
///
/// Initialized once at startup; changed afterwards only through
/// [`Diagnostics::reconfigure`].
#[derive(Debug, Clone)]
pub struct DiagConfig {
    /// Program name shown in every line and used as the syslog identity.
    pub progname: String,
    /// Messages below this severity are dropped.
    pub min_severity: Severity,
    /// Messages at or above this severity end the process.
    pub exit_severity: Severity,
    /// Exit status for severity-triggered exits; `0` means `1`.
    pub exit_status: i32,
    /// Write to standard error.
    pub stderr: bool,
    /// Write to syslog with this facility.
    pub syslog: Option<Facility>,
    /// Append to this file.
    pub log_file: Option<PathBuf>,
    /// Prefix lines with the hostname.
    pub with_hostname: bool,
    /// Add microseconds to timestamps.
    pub micros: bool,
}

impl Default for DiagConfig {
    fn default() -> Self {
        Self {
            progname: "twoway".to_string(),
            min_severity: Severity::Error,
            exit_severity: Severity::Error,
            exit_status: 0,
            stderr: true,
            syslog: None,
            log_file: None,
            with_hostname: false,
            micros: false,
        }
    }
}

impl DiagConfig {
    /// Applies environment variable overrides.
    ///
    /// - `TWOWAY_LOG_FILE`: append diagnostics to this file instead of stderr
    pub fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("TWOWAY_LOG_FILE") {
            if !path.is_empty() {
                self.log_file = Some(PathBuf::from(path));
                self.stderr = false;
            }
        }
    }

    fn effective_exit_status(&self) -> i32 {
        if self.exit_status == 0 {
            1
        } else {
            self.exit_status
        }
    }
}

/// A message at or above the exit severity was emitted; the process must
/// terminate with `status` once cleanup is done.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct Fatal {
    /// Exit status to terminate with.
    pub status: i32,
    /// Text of the triggering message.
    pub message: String,
}

/// Errors setting up the diagnostics service.
#[derive(Debug, Error)]
pub enum DiagError {
    /// The log file could not be opened for appending.
    #[error("cannot open log file \"{path}\": {source}")]
    LogFile {
        /// Path given in the configuration.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// [`init`] was called twice.
    #[error("diagnostics already initialized")]
    AlreadyInitialized,
    /// Another `log` backend is already installed.
    #[error("cannot install logger: {0}")]
    Install(#[from] log::SetLoggerError),
}

/// Everything in a line before the severity letter.
#[derive(Debug)]
struct LinePrefix {
    progname: String,
    hostname: Option<String>,
    micros: bool,
}

impl LinePrefix {
    fn render(&self, now: DateTime<Local>) -> String {
        let mut line = if self.micros {
            now.format("%Y/%m/%d %H:%M:%S%.6f ").to_string()
        } else {
            now.format("%Y/%m/%d %H:%M:%S ").to_string()
        };
        if let Some(host) = &self.hostname {
            line.push_str(host);
            line.push(' ');
        }
        line.push_str(&format!("{}[{}] ", self.progname, std::process::id()));
        line
    }
}

fn local_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| hostname::get().ok().map(|h| h.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "localhost".to_string())
}

#[derive(Default)]
struct Sinks {
    writers: Vec<env_logger::Logger>,
    syslog: Option<Syslog>,
}

impl Sinks {
    fn build(config: &DiagConfig) -> Result<Self, DiagError> {
        let prefix = Arc::new(LinePrefix {
            progname: config.progname.clone(),
            hostname: config.with_hostname.then(local_hostname),
            micros: config.micros,
        });

        let mut writers = Vec::new();
        if config.stderr {
            writers.push(line_writer(env_logger::Target::Stderr, Arc::clone(&prefix)));
        }
        if let Some(path) = &config.log_file {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| DiagError::LogFile {
                    path: path.clone(),
                    source,
                })?;
            writers.push(line_writer(
                env_logger::Target::Pipe(Box::new(file)),
                Arc::clone(&prefix),
            ));
        }
        let syslog = config
            .syslog
            .map(|facility| Syslog::open(&config.progname, facility));
        Ok(Self { writers, syslog })
    }
}

fn line_writer(target: env_logger::Target, prefix: Arc<LinePrefix>) -> env_logger::Logger {
    env_logger::Builder::new()
        .filter_level(LevelFilter::Trace)
        .write_style(env_logger::WriteStyle::Never)
        .target(target)
        .format(move |buf, record| {
            let severity = Severity::from_parts(record.level(), record.target());
            writeln!(
                buf,
                "{}{} {}",
                prefix.render(Local::now()),
                severity.letter(),
                record.args()
            )
        })
        .build()
}

/// The diagnostics service.
pub struct Diagnostics {
    config: RwLock<DiagConfig>,
    sinks: RwLock<Sinks>,
    fatal: Mutex<Option<Fatal>>,
}

impl fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Diagnostics")
            .field("config", &self.config())
            .finish_non_exhaustive()
    }
}

impl Diagnostics {
    /// Creates a service with its sinks opened. Does not install it.
    pub fn new(config: DiagConfig) -> Result<Self, DiagError> {
        let sinks = Sinks::build(&config)?;
        Ok(Self {
            config: RwLock::new(config),
            sinks: RwLock::new(sinks),
            fatal: Mutex::new(None),
        })
    }

    /// Replaces the configuration and reopens sinks.
    pub fn reconfigure(&self, config: DiagConfig) -> Result<(), DiagError> {
        let sinks = Sinks::build(&config)?;
        let max_level = config.min_severity.level_filter();
        *self.sinks.write().unwrap_or_else(PoisonError::into_inner) = sinks;
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
        if global().is_some_and(|g| std::ptr::eq(g, self)) {
            log::set_max_level(max_level);
        }
        Ok(())
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> DiagConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Overrides the exit status, e.g. with the number of the signal that
    /// ended the relay.
    pub fn set_exit_status(&self, status: i32) {
        self.config
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .exit_status = status;
    }

    /// Current exit status for fatal exits (never 0).
    pub fn exit_status(&self) -> i32 {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .effective_exit_status()
    }

    /// Emits one message. Returns `Err(Fatal)` when the message was at or
    /// above the exit severity; the caller must unwind and terminate.
    pub fn emit(&self, severity: Severity, args: fmt::Arguments<'_>) -> Result<(), Fatal> {
        let (level, target) = severity.to_log();
        self.log(
            &Record::builder()
                .args(args)
                .level(level)
                .target(target)
                .build(),
        );
        match self.take_fatal() {
            Some(fatal) => Err(fatal),
            None => Ok(()),
        }
    }

    /// Writes the `N exit(status)` notice that precedes a fatal exit.
    pub fn exit_notice(&self, status: i32) {
        let (level, target) = Severity::Notice.to_log();
        self.write_record(
            Severity::Notice,
            &Record::builder()
                .args(format_args!("exit({status})"))
                .level(level)
                .target(target)
                .build(),
        );
    }

    /// Takes the latched fatal message, if any.
    pub fn take_fatal(&self) -> Option<Fatal> {
        self.fatal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// True if a fatal message is waiting to be handled.
    pub fn fatal_pending(&self) -> bool {
        self.fatal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn write_record(&self, severity: Severity, record: &Record<'_>) -> bool {
        if severity < self.config.read().unwrap_or_else(PoisonError::into_inner).min_severity {
            return false;
        }
        let sinks = self.sinks.read().unwrap_or_else(PoisonError::into_inner);
        for writer in &sinks.writers {
            writer.log(record);
        }
        if let Some(syslog) = &sinks.syslog {
            syslog.send(severity, &format!("{} {}", severity.letter(), record.args()));
        }
        true
    }
}

impl Log for Diagnostics {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        Severity::from_parts(metadata.level(), metadata.target())
            >= self.config.read().unwrap_or_else(PoisonError::into_inner).min_severity
    }

    fn log(&self, record: &Record<'_>) {
        let severity = Severity::from_parts(record.level(), record.target());
        if !self.write_record(severity, record) {
            return;
        }
        let config = self.config.read().unwrap_or_else(PoisonError::into_inner);
        if severity >= config.exit_severity {
            let mut fatal = self.fatal.lock().unwrap_or_else(PoisonError::into_inner);
            if fatal.is_none() {
                *fatal = Some(Fatal {
                    status: config.effective_exit_status(),
                    message: record.args().to_string(),
                });
            }
        }
    }

    fn flush(&self) {
        let sinks = self.sinks.read().unwrap_or_else(PoisonError::into_inner);
        for writer in &sinks.writers {
            writer.flush();
        }
        let _ = io::stderr().flush();
    }
}

static GLOBAL: OnceLock<Diagnostics> = OnceLock::new();

/// Creates the process-wide service and installs it as the `log` backend.
pub fn init(config: DiagConfig) -> Result<&'static Diagnostics, DiagError> {
    let max_level = config.min_severity.level_filter();
    let diagnostics = Diagnostics::new(config)?;
    GLOBAL
        .set(diagnostics)
        .map_err(|_rejected| DiagError::AlreadyInitialized)?;
    let installed = GLOBAL.get().ok_or(DiagError::AlreadyInitialized)?;
    log::set_logger(installed)?;
    log::set_max_level(max_level);
    Ok(installed)
}

/// The process-wide service, if [`init`] has run.
pub fn global() -> Option<&'static Diagnostics> {
    GLOBAL.get()
}

/// Takes a fatal message latched by the process-wide service.
pub fn take_fatal() -> Option<Fatal> {
    global().and_then(Diagnostics::take_fatal)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_config(path: &std::path::Path) -> DiagConfig {
        DiagConfig {
            stderr: false,
            log_file: Some(path.to_path_buf()),
            ..DiagConfig::default()
        }
    }

    fn read(path: &std::path::Path) -> String {
        std::fs::read_to_string(path).unwrap_or_default()
    }

    #[test]
    fn test_severity_order_and_letters() {
        assert!(Severity::Debug < Severity::Info);
        assert!(Severity::Notice < Severity::Warning);
        assert!(Severity::Error < Severity::Critical);
        let letters: String = [
            Severity::Debug,
            Severity::Info,
            Severity::Notice,
            Severity::Warning,
            Severity::Error,
            Severity::Critical,
        ]
        .iter()
        .map(|s| s.letter())
        .collect();
        assert_eq!(letters, "DINWEF");
    }

    #[test]
    fn test_log_level_mapping_round_trips() {
        for severity in [
            Severity::Debug,
            Severity::Info,
            Severity::Notice,
            Severity::Warning,
            Severity::Error,
            Severity::Critical,
        ] {
            let (level, target) = severity.to_log();
            assert_eq!(Severity::from_parts(level, target), severity);
        }
        assert_eq!(Severity::from_parts(Level::Error, "twoway::relay"), Severity::Error);
    }

    #[test]
    fn test_lower_saturates() {
        assert_eq!(Severity::Error.lower(), Severity::Warning);
        assert_eq!(Severity::Debug.lower(), Severity::Debug);
    }

    #[test]
    fn test_parse_severity() {
        assert_eq!("warn".parse::<Severity>(), Ok(Severity::Warning));
        assert_eq!("5".parse::<Severity>(), Ok(Severity::Critical));
        assert!("loud".parse::<Severity>().is_err());
    }

    #[test]
    fn test_messages_below_minimum_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("diag.log");
        let diag = Diagnostics::new(DiagConfig {
            min_severity: Severity::Warning,
            exit_severity: Severity::Critical,
            ..file_config(&path)
        })
        .unwrap();

        diag.emit(Severity::Notice, format_args!("quiet")).unwrap();
        diag.emit(Severity::Warning, format_args!("loud {}", 1)).unwrap();

        let text = read(&path);
        assert!(!text.contains("quiet"));
        assert!(text.contains(&format!("twoway[{}] W loud 1", std::process::id())));
    }

    #[test]
    fn test_exit_severity_returns_fatal_after_writing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("diag.log");
        let diag = Diagnostics::new(DiagConfig {
            min_severity: Severity::Notice,
            exit_severity: Severity::Error,
            ..file_config(&path)
        })
        .unwrap();

        diag.emit(Severity::Warning, format_args!("still fine")).unwrap();
        let fatal = diag
            .emit(Severity::Error, format_args!("cannot continue"))
            .unwrap_err();
        assert_eq!(fatal.status, 1);
        assert_eq!(fatal.message, "cannot continue");
        assert!(read(&path).contains("E cannot continue"));
        assert!(!diag.fatal_pending());
    }

    #[test]
    fn test_configured_exit_status_is_used() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("diag.log");
        let diag = Diagnostics::new(DiagConfig {
            exit_status: 3,
            ..file_config(&path)
        })
        .unwrap();
        let fatal = diag.emit(Severity::Critical, format_args!("boom")).unwrap_err();
        assert_eq!(fatal.status, 3);

        diag.set_exit_status(15);
        assert_eq!(diag.exit_status(), 15);
    }

    #[test]
    fn test_log_facade_records_latch_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("diag.log");
        let diag = Diagnostics::new(file_config(&path)).unwrap();

        diag.log(
            &Record::builder()
                .args(format_args!("from a macro"))
                .level(Level::Error)
                .target("twoway::relay")
                .build(),
        );
        assert!(diag.fatal_pending());
        assert_eq!(diag.take_fatal().map(|f| f.message), Some("from a macro".to_string()));
    }

    #[test]
    fn test_hostname_and_micros_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("diag.log");
        let diag = Diagnostics::new(DiagConfig {
            with_hostname: true,
            micros: true,
            exit_severity: Severity::Critical,
            ..file_config(&path)
        })
        .unwrap();
        diag.emit(Severity::Error, format_args!("stamped")).unwrap();

        let line = read(&path);
        let stamp = regex::Regex::new(r"^\d{4}/\d{2}/\d{2} \d{2}:\d{2}:\d{2}\.\d{6} ").unwrap();
        assert!(stamp.is_match(&line), "unexpected prefix: {line}");
        assert!(line.contains(&local_hostname()));
    }

    #[test]
    fn test_reconfigure_switches_sinks() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first.log");
        let second = dir.path().join("second.log");
        let diag = Diagnostics::new(DiagConfig {
            exit_severity: Severity::Critical,
            ..file_config(&first)
        })
        .unwrap();
        diag.emit(Severity::Error, format_args!("one")).unwrap();
        diag.reconfigure(DiagConfig {
            exit_severity: Severity::Critical,
            ..file_config(&second)
        })
        .unwrap();
        diag.emit(Severity::Error, format_args!("two")).unwrap();

        assert!(read(&first).contains("one"));
        assert!(!read(&first).contains("two"));
        assert!(read(&second).contains("two"));
    }

    #[test]
    fn test_unopenable_log_file_is_an_error() {
        let err = Diagnostics::new(file_config(std::path::Path::new(
            "/nonexistent-dir/twoway/diag.log",
        )))
        .unwrap_err();
        assert!(matches!(err, DiagError::LogFile { .. }));
    }
}
