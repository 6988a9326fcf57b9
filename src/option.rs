//! Option descriptor table and phased option application.
//!
//! Every address accepts `,name=value` clauses after its positional
//! arguments. Each option name maps to one static [`OptionDescriptor`] that
//! says which address groups accept it, the lifecycle [`Phase`] at which it
//! is consumed, how its value is parsed and how it is delivered.
//!
//! Opening an address goes through [`PendingOptions`]:
//!
//! 1. [`PendingOptions::parse`] resolves every clause against the table and
//!    rejects unknown options, malformed values and options whose groups do
//!    not intersect the address groups. Nothing is delivered yet.
//! 2. The address's open entry point calls [`PendingOptions::apply`] for each
//!    phase it reaches, in ascending order.
//! 3. [`PendingOptions::finish`] reports anything still pending.
//!
//! Delivery is either a plain field write into [`AddressParams`] or a setter
//! with side effects (a `setsockopt`, a terminal flag, loading a history
//! file). Later clauses overwrite earlier ones when they write the same
//! field.

use std::fmt;
use std::ops::BitOr;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::path::PathBuf;

use crate::editor::History;
use crate::error::{IoContext, OpenError};
use crate::terminal;

// ============================================================================
// Descriptor vocabulary
// ============================================================================

/// Lifecycle point at which an option is consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    /// Before any resource is acquired.
    Early,
    /// On the freshly created descriptor.
    Fd,
    /// Semantic parameters of the opened endpoint.
    Late,
    /// Finalization once the endpoint is complete.
    Open,
}

impl Phase {
    const ALL: [Self; 4] = [Self::Early, Self::Fd, Self::Late, Self::Open];
}

/// Set of option groups, as a bitmask.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct GroupSet(u32);

impl GroupSet {
    /// Any descriptor.
    pub const FD: Self = Self(1 << 0);
    /// Named filesystem objects.
    pub const NAMED: Self = Self(1 << 1);
    /// `open(2)` flags.
    pub const OPEN: Self = Self(1 << 2);
    /// Terminal attributes.
    pub const TERMIOS: Self = Self(1 << 3);
    /// Any socket.
    pub const SOCKET: Self = Self(1 << 4);
    /// TCP sockets.
    pub const TCP: Self = Self(1 << 5);
    /// Listening sockets.
    pub const LISTEN: Self = Self(1 << 6);
    /// Spawned processes.
    pub const EXEC: Self = Self(1 << 7);
    /// Pseudo-terminals.
    pub const PTY: Self = Self(1 << 8);
    /// The line-editing console.
    pub const READLINE: Self = Self(1 << 9);
    /// Paths removed when the endpoint closes.
    pub const UNLINK: Self = Self(1 << 10);

    const NAMES: [(Self, &'static str); 11] = [
        (Self::FD, "FD"),
        (Self::NAMED, "NAMED"),
        (Self::OPEN, "OPEN"),
        (Self::TERMIOS, "TERMIOS"),
        (Self::SOCKET, "SOCKET"),
        (Self::TCP, "TCP"),
        (Self::LISTEN, "LISTEN"),
        (Self::EXEC, "EXEC"),
        (Self::PTY, "PTY"),
        (Self::READLINE, "READLINE"),
        (Self::UNLINK, "UNLINK"),
    ];

    /// Union of two sets, usable in `const` tables.
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// True if the sets share at least one group.
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for GroupSet {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.with(rhs)
    }
}

impl fmt::Debug for GroupSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(group, _)| self.intersects(*group))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "GroupSet({})", names.join("|"))
    }
}

/// How an option value is written on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    /// Bare name means true; also `1/0/yes/no/true/false/on/off`.
    Bool,
    /// Decimal, `0x` hex or leading-`0` octal; must fit `u32`.
    UInt,
    /// Any non-empty text.
    String,
}

/// A parsed option value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    /// Boolean value.
    Bool(bool),
    /// Unsigned value.
    UInt(u32),
    /// Text value.
    String(String),
}

impl OptionValue {
    /// Parses `raw` (the text after `=`, if any) as `value_type`.
    ///
    /// Returns a human-readable reason on failure.
    pub fn parse(value_type: ValueType, raw: Option<&str>) -> Result<Self, String> {
        match (value_type, raw) {
            (ValueType::Bool, None) => Ok(Self::Bool(true)),
            (ValueType::Bool, Some(text)) => parse_bool(text)
                .map(Self::Bool)
                .ok_or_else(|| format!("expected a boolean, got \"{text}\"")),
            (ValueType::UInt, Some(text)) => parse_uint(text)
                .map(Self::UInt)
                .ok_or_else(|| format!("expected an unsigned integer, got \"{text}\"")),
            (ValueType::String, Some(text)) if !text.is_empty() => {
                Ok(Self::String(text.to_string()))
            }
            (ValueType::UInt | ValueType::String, _) => Err("value required".to_string()),
        }
    }

    /// The boolean payload; `false` for other kinds.
    pub fn as_bool(&self) -> bool {
        matches!(self, Self::Bool(true))
    }

    /// The unsigned payload; `0` for other kinds.
    pub fn as_uint(&self) -> u32 {
        match self {
            Self::UInt(value) => *value,
            _ => 0,
        }
    }

    /// The text payload; empty for other kinds.
    pub fn as_str(&self) -> &str {
        match self {
            Self::String(text) => text,
            _ => "",
        }
    }
}

fn parse_bool(text: &str) -> Option<bool> {
    match text.to_ascii_lowercase().as_str() {
        "1" | "yes" | "true" | "on" => Some(true),
        "0" | "no" | "false" | "off" => Some(false),
        _ => None,
    }
}

fn parse_uint(text: &str) -> Option<u32> {
    let text = text.trim();
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else if text.len() > 1 && text.starts_with('0') {
        u32::from_str_radix(&text[1..], 8).ok()
    } else {
        text.parse().ok()
    }
}

/// Stable identifier of an option descriptor.
#[allow(missing_docs, reason = "variant names mirror the option names")]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptionId {
    Cloexec,
    Nonblock,
    Echo,
    Icanon,
    Raw,
    UnlinkEarly,
    UnlinkClose,
    Perm,
    Append,
    Creat,
    Excl,
    Trunc,
    Bind,
    ReuseAddr,
    KeepAlive,
    SndBuf,
    RcvBuf,
    NoDelay,
    Backlog,
    Chdir,
    Pty,
    Link,
    HistoryFile,
    Prompt,
    NoPrompt,
    NoEcho,
}

/// How a parsed value reaches the endpoint being opened.
#[derive(Clone, Copy)]
pub enum Delivery {
    /// Plain write into the parameter block.
    Field(fn(&mut AddressParams, &OptionValue)),
    /// Write with side effects; may fail.
    Setter(fn(&mut ApplyTarget<'_>, &OptionValue) -> Result<(), OpenError>),
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Field(_) => f.write_str("Field"),
            Self::Setter(_) => f.write_str("Setter"),
        }
    }
}

/// One entry of the option table.
#[derive(Debug)]
pub struct OptionDescriptor {
    /// Canonical name.
    pub name: &'static str,
    /// Legacy alias.
    pub alias: Option<&'static str>,
    /// Unique identifier.
    pub id: OptionId,
    /// Address groups that accept this option.
    pub groups: GroupSet,
    /// Phase at which the option is consumed.
    pub phase: Phase,
    /// Value syntax.
    pub value_type: ValueType,
    /// Delivery mechanism.
    pub delivery: Delivery,
}

impl OptionDescriptor {
    fn matches(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
            || self.alias.is_some_and(|alias| alias.eq_ignore_ascii_case(name))
    }
}

// ============================================================================
// Parameter blocks
// ============================================================================

/// Options for named filesystem objects.
#[derive(Debug, Default)]
pub struct NamedParams {
    /// Remove the path before opening.
    pub unlink_early: bool,
    /// Remove the path when the endpoint closes.
    pub unlink_close: bool,
    /// Permission bits for created files and sockets.
    pub perm: Option<u32>,
}

/// `open(2)` flags.
#[derive(Debug, Default)]
pub struct OpenFlags {
    /// `O_APPEND`.
    pub append: bool,
    /// `O_CREAT`.
    pub creat: bool,
    /// `O_EXCL`.
    pub excl: bool,
    /// `O_TRUNC`.
    pub trunc: bool,
}

/// Socket construction parameters.
#[derive(Debug, Default)]
pub struct SocketParams {
    /// Local address to bind before connecting.
    pub bind: Option<String>,
    /// Listen backlog.
    pub backlog: Option<u32>,
}

/// Child process parameters.
#[derive(Debug, Default)]
pub struct ExecParams {
    /// Working directory of the child.
    pub chdir: Option<PathBuf>,
    /// Run the child on a pseudo-terminal instead of pipes.
    pub pty: bool,
}

/// Pseudo-terminal parameters.
#[derive(Debug, Default)]
pub struct PtyParams {
    /// Symlink created to the slave device.
    pub link: Option<PathBuf>,
}

/// Which prompt the line editor shows.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PromptMode {
    /// The trailing partial line last written to the console.
    #[default]
    Dynamic,
    /// Fixed text.
    Static(String),
    /// No prompt.
    Disabled,
}

/// Line-editing parameters.
#[derive(Debug, Default)]
pub struct ReadlineParams {
    /// Prompt selection.
    pub prompt: PromptMode,
    /// File the history was loaded from and is saved back to.
    pub history_file: Option<PathBuf>,
    /// History loaded at open.
    pub history: History,
    /// Prompts matching this pattern read the next input without echo.
    pub noecho: Option<regex::bytes::Regex>,
}

/// Parameters collected for one address while it is being opened.
#[derive(Debug, Default)]
pub struct AddressParams {
    /// Named objects.
    pub named: NamedParams,
    /// Open flags.
    pub open: OpenFlags,
    /// Sockets.
    pub socket: SocketParams,
    /// Processes.
    pub exec: ExecParams,
    /// Pseudo-terminals.
    pub pty: PtyParams,
    /// Line editing.
    pub readline: ReadlineParams,
}

/// What a setter acts on: the parameter block and, from [`Phase::Fd`] on,
/// the primary descriptor.
#[derive(Debug)]
pub struct ApplyTarget<'a> {
    /// Parameter block of the address being opened.
    pub params: &'a mut AddressParams,
    /// Primary descriptor, once one exists.
    pub fd: Option<BorrowedFd<'a>>,
}

impl<'a> ApplyTarget<'a> {
    /// Target without a descriptor (Early phase).
    pub fn params(params: &'a mut AddressParams) -> Self {
        Self { params, fd: None }
    }

    /// Target with a descriptor.
    pub fn with_fd(params: &'a mut AddressParams, fd: BorrowedFd<'a>) -> Self {
        Self {
            params,
            fd: Some(fd),
        }
    }

    fn fd(&self) -> Result<BorrowedFd<'a>, OpenError> {
        self.fd.ok_or_else(|| {
            OpenError::resource(
                "no descriptor",
                std::io::Error::from(std::io::ErrorKind::Unsupported),
            )
        })
    }
}

// ============================================================================
// Delivery functions
// ============================================================================

fn set_unlink_early(p: &mut AddressParams, v: &OptionValue) {
    p.named.unlink_early = v.as_bool();
}

fn set_unlink_close(p: &mut AddressParams, v: &OptionValue) {
    p.named.unlink_close = v.as_bool();
}

fn set_perm(p: &mut AddressParams, v: &OptionValue) {
    p.named.perm = Some(v.as_uint());
}

fn set_append(p: &mut AddressParams, v: &OptionValue) {
    p.open.append = v.as_bool();
}

fn set_creat(p: &mut AddressParams, v: &OptionValue) {
    p.open.creat = v.as_bool();
}

fn set_excl(p: &mut AddressParams, v: &OptionValue) {
    p.open.excl = v.as_bool();
}

fn set_trunc(p: &mut AddressParams, v: &OptionValue) {
    p.open.trunc = v.as_bool();
}

fn set_bind(p: &mut AddressParams, v: &OptionValue) {
    p.socket.bind = Some(v.as_str().to_string());
}

fn set_backlog(p: &mut AddressParams, v: &OptionValue) {
    p.socket.backlog = Some(v.as_uint());
}

fn set_chdir(p: &mut AddressParams, v: &OptionValue) {
    p.exec.chdir = Some(PathBuf::from(v.as_str()));
}

fn set_exec_pty(p: &mut AddressParams, v: &OptionValue) {
    p.exec.pty = v.as_bool();
}

fn set_link(p: &mut AddressParams, v: &OptionValue) {
    p.pty.link = Some(PathBuf::from(v.as_str()));
}

fn set_prompt(p: &mut AddressParams, v: &OptionValue) {
    p.readline.prompt = PromptMode::Static(v.as_str().to_string());
}

fn set_noprompt(p: &mut AddressParams, v: &OptionValue) {
    if v.as_bool() {
        p.readline.prompt = PromptMode::Disabled;
    } else if p.readline.prompt == PromptMode::Disabled {
        p.readline.prompt = PromptMode::Dynamic;
    }
}

fn fcntl_flag(
    fd: BorrowedFd<'_>,
    get: libc::c_int,
    set: libc::c_int,
    bit: libc::c_int,
    on: bool,
) -> std::io::Result<()> {
    let raw = fd.as_raw_fd();
    // SAFETY: F_GETFD/F_GETFL take no argument and only read descriptor state.
    let current = unsafe { libc::fcntl(raw, get) };
    if current < 0 {
        return Err(std::io::Error::last_os_error());
    }
    let wanted = if on { current | bit } else { current & !bit };
    // SAFETY: F_SETFD/F_SETFL take an int flag word.
    if unsafe { libc::fcntl(raw, set, wanted) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn apply_cloexec(t: &mut ApplyTarget<'_>, v: &OptionValue) -> Result<(), OpenError> {
    fcntl_flag(t.fd()?, libc::F_GETFD, libc::F_SETFD, libc::FD_CLOEXEC, v.as_bool())
        .open_context(|| "fcntl(F_SETFD)")
}

fn apply_nonblock(t: &mut ApplyTarget<'_>, v: &OptionValue) -> Result<(), OpenError> {
    fcntl_flag(t.fd()?, libc::F_GETFL, libc::F_SETFL, libc::O_NONBLOCK, v.as_bool())
        .open_context(|| "fcntl(F_SETFL)")
}

fn apply_echo(t: &mut ApplyTarget<'_>, v: &OptionValue) -> Result<(), OpenError> {
    terminal::set_local_flag(t.fd()?.as_raw_fd(), libc::ECHO, v.as_bool())
        .open_context(|| "tcsetattr(ECHO)")
}

fn apply_icanon(t: &mut ApplyTarget<'_>, v: &OptionValue) -> Result<(), OpenError> {
    terminal::set_local_flag(t.fd()?.as_raw_fd(), libc::ICANON, v.as_bool())
        .open_context(|| "tcsetattr(ICANON)")
}

fn apply_raw(t: &mut ApplyTarget<'_>, v: &OptionValue) -> Result<(), OpenError> {
    if v.as_bool() {
        terminal::make_raw(t.fd()?.as_raw_fd()).open_context(|| "tcsetattr(raw)")?;
    }
    Ok(())
}

fn apply_reuseaddr(t: &mut ApplyTarget<'_>, v: &OptionValue) -> Result<(), OpenError> {
    let fd = t.fd()?;
    socket2::SockRef::from(&fd)
        .set_reuse_address(v.as_bool())
        .open_context(|| "setsockopt(SO_REUSEADDR)")
}

fn apply_keepalive(t: &mut ApplyTarget<'_>, v: &OptionValue) -> Result<(), OpenError> {
    let fd = t.fd()?;
    socket2::SockRef::from(&fd)
        .set_keepalive(v.as_bool())
        .open_context(|| "setsockopt(SO_KEEPALIVE)")
}

fn apply_sndbuf(t: &mut ApplyTarget<'_>, v: &OptionValue) -> Result<(), OpenError> {
    let fd = t.fd()?;
    socket2::SockRef::from(&fd)
        .set_send_buffer_size(v.as_uint() as usize)
        .open_context(|| "setsockopt(SO_SNDBUF)")
}

fn apply_rcvbuf(t: &mut ApplyTarget<'_>, v: &OptionValue) -> Result<(), OpenError> {
    let fd = t.fd()?;
    socket2::SockRef::from(&fd)
        .set_recv_buffer_size(v.as_uint() as usize)
        .open_context(|| "setsockopt(SO_RCVBUF)")
}

fn apply_nodelay(t: &mut ApplyTarget<'_>, v: &OptionValue) -> Result<(), OpenError> {
    let on = libc::c_int::from(v.as_bool());
    // SAFETY: `on` outlives the call and its size is passed alongside.
    let rc = unsafe {
        libc::setsockopt(
            t.fd()?.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            std::ptr::from_ref(&on).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(OpenError::resource(
            "setsockopt(TCP_NODELAY)",
            std::io::Error::last_os_error(),
        ));
    }
    Ok(())
}

fn apply_history_file(t: &mut ApplyTarget<'_>, v: &OptionValue) -> Result<(), OpenError> {
    let path = PathBuf::from(v.as_str());
    t.params.readline.history =
        History::load(&path).open_context(|| format!("read_history(\"{}\")", path.display()))?;
    t.params.readline.history_file = Some(path);
    Ok(())
}

fn apply_noecho(t: &mut ApplyTarget<'_>, v: &OptionValue) -> Result<(), OpenError> {
    t.params.readline.noecho = Some(regex::bytes::Regex::new(v.as_str())?);
    Ok(())
}

// ============================================================================
// The table
// ============================================================================

const fn desc(
    name: &'static str,
    alias: Option<&'static str>,
    id: OptionId,
    groups: GroupSet,
    phase: Phase,
    value_type: ValueType,
    delivery: Delivery,
) -> OptionDescriptor {
    OptionDescriptor {
        name,
        alias,
        id,
        groups,
        phase,
        value_type,
        delivery,
    }
}

use Delivery::{Field, Setter};
use ValueType::{Bool, UInt};

/// Every option known to the relay.
#[rustfmt::skip]
pub static OPTIONS: &[OptionDescriptor] = &[
    desc("cloexec", None, OptionId::Cloexec, GroupSet::FD, Phase::Fd, Bool, Setter(apply_cloexec)),
    desc("nonblock", None, OptionId::Nonblock, GroupSet::FD, Phase::Fd, Bool, Setter(apply_nonblock)),
    desc("echo", None, OptionId::Echo, GroupSet::TERMIOS, Phase::Fd, Bool, Setter(apply_echo)),
    desc("icanon", None, OptionId::Icanon, GroupSet::TERMIOS, Phase::Fd, Bool, Setter(apply_icanon)),
    desc("raw", None, OptionId::Raw, GroupSet::TERMIOS, Phase::Fd, Bool, Setter(apply_raw)),
    desc("unlink-early", None, OptionId::UnlinkEarly, GroupSet::NAMED, Phase::Early, Bool, Field(set_unlink_early)),
    desc("unlink-close", None, OptionId::UnlinkClose, GroupSet::NAMED.with(GroupSet::UNLINK), Phase::Open, Bool, Field(set_unlink_close)),
    desc("perm", Some("mode"), OptionId::Perm, GroupSet::NAMED, Phase::Early, UInt, Field(set_perm)),
    desc("append", None, OptionId::Append, GroupSet::OPEN, Phase::Early, Bool, Field(set_append)),
    desc("creat", Some("create"), OptionId::Creat, GroupSet::OPEN, Phase::Early, Bool, Field(set_creat)),
    desc("excl", None, OptionId::Excl, GroupSet::OPEN, Phase::Early, Bool, Field(set_excl)),
    desc("trunc", None, OptionId::Trunc, GroupSet::OPEN, Phase::Early, Bool, Field(set_trunc)),
    desc("bind", None, OptionId::Bind, GroupSet::SOCKET, Phase::Early, ValueType::String, Field(set_bind)),
    desc("reuseaddr", None, OptionId::ReuseAddr, GroupSet::SOCKET, Phase::Fd, Bool, Setter(apply_reuseaddr)),
    desc("keepalive", None, OptionId::KeepAlive, GroupSet::SOCKET, Phase::Fd, Bool, Setter(apply_keepalive)),
    desc("sndbuf", None, OptionId::SndBuf, GroupSet::SOCKET, Phase::Fd, UInt, Setter(apply_sndbuf)),
    desc("rcvbuf", None, OptionId::RcvBuf, GroupSet::SOCKET, Phase::Fd, UInt, Setter(apply_rcvbuf)),
    desc("nodelay", None, OptionId::NoDelay, GroupSet::TCP, Phase::Fd, Bool, Setter(apply_nodelay)),
    desc("backlog", None, OptionId::Backlog, GroupSet::LISTEN, Phase::Early, UInt, Field(set_backlog)),
    desc("chdir", Some("cd"), OptionId::Chdir, GroupSet::EXEC, Phase::Early, ValueType::String, Field(set_chdir)),
    desc("pty", None, OptionId::Pty, GroupSet::EXEC, Phase::Early, Bool, Field(set_exec_pty)),
    desc("link", None, OptionId::Link, GroupSet::PTY, Phase::Late, ValueType::String, Field(set_link)),
    desc("history-file", Some("history"), OptionId::HistoryFile, GroupSet::READLINE, Phase::Late, ValueType::String, Setter(apply_history_file)),
    desc("prompt", None, OptionId::Prompt, GroupSet::READLINE, Phase::Late, ValueType::String, Field(set_prompt)),
    desc("noprompt", None, OptionId::NoPrompt, GroupSet::READLINE, Phase::Late, Bool, Field(set_noprompt)),
    desc("noecho", None, OptionId::NoEcho, GroupSet::READLINE, Phase::Late, ValueType::String, Setter(apply_noecho)),
];

/// Looks an option up by name or alias (case-insensitive).
pub fn lookup(name: &str) -> Option<&'static OptionDescriptor> {
    OPTIONS.iter().find(|d| d.matches(name))
}

// ============================================================================
// Pending options
// ============================================================================

/// One validated `name[=value]` clause.
#[derive(Debug)]
struct Requested {
    descriptor: &'static OptionDescriptor,
    given: String,
    value: OptionValue,
}

impl Requested {
    fn deliver(&self, target: &mut ApplyTarget<'_>) -> Result<(), OpenError> {
        match self.descriptor.delivery {
            Delivery::Field(write) => {
                write(target.params, &self.value);
                Ok(())
            }
            Delivery::Setter(apply) => apply(target, &self.value).map_err(|e| match e {
                OpenError::Resource { context, source } => OpenError::Resource {
                    context: format!("option \"{}\": {context}", self.given),
                    source,
                },
                other => other,
            }),
        }
    }
}

/// Options of one address that have been validated but not yet delivered.
#[derive(Debug)]
pub struct PendingOptions {
    address: &'static str,
    pending: Vec<Requested>,
    applied: Option<Phase>,
}

impl PendingOptions {
    /// Options for an address with no clauses.
    pub fn empty(address: &'static str) -> Self {
        Self {
            address,
            pending: Vec::new(),
            applied: None,
        }
    }

    /// Validates `clauses` for an address of type `address` with `groups`.
    ///
    /// Fails on the first unknown option, malformed value or option whose
    /// groups do not intersect `groups`. No parameter block is touched.
    pub fn parse<S: AsRef<str>>(
        address: &'static str,
        groups: GroupSet,
        clauses: &[S],
    ) -> Result<Self, OpenError> {
        let mut pending = Vec::with_capacity(clauses.len());
        for clause in clauses {
            let clause = clause.as_ref();
            let (name, raw) = match clause.split_once('=') {
                Some((name, value)) => (name, Some(value)),
                None => (clause, None),
            };
            if name.is_empty() {
                return Err(OpenError::Syntax(clause.to_string()));
            }
            let descriptor =
                lookup(name).ok_or_else(|| OpenError::UnknownOption(name.to_string()))?;
            if !descriptor.groups.intersects(groups) {
                return Err(OpenError::NotApplicable {
                    option: name.to_string(),
                    address: address.to_string(),
                });
            }
            let value = OptionValue::parse(descriptor.value_type, raw).map_err(|reason| {
                OpenError::TypeMismatch {
                    option: name.to_string(),
                    reason,
                }
            })?;
            pending.push(Requested {
                descriptor,
                given: name.to_string(),
                value,
            });
        }
        Ok(Self {
            address,
            pending,
            applied: None,
        })
    }

    /// Number of options not yet delivered.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// True if every option has been delivered.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// True if an option with this id is still pending.
    pub fn contains(&self, id: OptionId) -> bool {
        self.pending.iter().any(|o| o.descriptor.id == id)
    }

    /// Delivers, in request order, every pending option of `phase`.
    ///
    /// Asking for a phase below one already applied fails for any option of
    /// that phase.
    pub fn apply(&mut self, phase: Phase, target: &mut ApplyTarget<'_>) -> Result<(), OpenError> {
        if self.applied.is_some_and(|done| phase < done) {
            return match self.pending.iter().find(|o| o.descriptor.phase == phase) {
                Some(late) => Err(self.not_applicable(late)),
                None => Ok(()),
            };
        }
        self.applied = Some(phase);
        let (due, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|o| o.descriptor.phase == phase);
        self.pending = rest;
        for option in &due {
            log::trace!("{}: applying option {}", self.address, option.given);
            option.deliver(target)?;
        }
        Ok(())
    }

    /// Applies every phase up to and including `phase`.
    pub fn apply_through(
        &mut self,
        phase: Phase,
        target: &mut ApplyTarget<'_>,
    ) -> Result<(), OpenError> {
        for step in Phase::ALL.into_iter().filter(|p| *p <= phase) {
            if self.applied.is_none_or(|done| step >= done) {
                self.apply(step, target)?;
            }
        }
        Ok(())
    }

    /// Reports the first option left undelivered.
    pub fn finish(self) -> Result<(), OpenError> {
        match self.pending.first() {
            Some(left) => Err(self.not_applicable(left)),
            None => Ok(()),
        }
    }

    fn not_applicable(&self, option: &Requested) -> OpenError {
        OpenError::NotApplicable {
            option: option.given.clone(),
            address: self.address.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const READLINE_GROUPS: GroupSet = GroupSet::FD
        .with(GroupSet::TERMIOS)
        .with(GroupSet::READLINE);

    fn late(params: &mut AddressParams, clauses: &[&str]) -> Result<(), OpenError> {
        let mut pending = PendingOptions::parse("readline", READLINE_GROUPS, clauses)?;
        let mut target = ApplyTarget::params(params);
        pending.apply(Phase::Late, &mut target)?;
        pending.finish()
    }

    #[test]
    fn test_descriptor_ids_and_names_are_unique() {
        let mut ids = HashSet::new();
        let mut names = HashSet::new();
        for d in OPTIONS {
            assert!(ids.insert(d.id), "duplicate id {:?}", d.id);
            assert!(names.insert(d.name), "duplicate name {}", d.name);
            if let Some(alias) = d.alias {
                assert!(names.insert(alias), "alias {alias} collides");
            }
        }
    }

    #[test]
    fn test_lookup_by_alias_and_case() {
        assert_eq!(lookup("history").map(|d| d.id), Some(OptionId::HistoryFile));
        assert_eq!(lookup("PROMPT").map(|d| d.id), Some(OptionId::Prompt));
        assert!(lookup("prom").is_none());
    }

    #[test]
    fn test_parse_values() {
        assert_eq!(OptionValue::parse(ValueType::Bool, None), Ok(OptionValue::Bool(true)));
        assert_eq!(OptionValue::parse(ValueType::Bool, Some("off")), Ok(OptionValue::Bool(false)));
        assert_eq!(OptionValue::parse(ValueType::UInt, Some("0x1f")), Ok(OptionValue::UInt(31)));
        assert_eq!(OptionValue::parse(ValueType::UInt, Some("0600")), Ok(OptionValue::UInt(0o600)));
        assert_eq!(OptionValue::parse(ValueType::UInt, Some("0")), Ok(OptionValue::UInt(0)));
        assert!(OptionValue::parse(ValueType::UInt, Some("4294967296")).is_err());
        assert!(OptionValue::parse(ValueType::UInt, None).is_err());
        assert!(OptionValue::parse(ValueType::String, Some("")).is_err());
        assert!(OptionValue::parse(ValueType::Bool, Some("maybe")).is_err());
    }

    #[test]
    fn test_inapplicable_option_rejected_before_any_delivery() {
        let mut params = AddressParams::default();
        let err = late(&mut params, &["prompt=x", "backlog=3"]).unwrap_err();
        assert!(matches!(
            err,
            OpenError::NotApplicable { ref option, ref address } if option == "backlog" && address == "readline"
        ));
        assert_eq!(params.readline.prompt, PromptMode::Dynamic);
        assert!(params.socket.backlog.is_none());
    }

    #[test]
    fn test_unknown_option_and_type_mismatch() {
        let err = PendingOptions::parse("readline", READLINE_GROUPS, &["colour"]).unwrap_err();
        assert!(matches!(err, OpenError::UnknownOption(ref n) if n == "colour"));

        let err = PendingOptions::parse("readline", READLINE_GROUPS, &["noprompt=perhaps"])
            .unwrap_err();
        assert!(matches!(err, OpenError::TypeMismatch { ref option, .. } if option == "noprompt"));

        let err = PendingOptions::parse("readline", READLINE_GROUPS, &["prompt"]).unwrap_err();
        assert!(matches!(err, OpenError::TypeMismatch { .. }));
    }

    #[test]
    fn test_later_prompt_option_wins() {
        let mut params = AddressParams::default();
        late(&mut params, &["prompt=foo", "noprompt"]).unwrap();
        assert_eq!(params.readline.prompt, PromptMode::Disabled);

        let mut params = AddressParams::default();
        late(&mut params, &["noprompt", "prompt=foo"]).unwrap();
        assert_eq!(params.readline.prompt, PromptMode::Static("foo".into()));

        let mut params = AddressParams::default();
        late(&mut params, &["noprompt", "noprompt=0"]).unwrap();
        assert_eq!(params.readline.prompt, PromptMode::Dynamic);
    }

    #[test]
    fn test_noecho_pattern_compiles_or_fails() {
        let mut params = AddressParams::default();
        late(&mut params, &["noecho=[Pp]assword:"]).unwrap();
        assert!(params
            .readline
            .noecho
            .as_ref()
            .is_some_and(|re| re.is_match(b"Password: ")));

        let mut params = AddressParams::default();
        assert!(matches!(
            late(&mut params, &["noecho=("]).unwrap_err(),
            OpenError::Pattern(_)
        ));
    }

    #[test]
    fn test_history_option_loads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hist");
        std::fs::write(&path, "first\nsecond\n").unwrap();

        let mut params = AddressParams::default();
        late(&mut params, &[format!("history={}", path.display()).as_str()]).unwrap();
        assert_eq!(params.readline.history_file.as_deref(), Some(path.as_path()));
        assert_eq!(params.readline.history.entries(), ["first", "second"]);

        let mut params = AddressParams::default();
        let missing = dir.path().join("missing");
        late(&mut params, &[format!("history={}", missing.display()).as_str()]).unwrap();
        assert!(params.readline.history.is_empty());
    }

    #[test]
    fn test_phases_apply_in_order_and_leftovers_fail() {
        let groups = GroupSet::FD | GroupSet::NAMED | GroupSet::OPEN;
        let mut params = AddressParams::default();
        let mut pending =
            PendingOptions::parse("open", groups, &["unlink-close", "creat", "perm=0644"]).unwrap();

        pending
            .apply(Phase::Early, &mut ApplyTarget::params(&mut params))
            .unwrap();
        assert!(params.open.creat);
        assert_eq!(params.named.perm, Some(0o644));
        assert!(!params.named.unlink_close);
        assert!(pending.contains(OptionId::UnlinkClose));

        let err = pending.finish().unwrap_err();
        assert!(matches!(err, OpenError::NotApplicable { ref option, .. } if option == "unlink-close"));
    }

    #[test]
    fn test_going_back_a_phase_is_rejected() {
        let groups = GroupSet::FD | GroupSet::NAMED | GroupSet::OPEN;
        let mut params = AddressParams::default();
        let mut pending = PendingOptions::parse("open", groups, &["trunc"]).unwrap();
        pending
            .apply(Phase::Late, &mut ApplyTarget::params(&mut params))
            .unwrap();
        let err = pending
            .apply(Phase::Early, &mut ApplyTarget::params(&mut params))
            .unwrap_err();
        assert!(matches!(err, OpenError::NotApplicable { .. }));
        assert!(!params.open.trunc);
    }

    #[test]
    fn test_fd_setter_on_real_descriptor() {
        use std::os::fd::AsFd;

        let file = tempfile::tempfile().unwrap();
        let mut params = AddressParams::default();
        let mut pending =
            PendingOptions::parse("open", GroupSet::FD, &["nonblock", "cloexec=0"]).unwrap();
        let mut target = ApplyTarget::with_fd(&mut params, file.as_fd());
        pending.apply_through(Phase::Open, &mut target).unwrap();
        pending.finish().unwrap();

        // SAFETY: querying flags of a descriptor we own.
        let fl = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_GETFL) };
        assert_ne!(fl & libc::O_NONBLOCK, 0);
        // SAFETY: as above.
        let fd_flags = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_GETFD) };
        assert_eq!(fd_flags & libc::FD_CLOEXEC, 0);
    }

    #[test]
    fn test_fd_setter_without_descriptor_fails_with_context() {
        let mut params = AddressParams::default();
        let mut pending = PendingOptions::parse("open", GroupSet::FD, &["nonblock"]).unwrap();
        let err = pending
            .apply(Phase::Fd, &mut ApplyTarget::params(&mut params))
            .unwrap_err();
        assert!(err.to_string().contains("option \"nonblock\""));
    }
}
