//! Address descriptor registry.
//!
//! An address is written `type:arg1:arg2,opt1=value,opt2`. The registry maps
//! the type name to a static [`AddressDescriptor`] carrying its arity,
//! direction capability, option groups and open entry point.
//!
//! [`resolve_and_open`] performs every configuration check (syntax, name,
//! arity, direction, options) before the entry point runs, so a rejected
//! address never touches the system. Entry points hold what they acquire in
//! RAII values, so a failure partway releases it.
//!
//! # Address types
//!
//! | Name | Arguments | Module |
//! |---|---|---|
//! | `stdio`, `-` | | [`stdio`] |
//! | `readline` | | [`readline`] |
//! | `open` | path | [`file`] |
//! | `exec`, `system` | command | [`exec`] |
//! | `pty` | | [`pty`] |
//! | `tcp-connect`, `tcp` | host, port | [`socket`] |
//! | `tcp-listen` | port | [`socket`] |
//! | `udp-connect`, `udp` | host, port | [`socket`] |
//! | `unix-connect`, `unix-listen` | path | [`socket`] |

pub mod exec;
pub mod file;
pub mod pty;
pub mod readline;
pub mod socket;
pub mod stdio;

use std::fmt;
use std::os::fd::{BorrowedFd, RawFd};

use crate::endpoint::{ClosePolicy, Endpoint, ShutdownPolicy};
use crate::error::OpenError;
use crate::option::{AddressParams, ApplyTarget, GroupSet, PendingOptions, Phase};
use crate::terminal::{self, TtySnapshot};

/// Direction an address is opened for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    /// Read and write.
    #[default]
    ReadWrite,
    /// Only read from it.
    ReadOnly,
    /// Only write to it.
    WriteOnly,
}

impl Direction {
    /// True if data is read from the address.
    pub fn reads(self) -> bool {
        matches!(self, Self::ReadWrite | Self::ReadOnly)
    }

    /// True if data is written to the address.
    pub fn writes(self) -> bool {
        matches!(self, Self::ReadWrite | Self::WriteOnly)
    }

    fn describe(self) -> &'static str {
        match self {
            Self::ReadWrite => "read-write",
            Self::ReadOnly => "read-only",
            Self::WriteOnly => "write-only",
        }
    }
}

/// Directions an address type supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capability {
    /// Can be read from.
    pub read: bool,
    /// Can be written to.
    pub write: bool,
}

impl Capability {
    /// Both directions.
    pub const READ_WRITE: Self = Self {
        read: true,
        write: true,
    };

    /// True if every direction `direction` needs is supported.
    pub fn allows(self, direction: Direction) -> bool {
        (!direction.reads() || self.read) && (!direction.writes() || self.write)
    }
}

/// Entry point that acquires an address's resources.
pub type OpenFn = fn(&OpenRequest<'_>, &mut PendingOptions) -> Result<Endpoint, OpenError>;

/// One entry of the registry.
pub struct AddressDescriptor {
    /// Type name, matched case-insensitively.
    pub name: &'static str,
    /// Fewest positional arguments.
    pub min_args: usize,
    /// Most positional arguments.
    pub max_args: usize,
    /// Supported directions.
    pub capability: Capability,
    /// Option groups accepted.
    pub groups: GroupSet,
    /// Entry point.
    pub open: OpenFn,
    /// Write-half shutdown of opened endpoints.
    pub shutdown: ShutdownPolicy,
    /// Close duties of opened endpoints.
    pub close: ClosePolicy,
}

impl fmt::Debug for AddressDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressDescriptor")
            .field("name", &self.name)
            .field("args", &(self.min_args..=self.max_args))
            .field("capability", &self.capability)
            .field("groups", &self.groups)
            .finish_non_exhaustive()
    }
}

impl AddressDescriptor {
    fn expected_args(&self) -> String {
        if self.min_args == self.max_args {
            self.min_args.to_string()
        } else {
            format!("{}-{}", self.min_args, self.max_args)
        }
    }
}

/// What an entry point is asked to open.
#[derive(Debug)]
pub struct OpenRequest<'a> {
    /// Registry entry being opened.
    pub descriptor: &'static AddressDescriptor,
    /// Positional arguments.
    pub args: Vec<&'a str>,
    /// Requested direction.
    pub direction: Direction,
    /// Address text without options, for diagnostics.
    pub label: &'a str,
}

impl OpenRequest<'_> {
    /// Positional argument `index`; arity was checked before open.
    pub fn arg(&self, index: usize) -> &str {
        self.args.get(index).copied().unwrap_or_default()
    }
}

const FD: GroupSet = GroupSet::FD;

/// Every registered address type.
#[rustfmt::skip]
pub static ADDRESSES: &[AddressDescriptor] = &[
    AddressDescriptor { name: "stdio", min_args: 0, max_args: 0, capability: Capability::READ_WRITE, groups: FD.with(GroupSet::TERMIOS), open: stdio::open, shutdown: ShutdownPolicy::CloseWrite, close: ClosePolicy::KeepStd },
    AddressDescriptor { name: "-", min_args: 0, max_args: 0, capability: Capability::READ_WRITE, groups: FD.with(GroupSet::TERMIOS), open: stdio::open, shutdown: ShutdownPolicy::CloseWrite, close: ClosePolicy::KeepStd },
    AddressDescriptor { name: "readline", min_args: 0, max_args: 0, capability: Capability::READ_WRITE, groups: FD.with(GroupSet::TERMIOS).with(GroupSet::READLINE), open: readline::open, shutdown: ShutdownPolicy::CloseWrite, close: ClosePolicy::KeepStd },
    AddressDescriptor { name: "open", min_args: 1, max_args: 1, capability: Capability::READ_WRITE, groups: FD.with(GroupSet::NAMED).with(GroupSet::OPEN), open: file::open, shutdown: ShutdownPolicy::None, close: ClosePolicy::Close },
    AddressDescriptor { name: "exec", min_args: 1, max_args: 1, capability: Capability::READ_WRITE, groups: FD.with(GroupSet::EXEC), open: exec::open_exec, shutdown: ShutdownPolicy::CloseWrite, close: ClosePolicy::ReapChild },
    AddressDescriptor { name: "system", min_args: 1, max_args: 1, capability: Capability::READ_WRITE, groups: FD.with(GroupSet::EXEC), open: exec::open_system, shutdown: ShutdownPolicy::CloseWrite, close: ClosePolicy::ReapChild },
    AddressDescriptor { name: "pty", min_args: 0, max_args: 0, capability: Capability::READ_WRITE, groups: FD.with(GroupSet::TERMIOS).with(GroupSet::PTY), open: pty::open, shutdown: ShutdownPolicy::None, close: ClosePolicy::Close },
    AddressDescriptor { name: "tcp-connect", min_args: 2, max_args: 2, capability: Capability::READ_WRITE, groups: FD.with(GroupSet::SOCKET).with(GroupSet::TCP), open: socket::open_tcp_connect, shutdown: ShutdownPolicy::SocketWrite, close: ClosePolicy::Close },
    AddressDescriptor { name: "tcp", min_args: 2, max_args: 2, capability: Capability::READ_WRITE, groups: FD.with(GroupSet::SOCKET).with(GroupSet::TCP), open: socket::open_tcp_connect, shutdown: ShutdownPolicy::SocketWrite, close: ClosePolicy::Close },
    AddressDescriptor { name: "tcp-listen", min_args: 1, max_args: 1, capability: Capability::READ_WRITE, groups: FD.with(GroupSet::SOCKET).with(GroupSet::TCP).with(GroupSet::LISTEN), open: socket::open_tcp_listen, shutdown: ShutdownPolicy::SocketWrite, close: ClosePolicy::Close },
    AddressDescriptor { name: "udp-connect", min_args: 2, max_args: 2, capability: Capability::READ_WRITE, groups: FD.with(GroupSet::SOCKET), open: socket::open_udp_connect, shutdown: ShutdownPolicy::None, close: ClosePolicy::Close },
    AddressDescriptor { name: "udp", min_args: 2, max_args: 2, capability: Capability::READ_WRITE, groups: FD.with(GroupSet::SOCKET), open: socket::open_udp_connect, shutdown: ShutdownPolicy::None, close: ClosePolicy::Close },
    AddressDescriptor { name: "unix-connect", min_args: 1, max_args: 1, capability: Capability::READ_WRITE, groups: FD.with(GroupSet::SOCKET).with(GroupSet::UNLINK), open: socket::open_unix_connect, shutdown: ShutdownPolicy::SocketWrite, close: ClosePolicy::Close },
    AddressDescriptor { name: "unix-listen", min_args: 1, max_args: 1, capability: Capability::READ_WRITE, groups: FD.with(GroupSet::SOCKET).with(GroupSet::NAMED).with(GroupSet::LISTEN), open: socket::open_unix_listen, shutdown: ShutdownPolicy::SocketWrite, close: ClosePolicy::Close },
];

/// Looks an address type up by exact, case-insensitive name.
pub fn lookup(name: &str) -> Option<&'static AddressDescriptor> {
    ADDRESSES.iter().find(|d| d.name.eq_ignore_ascii_case(name))
}

/// An address split into its parts.
#[derive(Debug, PartialEq, Eq)]
pub struct ParsedAddress<'a> {
    /// Type name.
    pub name: &'a str,
    /// Positional arguments.
    pub args: Vec<&'a str>,
    /// Option clauses.
    pub options: Vec<&'a str>,
    /// Text before the first option.
    pub head: &'a str,
}

/// Splits `type:arg:arg,opt,opt=value`.
///
/// There is no quoting: arguments cannot contain `:` or `,`.
pub fn parse(text: &str) -> Result<ParsedAddress<'_>, OpenError> {
    let (head, options) = match text.split_once(',') {
        Some((head, rest)) => (head, rest.split(',').collect()),
        None => (text, Vec::new()),
    };
    let mut parts = head.split(':');
    let name = parts.next().unwrap_or_default();
    if name.is_empty() {
        return Err(OpenError::Syntax(text.to_string()));
    }
    Ok(ParsedAddress {
        name,
        args: parts.collect(),
        options,
        head,
    })
}

/// Resolves `text` against the registry and opens it.
pub fn resolve_and_open(text: &str, direction: Direction) -> Result<Endpoint, OpenError> {
    let parsed = parse(text)?;
    let descriptor =
        lookup(parsed.name).ok_or_else(|| OpenError::UnknownAddress(parsed.name.to_string()))?;
    if !(descriptor.min_args..=descriptor.max_args).contains(&parsed.args.len()) {
        return Err(OpenError::Arity {
            address: descriptor.name.to_string(),
            given: parsed.args.len(),
            expected: descriptor.expected_args(),
        });
    }
    if !descriptor.capability.allows(direction) {
        return Err(OpenError::Direction {
            address: descriptor.name.to_string(),
            requested: direction.describe(),
        });
    }
    let mut pending = PendingOptions::parse(descriptor.name, descriptor.groups, &parsed.options)?;

    let request = OpenRequest {
        descriptor,
        args: parsed.args,
        direction,
        label: parsed.head,
    };
    log::debug!("opening {} {}", request.label, direction.describe());
    let endpoint = (descriptor.open)(&request, &mut pending)?;
    pending.finish()?;
    Ok(endpoint)
}

/// Applies `phases` in order, with `fd` as the setter target.
pub(crate) fn apply_phases(
    pending: &mut PendingOptions,
    phases: &[Phase],
    params: &mut AddressParams,
    fd: Option<BorrowedFd<'_>>,
) -> Result<(), OpenError> {
    for &phase in phases {
        let mut target = match fd {
            Some(fd) => ApplyTarget::with_fd(params, fd),
            None => ApplyTarget::params(params),
        };
        pending.apply(phase, &mut target)?;
    }
    Ok(())
}

/// Applies the phases after Early to `fd`, putting a terminal back the way
/// it was found if one of them fails.
pub(crate) fn apply_to_fd(
    pending: &mut PendingOptions,
    params: &mut AddressParams,
    fd: BorrowedFd<'_>,
    tty: Option<&TtySnapshot>,
) -> Result<(), OpenError> {
    apply_phases(pending, &[Phase::Fd, Phase::Late, Phase::Open], params, Some(fd)).inspect_err(
        |_| {
            if let Some(snapshot) = tty {
                if let Err(e) = snapshot.restore() {
                    log::warn!("cannot restore terminal settings of fd {}: {}", snapshot.fd(), e);
                }
            }
        },
    )
}

/// Saves the attributes of `fd` if it is a terminal.
pub(crate) fn tty_snapshot(fd: RawFd) -> Option<TtySnapshot> {
    if !terminal::is_tty(fd) {
        return None;
    }
    TtySnapshot::save(fd)
        .inspect_err(|e| log::warn!("tcgetattr({}): {}", fd, e))
        .ok()
}

/// Applies the Early phase and returns the collected parameters.
pub(crate) fn early_params(pending: &mut PendingOptions) -> Result<AddressParams, OpenError> {
    let mut params = AddressParams::default();
    apply_phases(pending, &[Phase::Early], &mut params, None)?;
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::os::fd::{AsFd, AsRawFd};
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_parse_address_forms() {
        let parsed = parse("tcp-connect:localhost:80,nodelay,sndbuf=4096").unwrap();
        assert_eq!(parsed.name, "tcp-connect");
        assert_eq!(parsed.args, ["localhost", "80"]);
        assert_eq!(parsed.options, ["nodelay", "sndbuf=4096"]);
        assert_eq!(parsed.head, "tcp-connect:localhost:80");

        let parsed = parse("-").unwrap();
        assert_eq!(parsed.name, "-");
        assert!(parsed.args.is_empty());

        let parsed = parse("readline,prompt=> ").unwrap();
        assert_eq!(parsed.options, ["prompt=> "]);

        assert!(matches!(parse(""), Err(OpenError::Syntax(_))));
        assert!(matches!(parse(":x"), Err(OpenError::Syntax(_))));
    }

    #[test]
    fn test_registry_names_unique() {
        let mut names = HashSet::new();
        for d in ADDRESSES {
            assert!(names.insert(d.name), "duplicate address {}", d.name);
            assert!(d.min_args <= d.max_args);
        }
    }

    #[test]
    fn test_lookup_is_exact_and_case_insensitive() {
        assert_eq!(lookup("TCP").map(|d| d.name), Some("tcp"));
        assert!(lookup("tcp-conn").is_none());
        assert!(lookup("readlin").is_none());
    }

    #[test]
    fn test_unknown_address() {
        let err = resolve_and_open("bogus:1", Direction::ReadWrite).unwrap_err();
        assert!(matches!(err, OpenError::UnknownAddress(ref n) if n == "bogus"));
    }

    #[test]
    fn test_arity_one_below_and_one_above_fail_before_open() {
        let err = resolve_and_open("tcp-connect:localhost", Direction::ReadWrite).unwrap_err();
        assert_eq!(err.to_string(), "tcp-connect: 1 parameter(s) given, 2 required");

        let err = resolve_and_open("tcp-connect:localhost:1:2", Direction::ReadWrite).unwrap_err();
        assert!(matches!(err, OpenError::Arity { given: 3, .. }));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("never-created");
        let text = format!("open:{}:extra,creat", path.display());
        assert!(matches!(
            resolve_and_open(&text, Direction::ReadWrite),
            Err(OpenError::Arity { .. })
        ));
        assert!(!path.exists());
    }

    #[test]
    fn test_inapplicable_option_fails_before_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("never-created");
        let text = format!("open:{},creat,nodelay", path.display());
        let err = resolve_and_open(&text, Direction::ReadWrite).unwrap_err();
        assert!(matches!(err, OpenError::NotApplicable { ref option, .. } if option == "nodelay"));
        assert!(!path.exists());
    }

    #[test]
    fn test_capability_check() {
        let write_only = Capability {
            read: false,
            write: true,
        };
        assert!(write_only.allows(Direction::WriteOnly));
        assert!(!write_only.allows(Direction::ReadOnly));
        assert!(!write_only.allows(Direction::ReadWrite));
        assert!(Capability::READ_WRITE.allows(Direction::ReadOnly));
    }

    #[test]
    fn test_direction_error_message() {
        let err = OpenError::Direction {
            address: "x".into(),
            requested: Direction::ReadOnly.describe(),
        };
        assert_eq!(err.to_string(), "x: cannot be opened read-only");
    }

    #[test]
    fn test_failed_fd_option_puts_terminal_back() {
        let pair = portable_pty::native_pty_system()
            .openpty(portable_pty::PtySize::default())
            .unwrap();
        let master = pty::master_fd(pair.master.as_ref()).unwrap();
        let before = terminal::flags(master.as_raw_fd()).unwrap();
        let snapshot = TtySnapshot::save(master.as_raw_fd()).unwrap();

        let groups = GroupSet::FD.with(GroupSet::TERMIOS).with(GroupSet::SOCKET);
        let mut pending = PendingOptions::parse("pty", groups, &["raw", "sndbuf=4096"]).unwrap();
        let mut params = AddressParams::default();
        let err = apply_to_fd(&mut pending, &mut params, master.as_fd(), Some(&snapshot))
            .unwrap_err();

        assert!(err.to_string().contains("SO_SNDBUF"), "{err}");
        assert_eq!(terminal::flags(master.as_raw_fd()).unwrap(), before);
    }

    #[test]
    fn test_unrestorable_terminal_keeps_the_option_error() {
        let pair = portable_pty::native_pty_system()
            .openpty(portable_pty::PtySize::default())
            .unwrap();
        let master = pty::master_fd(pair.master.as_ref()).unwrap();
        let stale = TtySnapshot::save(master.as_raw_fd()).unwrap();
        drop(master);
        drop(pair);

        let (socket, _peer) = UnixStream::pair().unwrap();
        let mut pending =
            PendingOptions::parse("stdio", GroupSet::FD.with(GroupSet::TERMIOS), &["raw"]).unwrap();
        let mut params = AddressParams::default();
        let err = apply_to_fd(&mut pending, &mut params, socket.as_fd(), Some(&stale))
            .unwrap_err();

        assert!(err.to_string().contains("tcsetattr(raw)"), "{err}");
    }
}
