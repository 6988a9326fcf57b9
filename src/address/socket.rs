//! Socket addresses: TCP and UDP over IP, stream sockets in the UNIX domain.
//!
//! Socket options in the `Fd` phase are applied to the fresh socket before
//! it is bound or connected; for listening addresses that is the listener.
//! A listening address accepts exactly one connection and then drops the
//! listener.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::os::fd::{AsFd, AsRawFd};
use std::path::{Path, PathBuf};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use super::OpenRequest;
use crate::constants::DEFAULT_BACKLOG;
use crate::endpoint::Endpoint;
use crate::error::{IoContext, OpenError};
use crate::option::{AddressParams, PendingOptions, Phase};
use crate::signals;

// ============================================================================
// Address resolution
// ============================================================================

fn parse_port(req: &OpenRequest<'_>, text: &str) -> Result<u16, OpenError> {
    text.parse()
        .map_err(|e| OpenError::Syntax(format!("{}: invalid port \"{text}\": {e}", req.label)))
}

/// First address `host` resolves to. Only numeric ports are accepted.
fn resolve(host: &str, port: u16) -> Result<SocketAddr, OpenError> {
    (host, port)
        .to_socket_addrs()
        .open_context(|| format!("getaddrinfo(\"{host}\")"))?
        .next()
        .ok_or_else(|| {
            OpenError::resource(
                format!("getaddrinfo(\"{host}\")"),
                io::Error::from(io::ErrorKind::NotFound),
            )
        })
}

/// Local address named by the `bind` option, in the family of `peer`.
///
/// The option is `host` or `host:port`; a missing port lets the kernel pick.
fn bind_address(text: &str, peer: &SocketAddr) -> Result<SocketAddr, OpenError> {
    let (host, port) = match text.rsplit_once(':') {
        Some((host, port)) => (host, port),
        None => (text, "0"),
    };
    let port: u16 = port.parse().map_err(|e| OpenError::TypeMismatch {
        option: "bind".to_string(),
        reason: format!("invalid port \"{port}\": {e}"),
    })?;
    let mut candidates = (host, port)
        .to_socket_addrs()
        .open_context(|| format!("getaddrinfo(\"{host}\")"))?;
    candidates
        .find(|a| a.is_ipv4() == peer.is_ipv4())
        .ok_or_else(|| {
            OpenError::resource(
                format!("bind address \"{text}\""),
                io::Error::from(io::ErrorKind::AddrNotAvailable),
            )
        })
}

// ============================================================================
// Shared steps
// ============================================================================

fn new_socket(domain: Domain, kind: Type, protocol: Option<Protocol>) -> Result<Socket, OpenError> {
    Socket::new(domain, kind, protocol).open_context(|| "socket")
}

/// Applies the `Fd` phase to a socket that is not bound or connected yet.
fn apply_fd_phase(
    pending: &mut PendingOptions,
    params: &mut AddressParams,
    socket: &Socket,
) -> Result<(), OpenError> {
    super::apply_phases(pending, &[Phase::Fd], params, Some(socket.as_fd()))
}

fn finish(
    req: &OpenRequest<'_>,
    pending: &mut PendingOptions,
    mut params: AddressParams,
    socket: Socket,
) -> Result<Endpoint, OpenError> {
    super::apply_phases(pending, &[Phase::Late, Phase::Open], &mut params, Some(socket.as_fd()))?;
    Ok(Endpoint::from_socket(req.label, socket)
        .with_shutdown(req.descriptor.shutdown)
        .with_close(req.descriptor.close))
}

fn describe(addr: &SockAddr) -> String {
    if let Some(ip) = addr.as_socket() {
        ip.to_string()
    } else if let Some(path) = addr.as_pathname() {
        path.display().to_string()
    } else {
        "unnamed peer".to_string()
    }
}

/// Waits for one connection on `listener`.
///
/// The wait goes through [`signals::wait_readable`] so a termination signal
/// ends it even though the kernel restarts interrupted calls.
fn accept_one(req: &OpenRequest<'_>, listener: &Socket) -> Result<Socket, OpenError> {
    log::info!("{}: waiting for a connection", req.label);
    loop {
        signals::wait_readable(listener.as_raw_fd()).map_err(|e| {
            let context = if e.kind() == io::ErrorKind::Interrupted { "accept" } else { "poll" };
            OpenError::resource(context, e)
        })?;
        match listener.accept() {
            Ok((socket, peer)) => {
                log::info!("{}: accepted connection from {}", req.label, describe(&peer));
                return Ok(socket);
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
                ) => {}
            Err(e) => return Err(OpenError::resource("accept", e)),
        }
    }
}

fn backlog(params: &AddressParams) -> i32 {
    params
        .socket
        .backlog
        .map_or(DEFAULT_BACKLOG, |b| i32::try_from(b).unwrap_or(i32::MAX))
}

// ============================================================================
// IP
// ============================================================================

fn connect_ip(
    req: &OpenRequest<'_>,
    pending: &mut PendingOptions,
    kind: Type,
    protocol: Protocol,
) -> Result<Endpoint, OpenError> {
    let mut params = super::early_params(pending)?;
    let port = parse_port(req, req.arg(1))?;
    let peer = resolve(req.arg(0), port)?;

    let socket = new_socket(Domain::for_address(peer), kind, Some(protocol))?;
    apply_fd_phase(pending, &mut params, &socket)?;
    if let Some(local) = &params.socket.bind {
        let local = bind_address(local, &peer)?;
        socket
            .bind(&local.into())
            .open_context(|| format!("bind({local})"))?;
    }
    socket
        .connect(&peer.into())
        .open_context(|| format!("connect({peer})"))?;
    log::info!("{}: connected to {}", req.label, peer);
    finish(req, pending, params, socket)
}

/// `tcp-connect:HOST:PORT`.
pub fn open_tcp_connect(
    req: &OpenRequest<'_>,
    pending: &mut PendingOptions,
) -> Result<Endpoint, OpenError> {
    connect_ip(req, pending, Type::STREAM, Protocol::TCP)
}

/// `udp-connect:HOST:PORT`.
pub fn open_udp_connect(
    req: &OpenRequest<'_>,
    pending: &mut PendingOptions,
) -> Result<Endpoint, OpenError> {
    connect_ip(req, pending, Type::DGRAM, Protocol::UDP)
}

/// `tcp-listen:PORT`. The `bind` option picks the local host.
pub fn open_tcp_listen(
    req: &OpenRequest<'_>,
    pending: &mut PendingOptions,
) -> Result<Endpoint, OpenError> {
    let mut params = super::early_params(pending)?;
    let port = parse_port(req, req.arg(0))?;
    let local = match &params.socket.bind {
        Some(host) => resolve(host, port)?,
        None => SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
    };

    let listener = new_socket(Domain::for_address(local), Type::STREAM, Some(Protocol::TCP))?;
    apply_fd_phase(pending, &mut params, &listener)?;
    listener
        .bind(&local.into())
        .open_context(|| format!("bind({local})"))?;
    listener
        .listen(backlog(&params))
        .open_context(|| format!("listen({local})"))?;
    let socket = accept_one(req, &listener)?;
    drop(listener);
    finish(req, pending, params, socket)
}

// ============================================================================
// UNIX domain
// ============================================================================

fn unix_address(path: &Path) -> Result<SockAddr, OpenError> {
    SockAddr::unix(path).open_context(|| format!("socket path \"{}\"", path.display()))
}

/// `unix-connect:PATH`.
pub fn open_unix_connect(
    req: &OpenRequest<'_>,
    pending: &mut PendingOptions,
) -> Result<Endpoint, OpenError> {
    let mut params = super::early_params(pending)?;
    let path = PathBuf::from(req.arg(0));
    let addr = unix_address(&path)?;

    let socket = new_socket(Domain::UNIX, Type::STREAM, None)?;
    apply_fd_phase(pending, &mut params, &socket)?;
    socket
        .connect(&addr)
        .open_context(|| format!("connect(\"{}\")", path.display()))?;
    log::info!("{}: connected to {}", req.label, path.display());

    let unlink = params.named.unlink_close;
    let endpoint = finish(req, pending, params, socket)?;
    Ok(if unlink {
        endpoint.unlink_on_close(path)
    } else {
        endpoint
    })
}

/// `unix-listen:PATH`. The socket file is removed again on close.
pub fn open_unix_listen(
    req: &OpenRequest<'_>,
    pending: &mut PendingOptions,
) -> Result<Endpoint, OpenError> {
    let mut params = super::early_params(pending)?;
    let path = PathBuf::from(req.arg(0));
    let addr = unix_address(&path)?;
    super::file::unlink_early(&path, &params.named)?;

    let listener = new_socket(Domain::UNIX, Type::STREAM, None)?;
    apply_fd_phase(pending, &mut params, &listener)?;
    listener
        .bind(&addr)
        .open_context(|| format!("bind(\"{}\")", path.display()))?;
    let bound = scopeguard::guard(path, |path| {
        let _ = std::fs::remove_file(path);
    });
    if let Some(perm) = params.named.perm {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&*bound, std::fs::Permissions::from_mode(perm))
            .open_context(|| format!("chmod(\"{}\")", bound.display()))?;
    }
    listener
        .listen(backlog(&params))
        .open_context(|| format!("listen(\"{}\")", bound.display()))?;
    let socket = accept_one(req, &listener)?;
    drop(listener);

    let endpoint = finish(req, pending, params, socket)?;
    Ok(endpoint.unlink_on_close(scopeguard::ScopeGuard::into_inner(bound)))
}
