//! `exec:COMMAND` and `system:COMMAND`: a child process.
//!
//! `exec` splits the command on whitespace and runs it directly; `system`
//! hands it to `/bin/sh -c`. The child talks over two pipes, or over a
//! pseudo-terminal with the `pty` option. Closing the endpoint closes the
//! child's input and reaps it.

use std::io;
use std::os::fd::OwnedFd;
use std::process::{Command, Stdio};

use portable_pty::{native_pty_system, CommandBuilder, PtySize};

use super::OpenRequest;
use crate::endpoint::{Descriptors, Endpoint, Handle};
use crate::error::{IoContext, OpenError};
use crate::option::{ExecParams, PendingOptions, Phase};
use crate::process::ChildProcess;

const SHELL: &str = "/bin/sh";

/// Runs the command line directly.
pub fn open_exec(
    req: &OpenRequest<'_>,
    pending: &mut PendingOptions,
) -> Result<Endpoint, OpenError> {
    let argv: Vec<String> = req.arg(0).split_whitespace().map(String::from).collect();
    if argv.is_empty() {
        return Err(OpenError::Syntax(req.label.to_string()));
    }
    spawn(req, pending, &argv)
}

/// Runs the command through the shell.
pub fn open_system(
    req: &OpenRequest<'_>,
    pending: &mut PendingOptions,
) -> Result<Endpoint, OpenError> {
    let argv = [SHELL.to_string(), "-c".to_string(), req.arg(0).to_string()];
    spawn(req, pending, &argv)
}

fn spawn(
    req: &OpenRequest<'_>,
    pending: &mut PendingOptions,
    argv: &[String],
) -> Result<Endpoint, OpenError> {
    let mut params = super::early_params(pending)?;
    let (fds, child) = if params.exec.pty {
        spawn_on_pty(argv, &params.exec)?
    } else {
        spawn_piped(req, argv, &params.exec)?
    };
    let child = scopeguard::guard(child, ChildProcess::discard);
    log::debug!("{}: started child {:?}", req.label, child.id());

    super::apply_phases(
        pending,
        &[Phase::Fd, Phase::Late, Phase::Open],
        &mut params,
        fds.primary(),
    )?;

    Ok(Endpoint::new(req.label, fds)
        .with_shutdown(req.descriptor.shutdown)
        .with_child(scopeguard::ScopeGuard::into_inner(child))
        .with_close(req.descriptor.close))
}

fn spawn_piped(
    req: &OpenRequest<'_>,
    argv: &[String],
    params: &ExecParams,
) -> Result<(Descriptors, ChildProcess), OpenError> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| OpenError::Syntax(req.label.to_string()))?;
    let pipe_if = |wanted: bool| if wanted { Stdio::piped() } else { Stdio::null() };

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(pipe_if(req.direction.writes()))
        .stdout(pipe_if(req.direction.reads()));
    if let Some(dir) = &params.chdir {
        command.current_dir(dir);
    }
    let mut child = command
        .spawn()
        .open_context(|| format!("execvp(\"{program}\")"))?;

    let read = child.stdout.take().map(|fd| Handle::Owned(OwnedFd::from(fd)));
    let write = child.stdin.take().map(|fd| Handle::Owned(OwnedFd::from(fd)));
    Ok((Descriptors::Pair { read, write }, ChildProcess::Piped(child)))
}

fn pty_error(context: &str, e: anyhow::Error) -> OpenError {
    OpenError::resource(context, io::Error::other(e))
}

fn spawn_on_pty(
    argv: &[String],
    params: &ExecParams,
) -> Result<(Descriptors, ChildProcess), OpenError> {
    let pair = native_pty_system()
        .openpty(PtySize::default())
        .map_err(|e| pty_error("openpty", e))?;

    let mut command = CommandBuilder::from_argv(argv.iter().map(Into::into).collect());
    match &params.chdir {
        Some(dir) => command.cwd(dir),
        None => {
            if let Ok(cwd) = std::env::current_dir() {
                command.cwd(cwd);
            }
        }
    }
    let child = pair
        .slave
        .spawn_command(command)
        .map_err(|e| pty_error("spawn on pty", e))?;
    let child = scopeguard::guard(ChildProcess::Pty(child), ChildProcess::discard);
    drop(pair.slave);

    let master = super::pty::master_fd(pair.master.as_ref())?;
    Ok((
        Descriptors::Single(Handle::Owned(master)),
        scopeguard::ScopeGuard::into_inner(child),
    ))
}
