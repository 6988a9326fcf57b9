//! `open:PATH`: a file or device opened with `open(2)`.

use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use super::OpenRequest;
use crate::endpoint::{Descriptors, Endpoint, Handle};
use crate::error::{IoContext, OpenError};
use crate::option::{NamedParams, PendingOptions};

const DEFAULT_PERM: u32 = 0o666;

/// Removes `path` ahead of creating it again. A missing path is fine.
pub(crate) fn unlink_early(path: &Path, named: &NamedParams) -> Result<(), OpenError> {
    if !named.unlink_early {
        return Ok(());
    }
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => {
            Err(OpenError::resource(format!("unlink(\"{}\")", path.display()), e))
        }
        _ => Ok(()),
    }
}

/// Opens the path named by the first argument.
pub fn open(req: &OpenRequest<'_>, pending: &mut PendingOptions) -> Result<Endpoint, OpenError> {
    let mut params = super::early_params(pending)?;
    let path = PathBuf::from(req.arg(0));
    unlink_early(&path, &params.named)?;

    let flags = &params.open;
    let file = OpenOptions::new()
        .read(req.direction.reads())
        .write(req.direction.writes())
        .append(flags.append)
        .create(flags.creat && !flags.excl)
        .create_new(flags.creat && flags.excl)
        .truncate(flags.trunc)
        .mode(params.named.perm.unwrap_or(DEFAULT_PERM))
        .custom_flags(libc::O_NOCTTY)
        .open(&path)
        .open_context(|| format!("open(\"{}\")", path.display()))?;
    let fd = OwnedFd::from(file);
    log::debug!("{}: opened {} as fd {}", req.label, path.display(), fd.as_raw_fd());

    let tty = super::tty_snapshot(fd.as_raw_fd());
    super::apply_to_fd(pending, &mut params, fd.as_fd(), tty.as_ref())?;

    let mut endpoint = Endpoint::new(req.label, Descriptors::Single(Handle::Owned(fd)))
        .with_tty(tty)
        .with_shutdown(req.descriptor.shutdown)
        .with_close(req.descriptor.close);
    if params.named.unlink_close {
        endpoint = endpoint.unlink_on_close(path);
    }
    Ok(endpoint)
}
