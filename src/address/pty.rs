//! `pty`: a fresh pseudo-terminal. The relay talks to the master side;
//! another program attaches to the slave device, optionally through the
//! symlink named by `link`.

use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use portable_pty::{native_pty_system, MasterPty, PtySize};

use super::OpenRequest;
use crate::endpoint::{Descriptors, Endpoint, Handle};
use crate::error::{IoContext, OpenError};
use crate::option::PendingOptions;

/// Duplicates the master descriptor so it outlives the `MasterPty` box.
pub(crate) fn master_fd(master: &dyn MasterPty) -> Result<OwnedFd, OpenError> {
    let raw = master.as_raw_fd().ok_or_else(|| {
        OpenError::resource("pty master", io::Error::from(io::ErrorKind::Unsupported))
    })?;
    // SAFETY: `master` keeps `raw` open for the duration of the borrow.
    let borrowed = unsafe { BorrowedFd::borrow_raw(raw) };
    borrowed.try_clone_to_owned().open_context(|| "dup(pty master)")
}

/// Opens a pseudo-terminal pair and keeps the slave open until close.
pub fn open(req: &OpenRequest<'_>, pending: &mut PendingOptions) -> Result<Endpoint, OpenError> {
    let mut params = super::early_params(pending)?;
    let pair = native_pty_system()
        .openpty(PtySize::default())
        .map_err(|e| OpenError::resource("openpty", io::Error::other(e)))?;
    let master = master_fd(pair.master.as_ref())?;
    super::apply_to_fd(pending, &mut params, master.as_fd(), None)?;

    let device = pair.master.tty_name();
    match &device {
        Some(path) => log::info!("{}: slave device is {}", req.label, path.display()),
        None => log::warn!("{}: slave device name unknown", req.label),
    }

    let mut endpoint = Endpoint::new(req.label, Descriptors::Single(Handle::Owned(master)))
        .with_pty_slave(pair.slave)
        .with_shutdown(req.descriptor.shutdown)
        .with_close(req.descriptor.close);
    if let Some(link) = params.pty.link.take() {
        let device = device.ok_or_else(|| {
            OpenError::resource("link", io::Error::from(io::ErrorKind::NotFound))
        })?;
        std::os::unix::fs::symlink(&device, &link).open_context(|| {
            format!("symlink(\"{}\", \"{}\")", device.display(), link.display())
        })?;
        log::debug!("{}: linked {} to {}", req.label, link.display(), device.display());
        endpoint = endpoint.unlink_on_close(link);
    }
    Ok(endpoint)
}
