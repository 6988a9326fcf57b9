//! `stdio` / `-`: the process's standard input and output.

use std::io;
use std::os::fd::AsFd;

use super::OpenRequest;
use crate::endpoint::{Descriptors, Endpoint, Handle};
use crate::error::OpenError;
use crate::option::PendingOptions;

/// Opens fd 0 for reading and fd 1 for writing, as far as the direction
/// asks for them. Terminal options act on fd 0.
pub fn open(req: &OpenRequest<'_>, pending: &mut PendingOptions) -> Result<Endpoint, OpenError> {
    let mut params = super::early_params(pending)?;
    let tty = super::tty_snapshot(libc::STDIN_FILENO);
    super::apply_to_fd(pending, &mut params, io::stdin().as_fd(), tty.as_ref())?;

    let fds = Descriptors::Pair {
        read: req
            .direction
            .reads()
            .then_some(Handle::Std(libc::STDIN_FILENO)),
        write: req
            .direction
            .writes()
            .then_some(Handle::Std(libc::STDOUT_FILENO)),
    };
    Ok(Endpoint::new(req.label, fds)
        .with_tty(tty)
        .with_shutdown(req.descriptor.shutdown)
        .with_close(req.descriptor.close))
}

#[cfg(test)]
mod tests {
    use crate::address::{resolve_and_open, Direction};
    use crate::endpoint::ShutdownState;

    #[test]
    fn test_direction_narrows_descriptors() {
        let endpoint = resolve_and_open("-", Direction::ReadOnly).unwrap();
        assert_eq!(endpoint.read_fd(), Some(libc::STDIN_FILENO));
        assert_eq!(endpoint.write_fd(), None);

        let endpoint = resolve_and_open("STDIO", Direction::WriteOnly).unwrap();
        assert_eq!(endpoint.read_fd(), None);
        assert_eq!(endpoint.write_fd(), Some(libc::STDOUT_FILENO));
    }

    #[test]
    fn test_close_keeps_standard_streams() {
        let mut endpoint = resolve_and_open("stdio", Direction::ReadWrite).unwrap();
        endpoint.close();
        assert_eq!(endpoint.state(), ShutdownState::Closed);
        // SAFETY: F_GETFD only queries the descriptor.
        assert!(unsafe { libc::fcntl(libc::STDOUT_FILENO, libc::F_GETFD) } >= 0);
    }
}
