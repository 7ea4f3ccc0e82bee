//! Registration of the client library's socket with the tokio reactor.

use nix::poll::PollFlags;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tracing::trace;

/// Borrowed descriptor; the client library owns and closes it.
#[derive(Debug)]
struct SocketFd(RawFd);

impl AsRawFd for SocketFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

/// Watches the session's socket for the events the library asks for.
#[derive(Debug)]
pub(super) struct SocketWatch {
    fd: Option<AsyncFd<SocketFd>>,
    events: PollFlags,
}

impl SocketWatch {
    pub(super) fn new() -> Self {
        Self {
            fd: None,
            events: PollFlags::empty(),
        }
    }

    /// Follows the library's current descriptor and event mask.
    ///
    /// The descriptor is re-registered when it changes.
    pub(super) fn update(&mut self, fd: Option<RawFd>, events: PollFlags) -> io::Result<()> {
        let current = self.fd.as_ref().map(|registered| registered.get_ref().0);
        if current != fd {
            // Deregister before the new descriptor (which may reuse the
            // number) is registered.
            self.fd = None;
            if let Some(raw) = fd {
                trace!(fd = raw, "registering socket");
                self.fd = Some(AsyncFd::with_interest(
                    SocketFd(raw),
                    Interest::READABLE | Interest::WRITABLE,
                )?);
            }
        }
        self.events = events & (PollFlags::POLLIN | PollFlags::POLLOUT);
        Ok(())
    }

    /// Drops the registration. Must happen before the library closes the
    /// descriptor.
    pub(super) fn clear(&mut self) {
        self.fd = None;
        self.events = PollFlags::empty();
    }

    /// True if there is a descriptor and the library wants some event.
    pub(super) fn is_armed(&self) -> bool {
        self.fd.is_some() && !self.events.is_empty()
    }

    /// Waits until the socket is ready for one of the wanted events and
    /// returns the matching poll flags.
    pub(super) async fn ready(&self) -> io::Result<PollFlags> {
        let Some(fd) = &self.fd else {
            return std::future::pending().await;
        };
        let interest = match (
            self.events.contains(PollFlags::POLLIN),
            self.events.contains(PollFlags::POLLOUT),
        ) {
            (true, true) => Interest::READABLE | Interest::WRITABLE,
            (false, true) => Interest::WRITABLE,
            (true, false) => Interest::READABLE,
            (false, false) => return std::future::pending().await,
        };

        let mut guard = fd.ready(interest).await?;
        let ready = guard.ready();
        let mut revents = PollFlags::empty();
        if ready.is_readable() {
            revents |= PollFlags::POLLIN;
        }
        if ready.is_writable() {
            revents |= PollFlags::POLLOUT;
        }
        if ready.is_read_closed() || ready.is_write_closed() {
            revents |= PollFlags::POLLHUP;
        }
        // The service call consumes whatever made the socket ready.
        guard.clear_ready();
        Ok(revents)
    }
}
