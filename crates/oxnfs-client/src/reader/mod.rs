//! Reading one file over a shared connection.
//!
//! [`NfsFileReader`] turns an `nfs://` URI into an opened, stat'ed file and
//! then serves reads from it. It drives this state machine:
//!
//! ```text
//!  Initial ──open(uri)──► Defer ──next_event──► Mount ──lease ready──► Open
//!                                                                       │
//!        Idle ◄──────────────── stat: regular file ◄──────── Stat ◄─────┘
//!        │  ▲
//!   read │  │ data / error / cancel_read
//!        ▼  │
//!        Read
//! ```
//!
//! `close()` returns to `Initial` from any state. Progress is made only while
//! [`NfsFileReader::next_event`] is polled; `open()` never mounts by itself.
//! Losing the connection after the mount cancels whatever is outstanding,
//! forgets the file handle (it belonged to the lost session) and returns to
//! `Initial`.

mod handle;

pub use handle::ReaderHandle;

use crate::connection::{NfsConnection, PendingOp};
use crate::context::{FileHandle, NfsStat};
use crate::error::{NfsError, NfsResult};
use crate::lease::{Lease, LeaseEvent};
use crate::manager::ConnectionRegistry;
use crate::uri::NfsUri;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Reader state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    /// Not opened.
    Initial,
    /// URI accepted; the mount starts on the next poll.
    Defer,
    /// Waiting for the connection to be mounted.
    Mount,
    /// Waiting for the open reply.
    Open,
    /// Waiting for the stat reply.
    Stat,
    /// Opened; no read outstanding.
    Idle,
    /// A read is outstanding.
    Read,
}

/// Progress reported by [`NfsFileReader::next_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderEvent {
    /// The file is open and has `size` bytes.
    Opened {
        /// File size from stat.
        size: u64,
    },
    /// A read finished. Empty at end of file.
    Data(Bytes),
    /// The current step failed. The reader is back in `Initial`, except for
    /// failed reads, which leave it `Idle`.
    Error(NfsError),
}

enum Outstanding {
    None,
    Open(PendingOp<FileHandle>),
    Stat(PendingOp<NfsStat>),
    Read(PendingOp<Bytes>),
}

enum Wakeup {
    Lease(Option<LeaseEvent>),
    Opened(NfsResult<FileHandle>),
    Stat(NfsResult<NfsStat>),
    Read(NfsResult<Bytes>),
}

/// Opens and reads one file.
pub struct NfsFileReader {
    registry: ConnectionRegistry,
    state: ReaderState,
    uri: Option<NfsUri>,
    connection: Option<NfsConnection>,
    lease: Option<Lease>,
    fh: Option<FileHandle>,
    size: Option<u64>,
    outstanding: Outstanding,
}

impl std::fmt::Debug for NfsFileReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NfsFileReader")
            .field("state", &self.state)
            .field("uri", &self.uri)
            .field("fh", &self.fh)
            .finish_non_exhaustive()
    }
}

impl NfsFileReader {
    /// Creates a closed reader that takes its connections from `registry`.
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self {
            registry,
            state: ReaderState::Initial,
            uri: None,
            connection: None,
            lease: None,
            fh: None,
            size: None,
            outstanding: Outstanding::None,
        }
    }

    /// Current state.
    pub fn state(&self) -> ReaderState {
        self.state
    }

    /// The parsed URI while the reader is open.
    pub fn uri(&self) -> Option<&NfsUri> {
        self.uri.as_ref()
    }

    /// File size, once the stat has succeeded.
    pub fn size(&self) -> Option<u64> {
        self.size
    }

    /// Accepts `uri` for opening.
    ///
    /// Malformed URIs fail immediately and leave the reader closed. The
    /// connection is looked up and mounted on the next call to
    /// [`next_event`](Self::next_event).
    pub fn open(&mut self, uri: &str) -> NfsResult<()> {
        if self.state != ReaderState::Initial {
            return Err(NfsError::InvalidState("open() requires a closed reader"));
        }
        let uri = NfsUri::parse(uri, self.registry.base_paths())?;
        debug!(server = %uri.server, export = %uri.export, path = %uri.path, "open scheduled");
        self.uri = Some(uri);
        self.state = ReaderState::Defer;
        Ok(())
    }

    /// Starts reading `size` bytes at `offset`. Only valid while `Idle`.
    pub fn read(&mut self, offset: u64, size: u32) -> NfsResult<()> {
        if self.state != ReaderState::Idle {
            return Err(NfsError::InvalidState("read() requires an idle reader"));
        }
        let (Some(connection), Some(fh)) = (&self.connection, self.fh) else {
            return Err(NfsError::InvalidState("idle reader without a file handle"));
        };
        trace!(%fh, offset, size, "read");
        self.outstanding = Outstanding::Read(connection.read(fh, offset, size));
        self.state = ReaderState::Read;
        Ok(())
    }

    /// Abandons the outstanding read, if any.
    pub fn cancel_read(&mut self) {
        if self.state != ReaderState::Read {
            return;
        }
        if let Outstanding::Read(op) = std::mem::replace(&mut self.outstanding, Outstanding::None) {
            op.cancel();
        }
        self.state = ReaderState::Idle;
    }

    /// Closes the file and releases the connection. Safe in any state and
    /// idempotent.
    pub fn close(&mut self) {
        if self.state == ReaderState::Initial {
            return;
        }
        debug!(state = ?self.state, "closing reader");
        self.cancel_or_close();
        self.reset();
    }

    /// Drives the reader until something reportable happens.
    ///
    /// Returns `None` when the reader is closed. While `Idle` it only
    /// completes if the connection is lost. Cancel safe: dropping the
    /// future loses no progress.
    pub async fn next_event(&mut self) -> Option<ReaderEvent> {
        loop {
            match self.state {
                ReaderState::Initial => return None,
                ReaderState::Defer => {
                    if let Err(e) = self.start_mount() {
                        self.reset();
                        return Some(ReaderEvent::Error(e));
                    }
                }
                _ => {
                    if let Some(event) = self.wait().await {
                        return Some(event);
                    }
                }
            }
        }
    }

    fn start_mount(&mut self) -> NfsResult<()> {
        let Some(uri) = &self.uri else {
            return Err(NfsError::InvalidState("deferred open without a URI"));
        };
        let connection = self.registry.get(&uri.server, &uri.export)?;
        let lease = connection.add_lease()?;
        self.connection = Some(connection);
        self.lease = Some(lease);
        self.state = ReaderState::Mount;
        Ok(())
    }

    async fn wait(&mut self) -> Option<ReaderEvent> {
        if self.lease.is_none() {
            return Some(self.fail(NfsError::InvalidState("no lease")));
        }
        let wakeup = {
            let Self {
                lease, outstanding, ..
            } = &mut *self;
            let Some(lease) = lease.as_mut() else {
                return None;
            };
            tokio::select! {
                biased;
                event = lease.recv() => Wakeup::Lease(event),
                wakeup = wait_outstanding(outstanding) => wakeup,
            }
        };

        match wakeup {
            Wakeup::Lease(Some(LeaseEvent::Ready)) => {
                self.on_mount_ready();
                None
            }
            Wakeup::Lease(Some(LeaseEvent::Failed(e) | LeaseEvent::Disconnected(e))) => {
                Some(self.on_connection_lost(&e))
            }
            Wakeup::Lease(None) => Some(self.on_connection_lost(&Arc::new(NfsError::Shutdown))),
            Wakeup::Opened(result) => self.on_open(result),
            Wakeup::Stat(result) => Some(self.on_stat(result)),
            Wakeup::Read(result) => Some(self.on_read(result)),
        }
    }

    fn on_mount_ready(&mut self) {
        if self.state != ReaderState::Mount {
            return;
        }
        let (Some(connection), Some(uri)) = (&self.connection, &self.uri) else {
            return;
        };
        trace!(path = %uri.path, "mounted, opening");
        self.outstanding = Outstanding::Open(connection.open(&uri.path, libc::O_RDONLY));
        self.state = ReaderState::Open;
    }

    fn on_open(&mut self, result: NfsResult<FileHandle>) -> Option<ReaderEvent> {
        self.outstanding = Outstanding::None;
        match result {
            Ok(fh) => {
                self.fh = Some(fh);
                if let Some(connection) = &self.connection {
                    self.outstanding = Outstanding::Stat(connection.fstat(fh));
                }
                self.state = ReaderState::Stat;
                None
            }
            Err(e) => Some(self.fail(e)),
        }
    }

    fn on_stat(&mut self, result: NfsResult<NfsStat>) -> ReaderEvent {
        self.outstanding = Outstanding::None;
        match result {
            Ok(stat) if stat.is_regular() => {
                self.size = Some(stat.size);
                self.state = ReaderState::Idle;
                ReaderEvent::Opened { size: stat.size }
            }
            Ok(stat) => {
                debug!(mode = format_args!("{:o}", stat.mode), "not a regular file");
                self.fail(NfsError::NotRegularFile)
            }
            Err(e) => self.fail(e),
        }
    }

    fn on_read(&mut self, result: NfsResult<Bytes>) -> ReaderEvent {
        self.outstanding = Outstanding::None;
        self.state = ReaderState::Idle;
        match result {
            Ok(data) => ReaderEvent::Data(data),
            Err(e) => ReaderEvent::Error(e),
        }
    }

    /// Releases the handle (if any) and the lease, then reports `error`.
    fn fail(&mut self, error: NfsError) -> ReaderEvent {
        debug!(state = ?self.state, error = %error, "reader failed");
        self.cancel_or_close();
        self.reset();
        ReaderEvent::Error(error)
    }

    fn on_connection_lost(&mut self, error: &Arc<NfsError>) -> ReaderEvent {
        warn!(state = ?self.state, error = %error, "connection lost");
        // The handle died with the session; closing it would hit the next one.
        if let Some(fh) = self.fh.take() {
            debug!(%fh, "forgetting handle of the lost session");
        }
        self.fail((**error).clone())
    }

    /// Abandons whatever is outstanding and closes the file handle.
    fn cancel_or_close(&mut self) {
        let outstanding = std::mem::replace(&mut self.outstanding, Outstanding::None);
        let fh = self.fh.take();
        match (outstanding, fh) {
            (Outstanding::Open(op), _) => op.cancel(),
            (Outstanding::Stat(op), Some(fh)) => op.cancel_and_close(fh),
            (Outstanding::Read(op), Some(fh)) => op.cancel_and_close(fh),
            (Outstanding::Stat(op), None) => op.cancel(),
            (Outstanding::Read(op), None) => op.cancel(),
            (Outstanding::None, Some(fh)) => {
                if let Some(connection) = &self.connection {
                    connection.close(fh);
                }
            }
            (Outstanding::None, None) => {}
        }
    }

    fn reset(&mut self) {
        if let Some(lease) = self.lease.take() {
            lease.release();
        }
        self.outstanding = Outstanding::None;
        self.connection = None;
        self.uri = None;
        self.fh = None;
        self.size = None;
        self.state = ReaderState::Initial;
    }
}

impl Drop for NfsFileReader {
    fn drop(&mut self) {
        self.close();
    }
}

async fn wait_outstanding(outstanding: &mut Outstanding) -> Wakeup {
    match outstanding {
        Outstanding::None => std::future::pending().await,
        Outstanding::Open(op) => Wakeup::Opened(op.await),
        Outstanding::Stat(op) => Wakeup::Stat(op.await),
        Outstanding::Read(op) => Wakeup::Read(op.await),
    }
}
