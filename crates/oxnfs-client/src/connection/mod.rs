//! Shared connection to one NFS export.
//!
//! An [`NfsConnection`] is a cheap, cloneable handle to a task that owns the
//! client session for one `(server, export)` pair. The task is the only
//! place the session, the lease lists and the callback registry are touched;
//! handles talk to it over an unbounded command channel.
//!
//! # Architecture
//!
//! ```text
//!  NfsConnection ──┐                          ┌──► NfsContext (client library)
//!  Lease (weak) ───┼──► Command channel ──► ConnectionActor ──► SocketWatch (AsyncFd)
//!  PendingOp (weak)┘                          └──► mount deadline
//! ```
//!
//! # Mount lifecycle
//!
//! ```text
//!  Initial ──lease added──► Waiting ──mount ok──► Finished
//!     ▲                        │                     │
//!     └──── failure/timeout ───┴──── socket error ───┘
//! ```
//!
//! Mounting is never started from inside the command that registered a
//! lease; the actor runs deferred work once the current event is handled.

mod actor;
mod socket;

use crate::callback::{CallbackId, ReplySender};
use crate::config::ConnectionConfig;
use crate::context::{ContextFactory, FileHandle, FromReply, NfsDirectory, NfsStat, Reply};
use crate::error::{NfsError, NfsResult};
use crate::lease::{Lease, LeaseEvent, LeaseId};
use actor::ConnectionActor;
use bytes::Bytes;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// State of the mount state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountState {
    /// No session is mounted or being mounted.
    Initial,
    /// A mount request is in flight.
    Waiting,
    /// The session is mounted.
    Finished,
}

/// Snapshot of a connection's internal state.
#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    /// Current mount state.
    pub mount_state: MountState,
    /// Leases waiting for the mount to finish.
    pub new_leases: usize,
    /// Leases on the mounted session.
    pub active_leases: usize,
    /// Operations issued and not yet completed (cancelled ones included).
    pub pending_callbacks: usize,
    /// The most recent mount failure, until the next successful mount.
    pub last_mount_error: Option<Arc<NfsError>>,
}

/// An operation on the mounted session.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// stat(2), following symlinks.
    Stat { path: String },
    /// lstat(2).
    Lstat { path: String },
    /// Open a directory for listing.
    OpenDirectory { path: String },
    /// open(2) with the given flags.
    Open { path: String, flags: i32 },
    /// fstat(2) on an opened handle.
    Fstat { fh: FileHandle },
    /// pread(2) on an opened handle.
    Read { fh: FileHandle, offset: u64, size: u32 },
}

impl Operation {
    /// True if a successful completion yields a file handle.
    pub fn is_open(&self) -> bool {
        matches!(self, Operation::Open { .. })
    }
}

/// Messages from handles to the connection task.
pub(crate) enum Command {
    AddLease {
        id: LeaseId,
        events: mpsc::UnboundedSender<LeaseEvent>,
    },
    RemoveLease {
        id: LeaseId,
    },
    Operation {
        id: CallbackId,
        op: Operation,
        reply: ReplySender,
    },
    Cancel {
        id: CallbackId,
    },
    CancelAndClose {
        id: CallbackId,
        fh: FileHandle,
    },
    Close {
        fh: FileHandle,
    },
    Status {
        reply: oneshot::Sender<ConnectionStatus>,
    },
}

struct ConnectionInner {
    server: String,
    export: String,
    commands: mpsc::UnboundedSender<Command>,
}

/// Handle to the shared connection for one `(server, export)` pair.
///
/// Clones refer to the same connection. The connection task exits and
/// destroys the session once every handle is dropped.
#[derive(Clone)]
pub struct NfsConnection {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for NfsConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NfsConnection")
            .field("server", &self.inner.server)
            .field("export", &self.inner.export)
            .finish_non_exhaustive()
    }
}

impl NfsConnection {
    /// Creates the session and spawns the connection task on the current
    /// tokio runtime.
    ///
    /// Fails if no runtime is available or the factory cannot create the
    /// initial session.
    pub fn spawn(
        server: &str,
        export: &str,
        factory: Arc<dyn ContextFactory>,
        config: ConnectionConfig,
    ) -> NfsResult<Self> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| NfsError::NoRuntime)?;
        let context = factory.create(server, export)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = ConnectionActor::new(server, export, factory, context, config);
        runtime.spawn(actor.run(rx));
        debug!(server, export, "connection created");
        Ok(Self {
            inner: Arc::new(ConnectionInner {
                server: server.to_string(),
                export: export.to_string(),
                commands: tx,
            }),
        })
    }

    /// The server this connection talks to.
    pub fn server(&self) -> &str {
        &self.inner.server
    }

    /// The export this connection mounts.
    pub fn export(&self) -> &str {
        &self.inner.export
    }

    fn send(&self, command: Command) -> NfsResult<()> {
        self.inner
            .commands
            .send(command)
            .map_err(|_| NfsError::Shutdown)
    }

    /// Registers interest in the mounted session.
    ///
    /// If nothing is mounted yet a mount is started after the registration
    /// has been processed; if the session is already mounted the lease is
    /// notified without mounting again.
    pub fn add_lease(&self) -> NfsResult<Lease> {
        let id = LeaseId::next();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.send(Command::AddLease {
            id,
            events: events_tx,
        })?;
        Ok(Lease::new(id, events_rx, self.inner.commands.downgrade()))
    }

    /// Issues `op` under the caller-chosen identity `id`.
    ///
    /// The identity must not already be pending on this connection; a
    /// duplicate resolves with [`NfsError::DuplicateCallback`].
    pub fn submit<T: FromReply>(&self, id: CallbackId, op: Operation) -> PendingOp<T> {
        let (reply, rx) = oneshot::channel();
        if let Err(mpsc::error::SendError(Command::Operation { reply, .. })) =
            self.inner.commands.send(Command::Operation { id, op, reply })
        {
            let _ = reply.send(Err(NfsError::Shutdown));
        }
        PendingOp::new(id, rx, self.inner.commands.downgrade())
    }

    /// Requests the attributes of `path`.
    pub fn stat(&self, path: &str) -> PendingOp<NfsStat> {
        self.submit(
            CallbackId::next(),
            Operation::Stat {
                path: path.to_string(),
            },
        )
    }

    /// Requests the attributes of `path` without following a final symlink.
    pub fn lstat(&self, path: &str) -> PendingOp<NfsStat> {
        self.submit(
            CallbackId::next(),
            Operation::Lstat {
                path: path.to_string(),
            },
        )
    }

    /// Opens a directory listing.
    pub fn open_directory(&self, path: &str) -> PendingOp<NfsDirectory> {
        self.submit(
            CallbackId::next(),
            Operation::OpenDirectory {
                path: path.to_string(),
            },
        )
    }

    /// Opens a file.
    pub fn open(&self, path: &str, flags: i32) -> PendingOp<FileHandle> {
        self.submit(
            CallbackId::next(),
            Operation::Open {
                path: path.to_string(),
                flags,
            },
        )
    }

    /// Requests the attributes of an opened file.
    pub fn fstat(&self, fh: FileHandle) -> PendingOp<NfsStat> {
        self.submit(CallbackId::next(), Operation::Fstat { fh })
    }

    /// Reads up to `size` bytes at `offset`.
    pub fn read(&self, fh: FileHandle, offset: u64, size: u32) -> PendingOp<Bytes> {
        self.submit(CallbackId::next(), Operation::Read { fh, offset, size })
    }

    /// Detaches the handler of a pending operation.
    pub fn cancel(&self, id: CallbackId) {
        let _ = self.send(Command::Cancel { id });
    }

    /// Detaches the handler of a pending operation on `fh` and closes `fh`
    /// once the library has finished with the operation.
    pub fn cancel_and_close(&self, id: CallbackId, fh: FileHandle) {
        let _ = self.send(Command::CancelAndClose { id, fh });
    }

    /// Closes a file handle. Nothing may be outstanding on it; use
    /// [`cancel_and_close`](Self::cancel_and_close) otherwise.
    pub fn close(&self, fh: FileHandle) {
        let _ = self.send(Command::Close { fh });
    }

    /// Returns a snapshot of the connection state.
    pub async fn status(&self) -> NfsResult<ConnectionStatus> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Status { reply })?;
        rx.await.map_err(|_| NfsError::Shutdown)
    }
}

/// An operation in flight.
///
/// Await it for the result. Dropping it before completion cancels the
/// operation; an open that completes after that is closed automatically.
#[must_use = "dropping a PendingOp cancels the operation"]
pub struct PendingOp<T> {
    id: CallbackId,
    rx: oneshot::Receiver<NfsResult<Reply>>,
    connection: mpsc::WeakUnboundedSender<Command>,
    done: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T> std::fmt::Debug for PendingOp<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingOp")
            .field("id", &self.id)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl<T> PendingOp<T> {
    fn new(
        id: CallbackId,
        rx: oneshot::Receiver<NfsResult<Reply>>,
        connection: mpsc::WeakUnboundedSender<Command>,
    ) -> Self {
        Self {
            id,
            rx,
            connection,
            done: false,
            _marker: PhantomData,
        }
    }

    /// The identity the operation is registered under.
    pub fn id(&self) -> CallbackId {
        self.id
    }

    /// True once the result has been taken or the operation cancelled.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Cancels the operation. Its result will never be observed.
    pub fn cancel(mut self) {
        self.detach(None);
    }

    /// Cancels the operation and closes `fh` once the library has finished
    /// with it.
    pub fn cancel_and_close(mut self, fh: FileHandle) {
        self.detach(Some(fh));
    }

    fn send(&self, command: Command) {
        if let Some(connection) = self.connection.upgrade() {
            let _ = connection.send(command);
        }
    }

    fn detach(&mut self, close: Option<FileHandle>) {
        if std::mem::replace(&mut self.done, true) {
            if let Some(fh) = close {
                self.send(Command::Close { fh });
            }
            return;
        }

        self.rx.close();
        match self.rx.try_recv() {
            Ok(result) => {
                // The callback already unwound on the connection side.
                if let Ok(Reply::Opened(fh)) = result {
                    self.send(Command::Close { fh });
                }
                if let Some(fh) = close {
                    self.send(Command::Close { fh });
                }
            }
            Err(_) => {
                let id = self.id;
                self.send(match close {
                    Some(fh) => Command::CancelAndClose { id, fh },
                    None => Command::Cancel { id },
                });
            }
        }
    }
}

impl<T: FromReply> Future for PendingOp<T> {
    type Output = NfsResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(Err(NfsError::Cancelled));
        }
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(result) => {
                this.done = true;
                Poll::Ready(match result {
                    Ok(reply) => reply.and_then(T::from_reply),
                    // The handler was detached by a cancel.
                    Err(_) => Err(NfsError::Cancelled),
                })
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> Drop for PendingOp<T> {
    fn drop(&mut self) {
        if !self.done {
            self.detach(None);
        }
    }
}
