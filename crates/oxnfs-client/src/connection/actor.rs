//! The connection task.
//!
//! [`ConnectionActor`] owns the client session and everything attached to
//! it. It reacts to three sources, one at a time:
//!
//! - commands from handles (leases, operations, cancels, closes),
//! - readiness of the session's socket,
//! - expiry of the mount deadline.
//!
//! After each event, deferred work (starting a mount, announcing an existing
//! mount to new leases) runs before the next event is picked up.
//!
//! Two rules keep the session safe to drive:
//!
//! 1. Nothing touches the session while [`NfsContext::service`] runs. The
//!    completion sink only sees the callback registry, the handle set and
//!    the deferred-close queue, and the queue is flushed right after the
//!    service call returns.
//! 2. The session is destroyed only outside a service call, and only after
//!    every pending callback had the chance to issue its scheduled close on
//!    it.
//! 3. A handle is only ever closed on the session that opened it. Closes
//!    for handles of a destroyed session are dropped.

use super::socket::SocketWatch;
use super::{Command, ConnectionStatus, MountState, Operation};
use crate::callback::{CallbackId, CallbackRegistry, CancellableCallback};
use crate::config::ConnectionConfig;
use crate::context::{ContextFactory, FileHandle, NfsContext, Reply, RequestTag};
use crate::error::{NfsError, NfsResult};
use crate::lease::{LeaseEvent, LeaseId, LeaseList};
use nix::poll::PollFlags;
use std::collections::HashSet;
use std::io;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, trace, warn};

pub(super) struct ConnectionActor {
    server: String,
    export: String,
    config: ConnectionConfig,
    factory: Arc<dyn ContextFactory>,

    /// `None` only while a replacement session could not be created.
    context: Option<Box<dyn NfsContext>>,
    socket: SocketWatch,

    mount_state: MountState,
    mount_deadline: Option<Instant>,
    last_mount_error: Option<Arc<NfsError>>,

    new_leases: LeaseList,
    active_leases: LeaseList,
    callbacks: CallbackRegistry,

    /// Handles opened on the current session and not yet closed.
    session_handles: HashSet<FileHandle>,
    /// Handles to close once the current service call has returned.
    deferred_close: Vec<FileHandle>,

    /// A lease was added; mount or announce the mount after this event.
    defer_new_lease: bool,
    /// Inside the socket-ready handler; socket updates wait until it ends.
    in_event: bool,
    /// Tearing the session down; no socket updates.
    in_destroy: bool,
}

impl ConnectionActor {
    pub(super) fn new(
        server: &str,
        export: &str,
        factory: Arc<dyn ContextFactory>,
        context: Box<dyn NfsContext>,
        config: ConnectionConfig,
    ) -> Self {
        Self {
            server: server.to_string(),
            export: export.to_string(),
            config,
            factory,
            context: Some(context),
            socket: SocketWatch::new(),
            mount_state: MountState::Initial,
            mount_deadline: None,
            last_mount_error: None,
            new_leases: LeaseList::default(),
            active_leases: LeaseList::default(),
            callbacks: CallbackRegistry::new(),
            session_handles: HashSet::new(),
            deferred_close: Vec::new(),
            defer_new_lease: false,
            in_event: false,
            in_destroy: false,
        }
    }

    pub(super) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        info!(server = %self.server, export = %self.export, "connection task started");
        self.schedule_socket();

        loop {
            let deadline = self.mount_deadline.unwrap_or_else(Instant::now);
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                ready = self.socket.ready(), if self.socket.is_armed() => {
                    self.on_socket_ready(ready);
                }
                () = sleep_until(deadline), if self.mount_deadline.is_some() => {
                    self.on_mount_timeout();
                }
            }

            if std::mem::take(&mut self.defer_new_lease) {
                self.run_deferred();
            }
        }

        info!(server = %self.server, export = %self.export, "connection task stopping");
        self.destroy_context(&NfsError::Shutdown);
    }

    // ========================================================================
    // Commands
    // ========================================================================

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::AddLease { id, events } => {
                debug!(lease = %id, state = ?self.mount_state, "lease added");
                self.new_leases.push(id, events);
                self.defer_new_lease = true;
            }
            Command::RemoveLease { id } => self.remove_lease(id),
            Command::Operation { id, op, reply } => {
                let callback = CancellableCallback::new(id, reply, op.is_open());
                self.issue(callback, &op);
            }
            Command::Cancel { id } => {
                if let Some(callback) = self.callbacks.get_mut(id) {
                    trace!(callback = %id, "cancelled");
                    callback.cancel();
                }
            }
            Command::CancelAndClose { id, fh } => match self.callbacks.get_mut(id) {
                Some(callback) => {
                    trace!(callback = %id, %fh, "cancelled, close scheduled");
                    callback.cancel_and_schedule_close(fh);
                }
                // Already unwound; nothing is outstanding on the handle.
                None => self.close(fh),
            },
            Command::Close { fh } => self.close(fh),
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
        }
    }

    fn remove_lease(&mut self, id: LeaseId) {
        if self.new_leases.remove(id) || self.active_leases.remove(id) {
            debug!(lease = %id, "lease removed");
        }
    }

    fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            mount_state: self.mount_state,
            new_leases: self.new_leases.len(),
            active_leases: self.active_leases.len(),
            pending_callbacks: self.callbacks.len(),
            last_mount_error: self.last_mount_error.clone(),
        }
    }

    fn issue(&mut self, callback: CancellableCallback, op: &Operation) {
        let id = callback.id();
        if self.callbacks.contains(id) {
            error!(callback = %id, "callback identity is already pending");
            callback.fail(NfsError::DuplicateCallback(id.raw()));
            return;
        }

        let context = match self.context.as_deref_mut() {
            Some(context) if self.mount_state == MountState::Finished => context,
            _ => {
                callback.fail(NfsError::NotMounted);
                return;
            }
        };

        match submit(context, id, op) {
            Ok(()) => {
                trace!(callback = %id, ?op, "issued");
                // Cannot collide: checked above.
                let _ = self.callbacks.insert(callback);
                self.schedule_socket();
            }
            Err(e) => {
                debug!(callback = %id, error = %e, "library rejected request");
                callback.fail(e);
            }
        }
    }

    /// Closes `fh` on the current session.
    ///
    /// Only reached from commands, never from inside a service call: the
    /// completion sink cannot borrow the actor.
    fn close(&mut self, fh: FileHandle) {
        if !self.session_handles.remove(&fh) {
            debug!(%fh, "handle not open on the current session, dropping close");
            return;
        }
        let Some(context) = self.context.as_deref_mut() else {
            debug!(%fh, "no session, dropping close");
            return;
        };
        if let Err(e) = context.close_async(fh) {
            warn!(%fh, error = %e, "close failed");
        }
        self.schedule_socket();
    }

    // ========================================================================
    // Mount state machine
    // ========================================================================

    fn run_deferred(&mut self) {
        match self.mount_state {
            MountState::Initial => {
                if !self.new_leases.is_empty() {
                    self.mount();
                }
            }
            // The pending leases are announced when the mount completes.
            MountState::Waiting => {}
            MountState::Finished => self.broadcast_mount_success(),
        }
    }

    fn mount(&mut self) {
        debug_assert_eq!(self.mount_state, MountState::Initial);

        if self.context.is_none() {
            match self.factory.create(&self.server, &self.export) {
                Ok(context) => self.context = Some(context),
                Err(e) => {
                    self.on_mount_failed(e);
                    return;
                }
            }
        }
        let Some(context) = self.context.as_deref_mut() else {
            return;
        };

        info!(server = %self.server, export = %self.export, "mounting");
        if let Err(e) = context.mount_async(&self.server, &self.export) {
            self.on_mount_failed(e);
            return;
        }

        self.mount_state = MountState::Waiting;
        self.mount_deadline = Some(Instant::now() + self.config.mount_timeout);
        self.schedule_socket();
    }

    fn on_mount_complete(&mut self, result: NfsResult<Reply>) {
        if self.mount_state != MountState::Waiting {
            debug!(state = ?self.mount_state, "ignoring stale mount completion");
            return;
        }
        self.mount_deadline = None;

        match result {
            Ok(_) => {
                info!(server = %self.server, export = %self.export, "mounted");
                self.mount_state = MountState::Finished;
                self.last_mount_error = None;
                self.broadcast_mount_success();
            }
            Err(e) => self.on_mount_failed(e),
        }
    }

    fn on_mount_timeout(&mut self) {
        warn!(
            server = %self.server,
            export = %self.export,
            timeout = ?self.config.mount_timeout,
            "mount timed out"
        );
        self.on_mount_failed(NfsError::MountTimeout(self.config.mount_timeout));
    }

    fn on_mount_failed(&mut self, error: NfsError) {
        let error = error.into_mount_error(&self.server, &self.export);
        warn!(server = %self.server, export = %self.export, error = %error, "mount failed");
        let error = Arc::new(error);
        self.last_mount_error = Some(Arc::clone(&error));
        self.fail_session(&error);
    }

    /// Moves every pending lease to the active set and tells it so.
    fn broadcast_mount_success(&mut self) {
        debug_assert_eq!(self.mount_state, MountState::Finished);
        for (id, events) in self.new_leases.take() {
            if events.send(LeaseEvent::Ready).is_ok() {
                self.active_leases.push(id, events);
            } else {
                trace!(lease = %id, "lease holder gone before mount finished");
            }
        }
    }

    // ========================================================================
    // Socket
    // ========================================================================

    fn schedule_socket(&mut self) {
        if self.in_event || self.in_destroy {
            return;
        }
        let (fd, events) = match self.context.as_deref() {
            Some(context) => (context.fd(), context.which_events()),
            None => (None, PollFlags::empty()),
        };
        if let Err(e) = self.socket.update(fd, events) {
            self.on_connection_error(&e);
        }
    }

    fn on_socket_ready(&mut self, ready: io::Result<PollFlags>) {
        let revents = match ready {
            Ok(revents) => revents,
            Err(e) => {
                self.on_connection_error(&e);
                return;
            }
        };

        self.in_event = true;
        let result = self.service(revents);
        self.in_event = false;

        match result {
            Ok(()) => self.schedule_socket(),
            Err(e) => self.on_connection_error(&e),
        }
    }

    fn service(&mut self, revents: PollFlags) -> NfsResult<()> {
        let Some(context) = self.context.as_deref_mut() else {
            return Ok(());
        };

        let callbacks = &mut self.callbacks;
        let session_handles = &mut self.session_handles;
        let deferred_close = &mut self.deferred_close;
        let mut mount_result = None;

        let result = context.service(revents, &mut |tag: RequestTag, result: NfsResult<Reply>| match tag {
            RequestTag::Mount => mount_result = Some(result),
            RequestTag::Operation(id) => {
                if let Ok(Reply::Opened(fh)) = &result {
                    session_handles.insert(*fh);
                }
                complete(callbacks, deferred_close, id, result);
            }
            RequestTag::Close(fh) => match result {
                Ok(_) => trace!(%fh, "closed"),
                Err(e) => debug!(%fh, error = %e, "close failed"),
            },
        });

        self.flush_deferred_close();
        if let Some(mount_result) = mount_result {
            self.on_mount_complete(mount_result);
        }
        result
    }

    fn flush_deferred_close(&mut self) {
        if self.deferred_close.is_empty() {
            return;
        }
        let handles = std::mem::take(&mut self.deferred_close);
        let Some(context) = self.context.as_deref_mut() else {
            debug!(count = handles.len(), "no session, dropping deferred closes");
            return;
        };
        for fh in handles {
            trace!(%fh, "deferred close");
            self.session_handles.remove(&fh);
            if let Err(e) = context.close_async(fh) {
                warn!(%fh, error = %e, "deferred close failed");
            }
        }
    }

    // ========================================================================
    // Failure handling
    // ========================================================================

    fn on_connection_error(&mut self, cause: &dyn std::fmt::Display) {
        let error = NfsError::Connection {
            server: self.server.clone(),
            export: self.export.clone(),
            message: cause.to_string(),
        };
        if self.mount_state == MountState::Waiting {
            self.on_mount_failed(error);
            return;
        }
        error!(server = %self.server, export = %self.export, error = %error, "connection failed");
        self.fail_session(&Arc::new(error));
    }

    /// Tells every lease about `error`, then replaces the session.
    fn fail_session(&mut self, error: &Arc<NfsError>) {
        self.mount_state = MountState::Initial;
        self.mount_deadline = None;

        self.new_leases
            .drain_with(&LeaseEvent::Failed(Arc::clone(error)));
        self.active_leases
            .drain_with(&LeaseEvent::Disconnected(Arc::clone(error)));

        self.destroy_context(error);
        self.recreate_context();
    }

    fn destroy_context(&mut self, reason: &NfsError) {
        self.in_destroy = true;

        self.socket.clear();
        if let Some(mut context) = self.context.take() {
            self.callbacks.prepare_destroy_context(context.as_mut());
            for fh in std::mem::take(&mut self.deferred_close) {
                let _ = context.close_async(fh);
            }
            debug!(
                server = %self.server,
                export = %self.export,
                stale_handles = self.session_handles.len(),
                "destroying session"
            );
            drop(context);
        }
        // Handles die with their session.
        self.session_handles.clear();
        self.callbacks.fail_all(reason);

        self.in_destroy = false;
    }

    fn recreate_context(&mut self) {
        match self.factory.create(&self.server, &self.export) {
            Ok(context) => self.context = Some(context),
            Err(e) => {
                warn!(
                    server = %self.server,
                    export = %self.export,
                    error = %e,
                    "could not recreate session, retrying on next mount"
                );
            }
        }
    }
}

fn submit(context: &mut dyn NfsContext, id: CallbackId, op: &Operation) -> NfsResult<()> {
    match op {
        Operation::Stat { path } => context.stat_async(path, id),
        Operation::Lstat { path } => context.lstat_async(path, id),
        Operation::OpenDirectory { path } => context.opendir_async(path, id),
        Operation::Open { path, flags } => context.open_async(path, *flags, id),
        Operation::Fstat { fh } => context.fstat_async(*fh, id),
        Operation::Read { fh, offset, size } => context.pread_async(*fh, *offset, *size, id),
    }
}

/// Delivers one operation completion from inside a service call.
fn complete(
    callbacks: &mut CallbackRegistry,
    deferred_close: &mut Vec<FileHandle>,
    id: CallbackId,
    result: NfsResult<Reply>,
) {
    match callbacks.remove(id) {
        Some(callback) => {
            if let Some(fh) = callback.complete(result) {
                deferred_close.push(fh);
            }
        }
        None => {
            debug!(callback = %id, "completion for unknown callback");
            if let Ok(Reply::Opened(fh)) = result {
                deferred_close.push(fh);
            }
        }
    }
}
