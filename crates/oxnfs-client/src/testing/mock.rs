//! In-process fake of the NFS client library.
//!
//! [`MockServer`] holds a tiny file tree per export and hands out
//! [`MockContext`] sessions through its [`ContextFactory`] implementation.
//! Each session owns one end of a Unix socket pair; delivering a completion
//! queues it and writes a byte to the other end, so the connection task
//! wakes up through the real tokio reactor exactly as it would for network
//! traffic.
//!
//! In [`Delivery::Manual`] mode completions of mounts and operations are
//! held until the test releases them, which makes it possible to cancel or
//! close while a request is provably still owned by the library.

use crate::callback::CallbackId;
use crate::context::{
    CompletionSink, ContextFactory, DirEntry, FileHandle, NfsContext, NfsDirectory, NfsStat,
    Reply, RequestTag,
};
use crate::error::{NfsError, NfsResult};
use bytes::Bytes;
use nix::poll::PollFlags;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;

/// How the fake server answers mount requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountBehavior {
    /// Succeed if the export exists, fail with ENOENT otherwise.
    Succeed,
    /// Fail with the given errno.
    Fail(i32),
    /// Never answer.
    Hang,
}

/// When completions reach the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// As soon as the request is issued.
    Immediate,
    /// When released with [`MockServer::release_next`] or
    /// [`MockServer::release_all`]. Close completions are never held.
    Manual,
}

/// Counters observed by tests.
#[derive(Debug, Clone, Default)]
pub struct MockStats {
    /// Sessions created through the factory.
    pub contexts_created: usize,
    /// Sessions dropped.
    pub contexts_destroyed: usize,
    /// Mount requests received.
    pub mounts: usize,
    /// Operation requests received (stat, open, read, ...).
    pub requests: usize,
    /// Calls to `service`.
    pub services: usize,
    /// Handles closed, in order.
    pub closed: Vec<FileHandle>,
    /// Closes issued while a service call of the same session was running.
    pub closes_during_service: usize,
    /// Closes issued on a session other than the one that opened the handle.
    pub foreign_closes: usize,
}

#[derive(Debug, Clone)]
struct Entry {
    stat: NfsStat,
    data: Bytes,
}

#[derive(Debug)]
struct OpenFile {
    session: u64,
    export: String,
    path: String,
}

#[derive(Debug)]
struct Session {
    peer: UnixStream,
    ready: VecDeque<(RequestTag, NfsResult<Reply>)>,
}

#[derive(Debug)]
struct Held {
    session: u64,
    tag: RequestTag,
    result: NfsResult<Reply>,
}

#[derive(Debug)]
struct ServerState {
    exports: BTreeSet<String>,
    entries: BTreeMap<(String, String), Entry>,
    mount: MountBehavior,
    delivery: Delivery,
    held: VecDeque<Held>,
    sessions: HashMap<u64, Session>,
    next_session: u64,
    next_fh: u64,
    handles: HashMap<FileHandle, OpenFile>,
    /// Session that opened each handle, kept after the handle is gone.
    opened_on: HashMap<FileHandle, u64>,
    reject_requests: bool,
    fail_create: bool,
    fail_service: bool,
    stats: MockStats,
}

impl ServerState {
    fn deliver(&mut self, session: u64, tag: RequestTag, result: NfsResult<Reply>) {
        match self.delivery {
            Delivery::Immediate => self.make_ready(session, tag, result),
            Delivery::Manual => self.held.push_back(Held {
                session,
                tag,
                result,
            }),
        }
    }

    fn make_ready(&mut self, session: u64, tag: RequestTag, result: NfsResult<Reply>) {
        if let Some(session) = self.sessions.get_mut(&session) {
            session.ready.push_back((tag, result));
            // A full socket buffer already signals readiness.
            let _ = (&session.peer).write(&[1]);
        }
    }

    fn wake_all(&self) {
        for session in self.sessions.values() {
            let _ = (&session.peer).write(&[1]);
        }
    }

    fn lookup(&self, export: &str, path: &str) -> NfsResult<&Entry> {
        self.entries
            .get(&(export.to_string(), path.to_string()))
            .ok_or_else(|| NfsError::from_errno(-libc::ENOENT))
    }

    fn handle(&self, fh: FileHandle) -> NfsResult<&Entry> {
        let file = self
            .handles
            .get(&fh)
            .ok_or_else(|| NfsError::from_errno(-libc::EBADF))?;
        self.lookup(&file.export, &file.path)
    }
}

/// A fake NFS server shared by all sessions it creates.
#[derive(Debug, Clone)]
pub struct MockServer {
    state: Arc<Mutex<ServerState>>,
}

impl Default for MockServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MockServer {
    /// Creates a server with no exports that mounts successfully and
    /// delivers completions immediately.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ServerState {
                exports: BTreeSet::new(),
                entries: BTreeMap::new(),
                mount: MountBehavior::Succeed,
                delivery: Delivery::Immediate,
                held: VecDeque::new(),
                sessions: HashMap::new(),
                next_session: 1,
                next_fh: 1,
                handles: HashMap::new(),
                opened_on: HashMap::new(),
                reject_requests: false,
                fail_create: false,
                fail_service: false,
                stats: MockStats::default(),
            })),
        }
    }

    /// This server as a factory for connections.
    pub fn factory(&self) -> Arc<dyn ContextFactory> {
        Arc::new(self.clone())
    }

    /// Adds an export with an empty root directory.
    pub fn add_export(&self, export: &str) {
        let mut state = self.state.lock();
        state.exports.insert(export.to_string());
        state.entries.insert(
            (export.to_string(), "/".to_string()),
            Entry {
                stat: NfsStat::directory(),
                data: Bytes::new(),
            },
        );
    }

    /// Adds a directory below an export.
    pub fn add_directory(&self, export: &str, path: &str) {
        self.state.lock().entries.insert(
            (export.to_string(), path.to_string()),
            Entry {
                stat: NfsStat::directory(),
                data: Bytes::new(),
            },
        );
    }

    /// Adds a regular file below an export.
    pub fn add_file(&self, export: &str, path: &str, data: impl Into<Bytes>) {
        let data = data.into();
        self.state.lock().entries.insert(
            (export.to_string(), path.to_string()),
            Entry {
                stat: NfsStat::regular(data.len() as u64),
                data,
            },
        );
    }

    /// Changes how mount requests are answered.
    pub fn set_mount_behavior(&self, behavior: MountBehavior) {
        self.state.lock().mount = behavior;
    }

    /// Changes when completions are delivered.
    pub fn set_delivery(&self, delivery: Delivery) {
        self.state.lock().delivery = delivery;
    }

    /// Makes every request fail synchronously, as when the library cannot
    /// allocate it.
    pub fn set_reject_requests(&self, reject: bool) {
        self.state.lock().reject_requests = reject;
    }

    /// Makes the factory fail.
    pub fn set_fail_create(&self, fail: bool) {
        self.state.lock().fail_create = fail;
    }

    /// Makes the next service call of any session fail, and wakes all
    /// sessions so it happens promptly.
    pub fn break_connections(&self) {
        let mut state = self.state.lock();
        state.fail_service = true;
        state.wake_all();
    }

    /// Number of completions held in manual mode.
    pub fn held_count(&self) -> usize {
        self.state.lock().held.len()
    }

    /// Releases the oldest held completion. Returns false if none was held.
    pub fn release_next(&self) -> bool {
        let mut state = self.state.lock();
        match state.held.pop_front() {
            Some(held) => {
                state.make_ready(held.session, held.tag, held.result);
                true
            }
            None => false,
        }
    }

    /// Releases every held completion; returns how many.
    pub fn release_all(&self) -> usize {
        let mut state = self.state.lock();
        let held = std::mem::take(&mut state.held);
        let count = held.len();
        for held in held {
            state.make_ready(held.session, held.tag, held.result);
        }
        count
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> MockStats {
        self.state.lock().stats.clone()
    }

    /// Handles opened on a live session and not yet closed.
    pub fn open_handles(&self) -> usize {
        self.state.lock().handles.len()
    }

    /// Number of live sessions.
    pub fn live_sessions(&self) -> usize {
        self.state.lock().sessions.len()
    }
}

impl ContextFactory for MockServer {
    fn create(&self, _server: &str, _export: &str) -> NfsResult<Box<dyn NfsContext>> {
        let mut state = self.state.lock();
        if state.fail_create {
            return Err(NfsError::from_errno(-libc::ENOMEM));
        }

        let (ours, peer) = UnixStream::pair().map_err(io_error)?;
        ours.set_nonblocking(true).map_err(io_error)?;
        peer.set_nonblocking(true).map_err(io_error)?;

        let id = state.next_session;
        state.next_session += 1;
        state.sessions.insert(
            id,
            Session {
                peer,
                ready: VecDeque::new(),
            },
        );
        state.stats.contexts_created += 1;

        Ok(Box::new(MockContext {
            id,
            state: Arc::clone(&self.state),
            socket: ours,
            export: String::new(),
            in_service: false,
        }))
    }
}

fn io_error(e: io::Error) -> NfsError {
    NfsError::from_errno(-e.raw_os_error().unwrap_or(libc::EIO))
}

/// One session created by a [`MockServer`].
#[derive(Debug)]
pub struct MockContext {
    id: u64,
    state: Arc<Mutex<ServerState>>,
    socket: UnixStream,
    export: String,
    in_service: bool,
}

impl MockContext {
    /// Common prologue of every operation request.
    fn request(
        &self,
        id: CallbackId,
        answer: impl FnOnce(&mut ServerState) -> NfsResult<Reply>,
    ) -> NfsResult<()> {
        let mut state = self.state.lock();
        if state.reject_requests {
            return Err(NfsError::from_errno(-libc::ENOMEM));
        }
        state.stats.requests += 1;
        let result = answer(&mut state);
        state.deliver(self.id, RequestTag::Operation(id), result);
        Ok(())
    }

    fn drain_socket(&self) -> NfsResult<()> {
        let mut buf = [0u8; 64];
        loop {
            match (&self.socket).read(&mut buf) {
                Ok(0) => return Ok(()),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(io_error(e)),
            }
        }
    }
}

impl NfsContext for MockContext {
    fn mount_async(&mut self, _server: &str, export: &str) -> NfsResult<()> {
        let mut state = self.state.lock();
        if state.reject_requests {
            return Err(NfsError::from_errno(-libc::ENOMEM));
        }
        state.stats.mounts += 1;
        self.export = export.to_string();

        let result = match state.mount {
            MountBehavior::Succeed if state.exports.contains(export) => Ok(Reply::Mounted),
            MountBehavior::Succeed => Err(NfsError::from_errno(-libc::ENOENT)),
            MountBehavior::Fail(code) => Err(NfsError::from_errno(code)),
            MountBehavior::Hang => return Ok(()),
        };
        state.deliver(self.id, RequestTag::Mount, result);
        Ok(())
    }

    fn stat_async(&mut self, path: &str, id: CallbackId) -> NfsResult<()> {
        let export = self.export.clone();
        self.request(id, |state| {
            state
                .lookup(&export, path)
                .map(|entry| Reply::Stat(entry.stat.clone()))
        })
    }

    fn lstat_async(&mut self, path: &str, id: CallbackId) -> NfsResult<()> {
        // The fake tree has no symlinks.
        self.stat_async(path, id)
    }

    fn opendir_async(&mut self, path: &str, id: CallbackId) -> NfsResult<()> {
        let export = self.export.clone();
        self.request(id, |state| {
            if !state.lookup(&export, path)?.stat.is_directory() {
                return Err(NfsError::from_errno(-libc::ENOTDIR));
            }
            let prefix = if path.ends_with('/') {
                path.to_string()
            } else {
                format!("{path}/")
            };
            let entries = state
                .entries
                .iter()
                .filter(|((e, _), _)| *e == export)
                .filter_map(|((_, p), entry)| {
                    let name = p.strip_prefix(&prefix)?;
                    (!name.is_empty() && !name.contains('/')).then(|| DirEntry {
                        name: name.to_string(),
                        stat: entry.stat.clone(),
                    })
                })
                .collect();
            Ok(Reply::Directory(NfsDirectory::new(entries)))
        })
    }

    fn open_async(&mut self, path: &str, flags: i32, id: CallbackId) -> NfsResult<()> {
        let export = self.export.clone();
        let session = self.id;
        self.request(id, |state| {
            if flags & libc::O_ACCMODE != libc::O_RDONLY {
                return Err(NfsError::from_errno(-libc::EROFS));
            }
            state.lookup(&export, path)?;
            let fh = FileHandle(state.next_fh);
            state.next_fh += 1;
            state.handles.insert(
                fh,
                OpenFile {
                    session,
                    export: export.clone(),
                    path: path.to_string(),
                },
            );
            state.opened_on.insert(fh, session);
            Ok(Reply::Opened(fh))
        })
    }

    fn fstat_async(&mut self, fh: FileHandle, id: CallbackId) -> NfsResult<()> {
        self.request(id, |state| {
            state.handle(fh).map(|entry| Reply::Stat(entry.stat.clone()))
        })
    }

    fn pread_async(
        &mut self,
        fh: FileHandle,
        offset: u64,
        size: u32,
        id: CallbackId,
    ) -> NfsResult<()> {
        self.request(id, |state| {
            let data = &state.handle(fh)?.data;
            let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
            let end = start.saturating_add(size as usize).min(data.len());
            Ok(Reply::Read(data.slice(start..end)))
        })
    }

    fn close_async(&mut self, fh: FileHandle) -> NfsResult<()> {
        let mut state = self.state.lock();
        if self.in_service {
            state.stats.closes_during_service += 1;
        }
        state.stats.closed.push(fh);
        if state.opened_on.get(&fh).is_some_and(|&session| session != self.id) {
            state.stats.foreign_closes += 1;
        }
        let owned = state
            .handles
            .get(&fh)
            .is_some_and(|file| file.session == self.id);
        let result = if owned {
            state.handles.remove(&fh);
            Ok(Reply::Closed)
        } else {
            Err(NfsError::from_errno(-libc::EBADF))
        };
        state.make_ready(self.id, RequestTag::Close(fh), result);
        Ok(())
    }

    fn service(&mut self, revents: PollFlags, sink: &mut CompletionSink<'_>) -> NfsResult<()> {
        self.drain_socket()?;
        let ready = {
            let mut state = self.state.lock();
            state.stats.services += 1;
            if std::mem::take(&mut state.fail_service) || revents.contains(PollFlags::POLLHUP) {
                return Err(NfsError::from_errno(-libc::ECONNRESET));
            }
            state
                .sessions
                .get_mut(&self.id)
                .map(|session| std::mem::take(&mut session.ready))
                .unwrap_or_default()
        };

        self.in_service = true;
        for (tag, result) in ready {
            sink(tag, result);
        }
        self.in_service = false;
        Ok(())
    }

    fn fd(&self) -> Option<RawFd> {
        Some(self.socket.as_raw_fd())
    }

    fn which_events(&self) -> PollFlags {
        PollFlags::POLLIN
    }
}

impl Drop for MockContext {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.sessions.remove(&self.id);
        let id = self.id;
        state.held.retain(|held| held.session != id);
        // The library frees every handle of a destroyed session.
        state.handles.retain(|_, file| file.session != id);
        state.stats.contexts_destroyed += 1;
    }
}
