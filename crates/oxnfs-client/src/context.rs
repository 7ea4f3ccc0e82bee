//! Boundary to the poll-style NFS client library.
//!
//! The connection manager never speaks the NFS protocol itself. It drives an
//! [`NfsContext`]: a request/response engine that accepts asynchronous
//! requests, exposes one socket descriptor plus the poll events it wants, and
//! delivers completions when [`NfsContext::service`] is called after the
//! socket became ready.
//!
//! Completions are reported as `(RequestTag, NfsResult<Reply>)` pairs through
//! a sink closure. The sink has no access to the context, so nothing a
//! completion triggers can touch the context while it is being serviced.

use crate::callback::CallbackId;
use crate::error::{NfsError, NfsResult};
use bytes::Bytes;
use nix::poll::PollFlags;
use std::os::fd::RawFd;

/// Opaque handle to a file opened on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileHandle(pub u64);

impl FileHandle {
    /// Get the raw handle value.
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fh-{}", self.0)
    }
}

/// Identifies which request a completion belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestTag {
    /// The session's mount request.
    Mount,
    /// An operation registered under a callback identity.
    Operation(CallbackId),
    /// A fire-and-forget close of the given handle.
    Close(FileHandle),
}

/// File attributes as reported by stat/fstat.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NfsStat {
    /// File type and permission bits.
    pub mode: u32,
    /// Size in bytes.
    pub size: u64,
    /// Inode number.
    pub ino: u64,
    /// Number of hard links.
    pub nlink: u64,
    /// Owner user id.
    pub uid: u32,
    /// Owner group id.
    pub gid: u32,
    /// Last modification time, seconds since the epoch.
    pub mtime: i64,
}

#[allow(clippy::useless_conversion)] // mode_t is u16 on some platforms
fn file_type_bits(mode: u32) -> u32 {
    mode & u32::from(libc::S_IFMT)
}

impl NfsStat {
    /// Attributes of a regular file with the given size.
    pub fn regular(size: u64) -> Self {
        #[allow(clippy::useless_conversion)]
        let mode = u32::from(libc::S_IFREG) | 0o644;
        Self {
            mode,
            size,
            nlink: 1,
            ..Self::default()
        }
    }

    /// Attributes of a directory.
    pub fn directory() -> Self {
        #[allow(clippy::useless_conversion)]
        let mode = u32::from(libc::S_IFDIR) | 0o755;
        Self {
            mode,
            size: 4096,
            nlink: 2,
            ..Self::default()
        }
    }

    /// True if these attributes describe a regular file.
    #[allow(clippy::useless_conversion)]
    pub fn is_regular(&self) -> bool {
        file_type_bits(self.mode) == u32::from(libc::S_IFREG)
    }

    /// True if these attributes describe a directory.
    #[allow(clippy::useless_conversion)]
    pub fn is_directory(&self) -> bool {
        file_type_bits(self.mode) == u32::from(libc::S_IFDIR)
    }
}

/// One entry of an opened directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Entry name, without the directory prefix.
    pub name: String,
    /// Attributes the server returned alongside the name.
    pub stat: NfsStat,
}

/// An opened directory.
///
/// The library reads the whole listing when the directory is opened; entries
/// are handed out one by one with [`read_directory`](Self::read_directory)
/// and released when the value is dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NfsDirectory {
    entries: std::collections::VecDeque<DirEntry>,
}

impl NfsDirectory {
    /// Wraps a listing returned by the library.
    pub fn new(entries: Vec<DirEntry>) -> Self {
        Self {
            entries: entries.into(),
        }
    }

    /// Returns the next entry, or `None` once the listing is exhausted.
    pub fn read_directory(&mut self) -> Option<DirEntry> {
        self.entries.pop_front()
    }

    /// Number of entries not yet read.
    pub fn remaining(&self) -> usize {
        self.entries.len()
    }
}

impl Iterator for NfsDirectory {
    type Item = DirEntry;

    fn next(&mut self) -> Option<DirEntry> {
        self.read_directory()
    }
}

/// Successful completion payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// The mount request finished.
    Mounted,
    /// Attributes from stat, lstat or fstat.
    Stat(NfsStat),
    /// Listing from opendir.
    Directory(NfsDirectory),
    /// Handle from open.
    Opened(FileHandle),
    /// Data from pread. May be shorter than requested at end of file.
    Read(Bytes),
    /// A close finished.
    Closed,
}

impl Reply {
    /// Short name of the reply kind, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Reply::Mounted => "mounted",
            Reply::Stat(_) => "stat",
            Reply::Directory(_) => "directory",
            Reply::Opened(_) => "opened",
            Reply::Read(_) => "read",
            Reply::Closed => "closed",
        }
    }
}

/// Conversion from a [`Reply`] into the typed result of one operation.
pub trait FromReply: Sized {
    /// Extracts the value, failing if the reply has the wrong kind.
    fn from_reply(reply: Reply) -> NfsResult<Self>;
}

impl FromReply for NfsStat {
    fn from_reply(reply: Reply) -> NfsResult<Self> {
        match reply {
            Reply::Stat(stat) => Ok(stat),
            _ => Err(NfsError::UnexpectedReply("stat")),
        }
    }
}

impl FromReply for NfsDirectory {
    fn from_reply(reply: Reply) -> NfsResult<Self> {
        match reply {
            Reply::Directory(dir) => Ok(dir),
            _ => Err(NfsError::UnexpectedReply("directory")),
        }
    }
}

impl FromReply for FileHandle {
    fn from_reply(reply: Reply) -> NfsResult<Self> {
        match reply {
            Reply::Opened(fh) => Ok(fh),
            _ => Err(NfsError::UnexpectedReply("opened")),
        }
    }
}

impl FromReply for Bytes {
    fn from_reply(reply: Reply) -> NfsResult<Self> {
        match reply {
            Reply::Read(data) => Ok(data),
            _ => Err(NfsError::UnexpectedReply("read")),
        }
    }
}

/// Receives completions during [`NfsContext::service`].
pub type CompletionSink<'a> = dyn FnMut(RequestTag, NfsResult<Reply>) + 'a;

/// A poll-style asynchronous NFS client session.
///
/// All request methods only queue the request; they fail synchronously when
/// the library cannot even allocate it. Results arrive through the sink
/// passed to [`service`](Self::service). Dropping the context destroys the
/// session and silently abandons outstanding requests.
pub trait NfsContext: Send {
    /// Starts mounting `export` on `server`. Completes with
    /// [`RequestTag::Mount`].
    fn mount_async(&mut self, server: &str, export: &str) -> NfsResult<()>;

    /// Requests attributes of `path`, following symlinks.
    fn stat_async(&mut self, path: &str, id: CallbackId) -> NfsResult<()>;

    /// Requests attributes of `path` without following symlinks.
    fn lstat_async(&mut self, path: &str, id: CallbackId) -> NfsResult<()>;

    /// Opens a directory for listing.
    fn opendir_async(&mut self, path: &str, id: CallbackId) -> NfsResult<()>;

    /// Opens a file with the given `open(2)` flags.
    fn open_async(&mut self, path: &str, flags: i32, id: CallbackId) -> NfsResult<()>;

    /// Requests attributes of an opened file.
    fn fstat_async(&mut self, fh: FileHandle, id: CallbackId) -> NfsResult<()>;

    /// Reads up to `size` bytes at `offset`.
    fn pread_async(
        &mut self,
        fh: FileHandle,
        offset: u64,
        size: u32,
        id: CallbackId,
    ) -> NfsResult<()>;

    /// Closes a file handle. Completes with [`RequestTag::Close`].
    fn close_async(&mut self, fh: FileHandle) -> NfsResult<()>;

    /// Processes socket readiness and delivers finished requests to `sink`.
    ///
    /// An error means the session is unusable.
    fn service(&mut self, revents: PollFlags, sink: &mut CompletionSink<'_>) -> NfsResult<()>;

    /// The socket the session currently uses, if any. May change over time.
    fn fd(&self) -> Option<RawFd>;

    /// The poll events the session currently waits for.
    fn which_events(&self) -> PollFlags;
}

/// Creates client sessions for a (server, export) pair.
pub trait ContextFactory: Send + Sync {
    /// Creates a fresh, unmounted session.
    fn create(&self, server: &str, export: &str) -> NfsResult<Box<dyn NfsContext>>;
}

impl<F> ContextFactory for F
where
    F: Fn(&str, &str) -> NfsResult<Box<dyn NfsContext>> + Send + Sync,
{
    fn create(&self, server: &str, export: &str) -> NfsResult<Box<dyn NfsContext>> {
        self(server, export)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stat_file_type() {
        assert!(NfsStat::regular(10).is_regular());
        assert!(!NfsStat::regular(10).is_directory());
        assert!(NfsStat::directory().is_directory());
        assert!(!NfsStat::directory().is_regular());
    }

    #[test]
    fn test_directory_reads_in_order() {
        let mut dir = NfsDirectory::new(vec![
            DirEntry {
                name: "a.flac".into(),
                stat: NfsStat::regular(1),
            },
            DirEntry {
                name: "b.flac".into(),
                stat: NfsStat::regular(2),
            },
        ]);
        assert_eq!(dir.remaining(), 2);
        assert_eq!(dir.read_directory().unwrap().name, "a.flac");
        assert_eq!(dir.next().unwrap().name, "b.flac");
        assert!(dir.read_directory().is_none());
    }

    #[test]
    fn test_from_reply_kind_mismatch() {
        let err = FileHandle::from_reply(Reply::Closed).unwrap_err();
        assert_eq!(err, NfsError::UnexpectedReply("opened"));
        assert_eq!(
            NfsStat::from_reply(Reply::Stat(NfsStat::regular(5)))
                .unwrap()
                .size,
            5
        );
    }
}
