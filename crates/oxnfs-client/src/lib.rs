//! Asynchronous NFS client connection manager.
//!
//! This crate sits between consumers that want to read files from NFS
//! exports and a poll-style asynchronous NFS client library. It multiplexes
//! the library's socket on the tokio reactor, mounts exports on demand,
//! shares one mounted session among all consumers of the same export, and
//! lets consumers cancel in-flight requests without leaking file handles.
//!
//! # Components
//!
//! ## Connection layer
//!
//! - [`NfsContext`] / [`ContextFactory`] - Boundary to the client library
//! - [`NfsConnection`] - Shared session for one `(server, export)` pair
//! - [`Lease`] / [`LeaseEvent`] - A consumer's interest in a mounted session
//! - [`PendingOp`] - An operation in flight; cancels when dropped
//! - [`CancellableCallback`] - Connection-side record of one pending request
//! - [`ConnectionRegistry`] - One connection per export, created on demand
//!
//! ## File access
//!
//! - [`NfsFileReader`] - open / stat / read state machine for one file
//! - [`ReaderHandle`] - A reader running as a task, usable from other threads
//! - [`NfsUri`] / [`BasePaths`] - URI parsing with known export boundaries
//!
//! # Lifecycle
//!
//! ```text
//!  reader.open(uri) ─► registry.get(server, export) ─► connection.add_lease()
//!                                                         │ (deferred mount)
//!                                                         ▼
//!            reads ◄── fstat ◄── open ◄────────── LeaseEvent::Ready
//! ```
//!
//! A failed or timed-out mount is reported to every lease waiting for it,
//! with the same error instance, and the session is replaced; the next lease
//! starts a fresh attempt. Losing a mounted session is reported to every
//! active lease the same way.
//!
//! # Example
//!
//! ```ignore
//! use oxnfs_client::{ClientConfig, ConnectionRegistry, NfsFileReader, ReaderEvent};
//!
//! let registry = ConnectionRegistry::new(factory, ClientConfig::default())?;
//! let mut reader = NfsFileReader::new(registry);
//! reader.open("nfs://fileserver/music/album/track01.flac")?;
//! if let Some(ReaderEvent::Opened { size }) = reader.next_event().await {
//!     reader.read(0, size.min(65536) as u32)?;
//!     let data = reader.next_event().await;
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod base;
mod callback;
pub mod config;
mod connection;
mod context;
mod error;
mod lease;
mod manager;
mod reader;
mod uri;

pub use base::BasePaths;
pub use callback::{CallbackId, CallbackRegistry, CancellableCallback};
pub use config::{ClientConfig, ConnectionConfig, DEFAULT_MOUNT_TIMEOUT};
pub use connection::{ConnectionStatus, MountState, NfsConnection, Operation, PendingOp};
pub use context::{
    CompletionSink, ContextFactory, DirEntry, FileHandle, FromReply, NfsContext, NfsDirectory,
    NfsStat, Reply, RequestTag,
};
pub use error::{NfsError, NfsResult};
pub use lease::{Lease, LeaseEvent, LeaseId};
pub use manager::ConnectionRegistry;
pub use reader::{NfsFileReader, ReaderEvent, ReaderHandle, ReaderState};
pub use uri::NfsUri;

/// Testing utilities.
///
/// Provides a fake client library for exercising connections and readers
/// without a network:
/// - [`testing::MockServer`] with manual or immediate completion delivery
/// - Deterministic content generators
pub mod testing;
