//! Error types for the NFS client.
//!
//! Every failure the connection manager can report is an [`NfsError`].
//! Errors that are broadcast to several consumers at once (mount failures,
//! disconnects) are shared as `Arc<NfsError>` so that all of them observe
//! the same instance.

use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type NfsResult<T> = Result<T, NfsError>;

/// Errors reported by the NFS connection manager and file reader.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NfsError {
    /// The URI could not be split into server, export and path.
    #[error("Malformed NFS URI: {0}")]
    MalformedUri(String),

    /// The client library reported a failure (errno-style code).
    #[error("NFS error {code}: {message}")]
    Client {
        /// Negative or positive errno reported by the library.
        code: i32,
        /// Human-readable message from the library.
        message: String,
    },

    /// The mount did not complete within the configured timeout.
    #[error("Mount timeout after {0:?}")]
    MountTimeout(Duration),

    /// The client library rejected or failed the mount request.
    #[error("Mount of {server}:{export} failed: {message}")]
    Mount {
        /// NFS server name.
        server: String,
        /// Exported path.
        export: String,
        /// Errno reported by the library.
        code: i32,
        /// Reason reported by the library.
        message: String,
    },

    /// The socket or the service call failed; the session is gone.
    #[error("Connection to {server}:{export} failed: {message}")]
    Connection {
        /// NFS server name.
        server: String,
        /// Exported path.
        export: String,
        /// Reason for the failure.
        message: String,
    },

    /// The stat of an opened file did not describe a regular file.
    #[error("Not a regular file")]
    NotRegularFile,

    /// An operation was issued before the connection finished mounting.
    #[error("Connection is not mounted")]
    NotMounted,

    /// A callback identity was registered twice.
    #[error("Callback {0} is already pending")]
    DuplicateCallback(u64),

    /// The reader was asked to do something its current state forbids.
    #[error("Invalid reader state: {0}")]
    InvalidState(&'static str),

    /// The operation was cancelled before its result was delivered.
    #[error("Operation was cancelled")]
    Cancelled,

    /// The connection task has exited.
    #[error("Connection task has shut down")]
    Shutdown,

    /// No tokio runtime was available to spawn a connection task on.
    #[error("No tokio runtime available")]
    NoRuntime,

    /// The library delivered a reply of the wrong kind for the request.
    #[error("Unexpected reply: expected {0}")]
    UnexpectedReply(&'static str),
}

impl NfsError {
    /// Builds a [`NfsError::Client`] from an errno value.
    pub fn from_errno(code: i32) -> Self {
        let message = std::io::Error::from_raw_os_error(code.abs()).to_string();
        NfsError::Client { code, message }
    }

    /// Attributes a library failure to the mount of `server:export`.
    ///
    /// Errors that already carry their own meaning (timeouts, connection
    /// loss) are returned unchanged.
    pub fn into_mount_error(self, server: &str, export: &str) -> Self {
        match self {
            NfsError::Client { code, message } => NfsError::Mount {
                server: server.to_string(),
                export: export.to_string(),
                code,
                message,
            },
            other => other,
        }
    }

    /// Converts this error to a libc error code.
    pub fn to_errno(&self) -> i32 {
        match self {
            NfsError::MalformedUri(_) | NfsError::DuplicateCallback(_) => libc::EINVAL,
            NfsError::Client { code, .. } | NfsError::Mount { code, .. } => code.abs(),
            NfsError::MountTimeout(_) => libc::ETIMEDOUT,
            NfsError::NotMounted => libc::ENOTCONN,
            NfsError::Connection { .. } => libc::ECONNRESET,
            NfsError::NotRegularFile => libc::EISDIR,
            NfsError::InvalidState(_) => libc::EBADF,
            NfsError::Cancelled => libc::ECANCELED,
            NfsError::Shutdown | NfsError::NoRuntime => libc::ESHUTDOWN,
            NfsError::UnexpectedReply(_) => libc::EIO,
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(NfsError::NotRegularFile.to_errno(), libc::EISDIR);
        assert_eq!(
            NfsError::MountTimeout(Duration::from_secs(60)).to_errno(),
            libc::ETIMEDOUT
        );
        assert_eq!(NfsError::from_errno(-libc::ENOENT).to_errno(), libc::ENOENT);
        assert_eq!(NfsError::MalformedUri("x".into()).to_errno(), libc::EINVAL);
    }

    #[test]
    fn test_mount_error_keeps_errno() {
        let err = NfsError::from_errno(-libc::EACCES).into_mount_error("nas", "/music");
        match &err {
            NfsError::Mount { server, export, .. } => {
                assert_eq!(server, "nas");
                assert_eq!(export, "/music");
            }
            other => panic!("expected a mount error, got {other:?}"),
        }
        assert_eq!(err.to_errno(), libc::EACCES);

        let timeout = NfsError::MountTimeout(Duration::from_secs(1));
        assert_eq!(timeout.clone().into_mount_error("nas", "/music"), timeout);
    }

    #[test]
    fn test_display_includes_server_and_export() {
        let err = NfsError::Mount {
            server: "fileserver".into(),
            export: "/music".into(),
            code: -libc::EACCES,
            message: "access denied".into(),
        };
        assert_eq!(
            err.to_string(),
            "Mount of fileserver:/music failed: access denied"
        );
    }
}
