//! Parsing of `nfs://server/export/path` URIs.

use crate::base::BasePaths;
use crate::error::{NfsError, NfsResult};

const SCHEME: &str = "nfs://";

/// Returns the part after a case-insensitive `nfs://` prefix.
pub(crate) fn strip_scheme(uri: &str) -> Option<&str> {
    let prefix = uri.get(..SCHEME.len())?;
    prefix
        .eq_ignore_ascii_case(SCHEME)
        .then(|| &uri[SCHEME.len()..])
}

/// A URI split into its server, export and path components.
///
/// Both `export` and `path` start with a slash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NfsUri {
    /// Server host name or address.
    pub server: String,
    /// Exported directory on the server.
    pub export: String,
    /// Path of the file relative to the export.
    pub path: String,
}

impl NfsUri {
    /// Splits `uri` into server, export and path.
    ///
    /// The server ends at the first slash after the scheme. If the
    /// remainder starts with an export registered in `bases`, the export
    /// ends there; otherwise it ends at the last slash, which must be
    /// followed by a non-empty file name.
    pub fn parse(uri: &str, bases: &BasePaths) -> NfsResult<Self> {
        let malformed = || NfsError::MalformedUri(uri.to_string());

        let rest = strip_scheme(uri).ok_or_else(malformed)?;
        let slash = rest.find('/').ok_or_else(malformed)?;
        let (server, rest) = rest.split_at(slash);
        if server.is_empty() {
            return Err(malformed());
        }

        let (export, path) = if let Some(len) = bases.check(server, rest) {
            let (export, path) = rest.split_at(len);
            (export, if path.is_empty() { "/" } else { path })
        } else {
            let last = rest[1..].rfind('/').map(|idx| idx + 1).ok_or_else(malformed)?;
            let (export, path) = rest.split_at(last);
            if path.len() == 1 {
                return Err(malformed());
            }
            (export, path)
        };

        Ok(Self {
            server: server.to_string(),
            export: export.to_string(),
            path: path.to_string(),
        })
    }
}

impl std::fmt::Display for NfsUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let path = self.path.strip_prefix('/').unwrap_or(&self.path);
        write!(f, "nfs://{}{}/{}", self.server, self.export, path)
    }
}
