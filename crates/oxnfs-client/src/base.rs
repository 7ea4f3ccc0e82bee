//! Known export boundaries.
//!
//! An `nfs://` URI does not say where the export ends and the path inside it
//! begins. When the export of a server is known in advance it is registered
//! here and URI parsing splits at that boundary; otherwise the parser falls
//! back to the last slash.

use crate::error::{NfsError, NfsResult};
use crate::uri::strip_scheme;
use parking_lot::RwLock;

/// Registry of `(server, export)` pairs whose export boundary is known.
#[derive(Debug, Default)]
pub struct BasePaths {
    bases: RwLock<Vec<(String, String)>>,
}

impl BasePaths {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a base from an `nfs://server/export` URI.
    pub fn add_uri(&self, uri: &str) -> NfsResult<()> {
        let rest = strip_scheme(uri).ok_or_else(|| NfsError::MalformedUri(uri.to_string()))?;
        let slash = rest
            .find('/')
            .filter(|&idx| idx > 0)
            .ok_or_else(|| NfsError::MalformedUri(uri.to_string()))?;
        let (server, export) = rest.split_at(slash);
        self.add(server, export);
        Ok(())
    }

    /// Registers `export` (with leading slash) as a known export of `server`.
    /// A trailing slash is ignored.
    pub fn add(&self, server: &str, export: &str) {
        let export = export.trim_end_matches('/');
        let mut bases = self.bases.write();
        if !bases.iter().any(|(s, e)| s == server && e == export) {
            bases.push((server.to_string(), export.to_string()));
        }
    }

    /// Returns the length of the registered export `path` starts with, if
    /// any. The match must end at a path separator or at the end of `path`.
    pub fn check(&self, server: &str, path: &str) -> Option<usize> {
        self.bases
            .read()
            .iter()
            .filter(|(s, _)| s == server)
            .filter_map(|(_, export)| {
                let after = path.strip_prefix(export.as_str())?;
                (after.is_empty() || after.starts_with('/')).then_some(export.len())
            })
            .max()
    }

    /// Number of registered bases.
    pub fn len(&self) -> usize {
        self.bases.read().len()
    }

    /// True if no base is registered.
    pub fn is_empty(&self) -> bool {
        self.bases.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_matches_at_separator() {
        let bases = BasePaths::new();
        bases.add("nas", "/export");
        assert_eq!(bases.check("nas", "/export/dir/file"), Some(7));
        assert_eq!(bases.check("nas", "/export"), Some(7));
        assert_eq!(bases.check("nas", "/exports/file"), None);
        assert_eq!(bases.check("other", "/export/file"), None);
    }

    #[test]
    fn test_longest_base_wins() {
        let bases = BasePaths::new();
        bases.add("nas", "/data");
        bases.add("nas", "/data/music/");
        assert_eq!(bases.check("nas", "/data/music/a.flac"), Some(11));
        assert_eq!(bases.check("nas", "/data/video/a.mkv"), Some(5));
    }

    #[test]
    fn test_add_uri() {
        let bases = BasePaths::new();
        bases.add_uri("NFS://nas/media").unwrap();
        bases.add_uri("nfs://nas/media/").unwrap();
        assert_eq!(bases.len(), 1);
        assert!(bases.add_uri("nfs://nas").is_err());
        assert!(bases.add_uri("smb://nas/media").is_err());
    }
}
