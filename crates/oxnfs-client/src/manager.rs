//! Registry of shared connections.
//!
//! Every `(server, export)` pair gets at most one [`NfsConnection`]; all
//! readers of files under that export share it through leases.

use crate::base::BasePaths;
use crate::config::ClientConfig;
use crate::connection::NfsConnection;
use crate::context::ContextFactory;
use crate::error::NfsResult;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

struct RegistryInner {
    factory: Arc<dyn ContextFactory>,
    config: ClientConfig,
    base_paths: BasePaths,
    connections: DashMap<(String, String), NfsConnection>,
}

/// Hands out shared connections keyed by `(server, export)`.
///
/// Cloning is cheap; clones share the same connections.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections", &self.inner.connections.len())
            .field("base_paths", &self.inner.base_paths.len())
            .finish_non_exhaustive()
    }
}

impl ConnectionRegistry {
    /// Creates a registry that builds sessions with `factory`.
    ///
    /// Fails if one of `config.known_exports` is not an
    /// `nfs://server/export` URI.
    pub fn new(factory: Arc<dyn ContextFactory>, config: ClientConfig) -> NfsResult<Self> {
        let base_paths = BasePaths::new();
        for base in &config.known_exports {
            base_paths.add_uri(base)?;
        }
        Ok(Self {
            inner: Arc::new(RegistryInner {
                factory,
                config,
                base_paths,
                connections: DashMap::new(),
            }),
        })
    }

    /// Known export boundaries used when parsing URIs.
    pub fn base_paths(&self) -> &BasePaths {
        &self.inner.base_paths
    }

    /// The configuration connections are created with.
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Returns the connection for `(server, export)`, creating it on first
    /// use. Must be called from within a tokio runtime.
    pub fn get(&self, server: &str, export: &str) -> NfsResult<NfsConnection> {
        let key = (server.to_string(), export.to_string());
        let entry = self.inner.connections.entry(key).or_try_insert_with(|| {
            debug!(server, export, "creating connection");
            NfsConnection::spawn(
                server,
                export,
                Arc::clone(&self.inner.factory),
                self.inner.config.connection.clone(),
            )
        })?;
        Ok(entry.value().clone())
    }

    /// Drops the registry's handle to a connection. The connection shuts
    /// down once no reader holds it any more.
    pub fn remove(&self, server: &str, export: &str) -> Option<NfsConnection> {
        self.inner
            .connections
            .remove(&(server.to_string(), export.to_string()))
            .map(|(_, connection)| connection)
    }

    /// Number of connections.
    pub fn len(&self) -> usize {
        self.inner.connections.len()
    }

    /// True if no connection has been created.
    pub fn is_empty(&self) -> bool {
        self.inner.connections.is_empty()
    }

    /// Drops all connection handles held by the registry.
    pub fn clear(&self) {
        self.inner.connections.clear();
    }
}
