//! Client configuration.
//!
//! Configuration is plain data: it can be built in code with the builder
//! methods or deserialized from a host application's configuration file.
//! Durations use humantime notation (`"60s"`, `"1m"`).

use serde::Deserialize;
use std::time::Duration;

/// Default time a mount may take before it is treated as failed (1 minute).
pub const DEFAULT_MOUNT_TIMEOUT: Duration = Duration::from_secs(60);

/// Per-connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// How long a mount may stay in flight before it fails with
    /// [`NfsError::MountTimeout`](crate::NfsError::MountTimeout).
    ///
    /// Default: 60 seconds.
    #[serde(with = "humantime_serde")]
    pub mount_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            mount_timeout: DEFAULT_MOUNT_TIMEOUT,
        }
    }
}

impl ConnectionConfig {
    /// Sets the mount timeout.
    #[must_use]
    pub fn with_mount_timeout(mut self, timeout: Duration) -> Self {
        self.mount_timeout = timeout;
        self
    }
}

/// Settings for a [`ConnectionRegistry`](crate::ConnectionRegistry).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Settings applied to every connection the registry creates.
    #[serde(flatten)]
    pub connection: ConnectionConfig,

    /// Base URIs (`nfs://server/export`) whose export boundary is known in
    /// advance. URIs under one of these are split at the export instead of
    /// at their last slash.
    pub known_exports: Vec<String>,
}

impl ClientConfig {
    /// Sets the mount timeout for all connections.
    #[must_use]
    pub fn with_mount_timeout(mut self, timeout: Duration) -> Self {
        self.connection.mount_timeout = timeout;
        self
    }

    /// Registers a known export base URI.
    #[must_use]
    pub fn with_known_export(mut self, base: impl Into<String>) -> Self {
        self.known_exports.push(base.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_mount_timeout() {
        assert_eq!(ConnectionConfig::default().mount_timeout, Duration::from_secs(60));
        assert!(ClientConfig::default().known_exports.is_empty());
    }

    #[test]
    fn test_builder() {
        let config = ClientConfig::default()
            .with_mount_timeout(Duration::from_millis(250))
            .with_known_export("nfs://host/export");
        assert_eq!(config.connection.mount_timeout, Duration::from_millis(250));
        assert_eq!(config.known_exports, vec!["nfs://host/export".to_string()]);
    }

    #[test]
    fn test_deserialize_humantime() {
        let config: ClientConfig = serde_json::from_str(
            r#"{"mount_timeout": "2m 30s", "known_exports": ["nfs://nas/media"]}"#,
        )
        .unwrap();
        assert_eq!(config.connection.mount_timeout, Duration::from_secs(150));
        assert_eq!(config.known_exports.len(), 1);
    }

    #[test]
    fn test_deserialize_empty_uses_defaults() {
        let config: ClientConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, ClientConfig::default());
    }
}
