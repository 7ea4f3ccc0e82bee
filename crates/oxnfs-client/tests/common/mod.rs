//! Shared harness for connection and reader integration tests.
//!
//! Provides `TestServer`, a fake NFS server with a small file tree plus a
//! registry wired to it, and polling helpers for asserting on state the
//! connection task changes asynchronously.

// Not all tests use all helpers
#![allow(dead_code)]

use bytes::Bytes;
use oxnfs_client::testing::{patterned_content, MockServer};
use oxnfs_client::{
    ClientConfig, ConnectionRegistry, ConnectionStatus, Lease, LeaseEvent, MountState,
    NfsConnection, NfsFileReader,
};
use std::sync::Once;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

pub const HOST: &str = "fileserver";
pub const EXPORT: &str = "/export";
pub const FILE_PATH: &str = "/dir/file.txt";
pub const FILE_URI: &str = "nfs://fileserver/export/dir/file.txt";
pub const DIR_URI: &str = "nfs://fileserver/export/dir";
pub const FILE_SIZE: usize = 10_000;

/// Upper bound for anything a test waits on.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Mount timeout used by tests that let mounts hang.
pub const SHORT_MOUNT_TIMEOUT: Duration = Duration::from_millis(100);

const POLL_INTERVAL: Duration = Duration::from_millis(5);

static TRACING: Once = Once::new();

/// Installs a tracing subscriber honouring `RUST_LOG`, once per process.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A fake server with `/export/dir/file.txt` and a registry that knows
/// `/export` is an export.
pub struct TestServer {
    pub server: MockServer,
    pub registry: ConnectionRegistry,
}

impl TestServer {
    pub fn new() -> Self {
        Self::with_config(ClientConfig::default())
    }

    pub fn with_mount_timeout(timeout: Duration) -> Self {
        Self::with_config(ClientConfig::default().with_mount_timeout(timeout))
    }

    pub fn with_config(config: ClientConfig) -> Self {
        init_tracing();
        let server = MockServer::new();
        server.add_export(EXPORT);
        server.add_directory(EXPORT, "/dir");
        server.add_file(EXPORT, FILE_PATH, file_content());
        server.add_file(EXPORT, "/dir/empty.txt", Bytes::new());

        let config = config.with_known_export(format!("nfs://{HOST}{EXPORT}"));
        let registry = ConnectionRegistry::new(server.factory(), config)
            .expect("registry config is valid");
        Self { server, registry }
    }

    /// The shared connection for the test export.
    pub fn connection(&self) -> NfsConnection {
        self.registry
            .get(HOST, EXPORT)
            .expect("connection can be created")
    }

    pub fn reader(&self) -> NfsFileReader {
        NfsFileReader::new(self.registry.clone())
    }
}

pub fn file_content() -> Bytes {
    patterned_content(FILE_SIZE)
}

/// Polls `condition` until it holds, panicking after [`TEST_TIMEOUT`].
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Polls the connection status until `condition` holds.
pub async fn wait_for_status(
    connection: &NfsConnection,
    what: &str,
    condition: impl Fn(&ConnectionStatus) -> bool,
) -> ConnectionStatus {
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    loop {
        let status = connection.status().await.expect("connection is alive");
        if condition(&status) {
            return status;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}, last status: {status:?}"
        );
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Round-trips a status request so every command sent before it has been
/// processed by the connection task.
pub async fn barrier(connection: &NfsConnection) {
    connection.status().await.expect("connection is alive");
}

/// Next lease event, panicking on timeout or connection shutdown.
pub async fn next_event(lease: &mut Lease) -> LeaseEvent {
    tokio::time::timeout(TEST_TIMEOUT, lease.recv())
        .await
        .expect("lease event within timeout")
        .expect("connection task alive")
}

/// Registers a lease and waits until the connection is mounted.
pub async fn mounted(connection: &NfsConnection) -> Lease {
    let mut lease = connection.add_lease().expect("lease can be added");
    match next_event(&mut lease).await {
        LeaseEvent::Ready => {}
        other => panic!("expected mount to succeed, got {other:?}"),
    }
    let status = connection.status().await.expect("connection is alive");
    assert_eq!(status.mount_state, MountState::Finished);
    lease
}
