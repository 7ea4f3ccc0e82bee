//! Testing utilities for code built on the connection manager.
//!
//! - **Mock library**: [`MockServer`] and [`MockContext`], a fake client
//!   library driven through a real socket pair
//! - **Generators**: deterministic file content
//!
//! # Usage
//!
//! ```ignore
//! use oxnfs_client::testing::{MockServer, patterned_content};
//! use oxnfs_client::{ClientConfig, ConnectionRegistry, NfsFileReader};
//!
//! let server = MockServer::new();
//! server.add_export("/export");
//! server.add_file("/export", "/song.flac", patterned_content(4096));
//!
//! let registry = ConnectionRegistry::new(server.factory(), ClientConfig::default())?;
//! let mut reader = NfsFileReader::new(registry);
//! reader.open("nfs://host/export/song.flac")?;
//! ```

mod generators;
mod mock;

pub use generators::{patterned_content, read_all};
pub use mock::{Delivery, MockContext, MockServer, MockStats, MountBehavior};
