//! Integration tests for cancellation and deferred closing.
//!
//! The fake server runs in manual delivery mode here, so every request is
//! provably still owned by the library when it is cancelled or its handle
//! closed.
//!
//! Bug class: handles opened by a request nobody waits for anymore leak on
//! the server, and handles closed while the library still uses them corrupt
//! its state.

mod common;

use common::*;
use oxnfs_client::testing::Delivery;
use oxnfs_client::{FileHandle, LeaseEvent, NfsConnection, NfsError};

async fn open_file(t: &TestServer, connection: &NfsConnection) -> FileHandle {
    let fh = connection.open(FILE_PATH, libc::O_RDONLY).await.unwrap();
    assert_eq!(t.server.open_handles(), 1);
    fh
}

// =============================================================================
// Cancel
// =============================================================================

#[tokio::test]
async fn test_cancelled_request_never_delivers() {
    let t = TestServer::new();
    let connection = t.connection();
    let _lease = mounted(&connection).await;
    t.server.set_delivery(Delivery::Manual);

    let mut op = connection.stat(FILE_PATH);
    wait_until("stat held by the server", || t.server.held_count() == 1).await;
    connection.cancel(op.id());
    barrier(&connection).await;

    // The callback stays registered until the library lets go of it.
    assert_eq!(connection.status().await.unwrap().pending_callbacks, 1);
    t.server.release_all();
    wait_for_status(&connection, "callback unwound", |s| s.pending_callbacks == 0).await;

    assert_eq!((&mut op).await, Err(NfsError::Cancelled));
}

#[tokio::test]
async fn test_cancelled_open_closes_resulting_handle() {
    let t = TestServer::new();
    let connection = t.connection();
    let _lease = mounted(&connection).await;
    t.server.set_delivery(Delivery::Manual);

    let op = connection.open(FILE_PATH, libc::O_RDONLY);
    wait_until("open held by the server", || t.server.held_count() == 1).await;
    op.cancel();
    barrier(&connection).await;
    t.server.release_all();

    wait_until("opened handle closed", || t.server.stats().closed.len() == 1).await;
    assert_eq!(t.server.open_handles(), 0);
    assert_eq!(t.server.stats().closes_during_service, 0);
}

#[tokio::test]
async fn test_dropped_open_closes_resulting_handle() {
    let t = TestServer::new();
    let connection = t.connection();
    let _lease = mounted(&connection).await;
    t.server.set_delivery(Delivery::Manual);

    drop(connection.open(FILE_PATH, libc::O_RDONLY));
    wait_until("open held by the server", || t.server.held_count() == 1).await;
    barrier(&connection).await;
    t.server.release_all();

    wait_until("opened handle closed", || t.server.open_handles() == 0).await;
}

#[tokio::test]
async fn test_cancel_after_reply_closes_opened_handle() {
    let t = TestServer::new();
    let connection = t.connection();
    let _lease = mounted(&connection).await;

    // Completed on the connection side, never consumed.
    let op = connection.open(FILE_PATH, libc::O_RDONLY);
    wait_for_status(&connection, "open completed", |s| s.pending_callbacks == 0).await;
    assert_eq!(t.server.open_handles(), 1);

    op.cancel();
    wait_until("opened handle closed", || t.server.open_handles() == 0).await;
}

#[tokio::test]
async fn test_failed_cancelled_open_closes_nothing() {
    let t = TestServer::new();
    let connection = t.connection();
    let _lease = mounted(&connection).await;
    t.server.set_delivery(Delivery::Manual);

    let op = connection.open("/missing", libc::O_RDONLY);
    wait_until("open held by the server", || t.server.held_count() == 1).await;
    op.cancel();
    barrier(&connection).await;
    t.server.release_all();

    wait_for_status(&connection, "callback unwound", |s| s.pending_callbacks == 0).await;
    assert!(t.server.stats().closed.is_empty());
}

// =============================================================================
// Deferred close
// =============================================================================

#[tokio::test]
async fn test_close_with_outstanding_read_waits_for_completion() {
    let t = TestServer::new();
    let connection = t.connection();
    let _lease = mounted(&connection).await;
    let fh = open_file(&t, &connection).await;
    t.server.set_delivery(Delivery::Manual);

    let read = connection.read(fh, 0, 16);
    wait_until("read held by the server", || t.server.held_count() == 1).await;
    read.cancel_and_close(fh);
    barrier(&connection).await;

    assert!(
        t.server.stats().closed.is_empty(),
        "handle must stay open while the read is outstanding"
    );

    t.server.release_all();
    wait_until("handle closed after read unwound", || {
        t.server.stats().closed == vec![fh]
    })
    .await;
    assert_eq!(t.server.stats().closes_during_service, 0);
    assert_eq!(t.server.open_handles(), 0);
}

#[tokio::test]
async fn test_cancel_and_close_after_completion_closes_immediately() {
    let t = TestServer::new();
    let connection = t.connection();
    let _lease = mounted(&connection).await;
    let fh = open_file(&t, &connection).await;

    let read = connection.read(fh, 0, 16);
    wait_for_status(&connection, "read completed", |s| s.pending_callbacks == 0).await;
    read.cancel_and_close(fh);

    wait_until("handle closed", || t.server.open_handles() == 0).await;
    assert_eq!(t.server.stats().closed, vec![fh]);
}

#[tokio::test]
async fn test_scheduled_close_is_issued_before_session_teardown() {
    let t = TestServer::new();
    let connection = t.connection();
    let mut lease = mounted(&connection).await;
    let fh = open_file(&t, &connection).await;
    t.server.set_delivery(Delivery::Manual);

    let read = connection.read(fh, 0, 16);
    wait_until("read held by the server", || t.server.held_count() == 1).await;
    read.cancel_and_close(fh);
    barrier(&connection).await;

    // The held read never completes: the session dies first.
    t.server.break_connections();
    assert!(matches!(
        next_event(&mut lease).await,
        LeaseEvent::Disconnected(_)
    ));

    wait_until("scheduled close issued", || t.server.stats().closed == vec![fh]).await;
    wait_until("held read dropped with the session", || {
        t.server.held_count() == 0
    })
    .await;
}

#[tokio::test]
async fn test_many_cancelled_opens_leak_nothing() {
    let t = TestServer::new();
    let connection = t.connection();
    let _lease = mounted(&connection).await;
    t.server.set_delivery(Delivery::Manual);

    let ops: Vec<_> = (0..16)
        .map(|_| connection.open(FILE_PATH, libc::O_RDONLY))
        .collect();
    wait_until("all opens held", || t.server.held_count() == 16).await;
    for (i, op) in ops.into_iter().enumerate() {
        if i % 2 == 0 {
            op.cancel();
        } else {
            drop(op);
        }
    }
    barrier(&connection).await;
    t.server.release_all();

    wait_until("all handles closed", || t.server.open_handles() == 0).await;
    assert_eq!(t.server.stats().closed.len(), 16);
    assert_eq!(t.server.stats().closes_during_service, 0);
}
