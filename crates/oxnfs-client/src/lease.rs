//! Leases: shared interest in a mounted connection.
//!
//! A consumer that needs a connection mounted registers a [`Lease`]. The
//! connection keeps the sending half of the lease's event channel in one of
//! two ordered lists (pending mount, or active) and the consumer keeps the
//! [`Lease`] itself, which only holds a weak reference back to the
//! connection task. Dropping the lease unregisters it.
//!
//! Events are produced on the connection task only:
//!
//! | Event                        | Sent to          | After sending                 |
//! |------------------------------|------------------|-------------------------------|
//! | [`LeaseEvent::Ready`]        | pending leases   | lease moves to the active set |
//! | [`LeaseEvent::Failed`]       | pending leases   | lease is dropped              |
//! | [`LeaseEvent::Disconnected`] | active leases    | lease is dropped              |

use crate::connection::Command;
use crate::error::NfsError;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::trace;

static NEXT_LEASE_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a registered lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LeaseId(pub u64);

impl LeaseId {
    pub(crate) fn next() -> Self {
        Self(NEXT_LEASE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for LeaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "lease-{}", self.0)
    }
}

/// Notification delivered to a lease holder.
#[derive(Debug, Clone)]
pub enum LeaseEvent {
    /// The connection is mounted and operations may be issued.
    Ready,
    /// The mount this lease was waiting for failed.
    ///
    /// Every lease pending at the time of the failure receives the same
    /// error instance.
    Failed(Arc<NfsError>),
    /// The mounted session was lost.
    Disconnected(Arc<NfsError>),
}

impl LeaseEvent {
    /// True for events after which the connection no longer tracks the lease.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, LeaseEvent::Ready)
    }
}

pub(crate) type LeaseSender = mpsc::UnboundedSender<LeaseEvent>;

/// Connection-side list of lease channels, in registration order.
#[derive(Debug, Default)]
pub(crate) struct LeaseList {
    entries: Vec<(LeaseId, LeaseSender)>,
}

impl LeaseList {
    pub(crate) fn push(&mut self, id: LeaseId, events: LeaseSender) {
        debug_assert!(!self.contains(id), "{id} registered twice");
        self.entries.push((id, events));
    }

    /// Removes `id`; returns false if it was not in the list.
    pub(crate) fn remove(&mut self, id: LeaseId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry, _)| *entry != id);
        self.entries.len() != before
    }

    pub(crate) fn contains(&self, id: LeaseId) -> bool {
        self.entries.iter().any(|(entry, _)| *entry == id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn take(&mut self) -> Vec<(LeaseId, LeaseSender)> {
        std::mem::take(&mut self.entries)
    }

    /// Sends `event` to every lease and empties the list.
    pub(crate) fn drain_with(&mut self, event: &LeaseEvent) {
        for (id, events) in self.take() {
            if events.send(event.clone()).is_err() {
                trace!(lease = %id, "lease holder already gone");
            }
        }
    }
}

/// A consumer's registration on a connection.
///
/// Obtained from [`NfsConnection::add_lease`](crate::NfsConnection::add_lease).
/// Wait for [`LeaseEvent::Ready`] with [`recv`](Self::recv) before issuing
/// operations.
#[derive(Debug)]
pub struct Lease {
    id: LeaseId,
    events: mpsc::UnboundedReceiver<LeaseEvent>,
    connection: mpsc::WeakUnboundedSender<Command>,
    /// The connection no longer tracks this lease.
    detached: bool,
}

impl Lease {
    pub(crate) fn new(
        id: LeaseId,
        events: mpsc::UnboundedReceiver<LeaseEvent>,
        connection: mpsc::WeakUnboundedSender<Command>,
    ) -> Self {
        Self {
            id,
            events,
            connection,
            detached: false,
        }
    }

    /// The identity this lease is registered under.
    pub fn id(&self) -> LeaseId {
        self.id
    }

    /// Waits for the next event.
    ///
    /// Returns `None` once the connection task has exited. Cancel safe.
    pub async fn recv(&mut self) -> Option<LeaseEvent> {
        let event = self.events.recv().await;
        match &event {
            Some(event) if event.is_terminal() => self.detached = true,
            None => self.detached = true,
            Some(_) => {}
        }
        event
    }

    /// Unregisters the lease from its connection.
    pub fn release(mut self) {
        self.unregister();
    }

    fn unregister(&mut self) {
        if std::mem::replace(&mut self.detached, true) {
            return;
        }
        if let Some(connection) = self.connection.upgrade() {
            let _ = connection.send(Command::RemoveLease { id: self.id });
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.unregister();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_list_keeps_order_and_removes() {
        let mut list = LeaseList::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        let (a, b, c) = (LeaseId::next(), LeaseId::next(), LeaseId::next());
        list.push(a, tx.clone());
        list.push(b, tx.clone());
        list.push(c, tx);
        assert!(list.remove(b));
        assert!(!list.remove(b));
        let ids: Vec<_> = list.take().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![a, c]);
        assert!(list.is_empty());
    }

    #[test]
    fn test_drain_with_sends_same_error_instance() {
        let mut list = LeaseList::default();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        list.push(LeaseId::next(), tx1);
        list.push(LeaseId::next(), tx2);

        let error = Arc::new(NfsError::NotMounted);
        list.drain_with(&LeaseEvent::Failed(error.clone()));

        assert_eq!(list.len(), 0);
        for rx in [&mut rx1, &mut rx2] {
            match rx.try_recv().unwrap() {
                LeaseEvent::Failed(e) => assert!(Arc::ptr_eq(&e, &error)),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_drop_sends_remove_lease() {
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
        let (_events_tx, events_rx) = mpsc::unbounded_channel();
        let id = LeaseId::next();
        drop(Lease::new(id, events_rx, cmd_tx.downgrade()));
        match cmd_rx.try_recv().unwrap() {
            Command::RemoveLease { id: removed } => assert_eq!(removed, id),
            _ => panic!("expected RemoveLease"),
        }
    }

    #[tokio::test]
    async fn test_terminal_event_detaches() {
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut lease = Lease::new(LeaseId::next(), events_rx, cmd_tx.downgrade());
        events_tx
            .send(LeaseEvent::Disconnected(Arc::new(NfsError::Shutdown)))
            .unwrap();
        assert!(matches!(lease.recv().await, Some(LeaseEvent::Disconnected(_))));
        lease.release();
        // The connection already dropped the lease; nothing to unregister.
        assert!(cmd_rx.try_recv().is_err());
    }
}
