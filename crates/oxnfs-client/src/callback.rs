//! Cancellable completion handlers for in-flight requests.
//!
//! Every operation issued on a connection is registered as a
//! [`CancellableCallback`] under a [`CallbackId`]. When the client library
//! reports a completion for that identity the callback is removed from the
//! [`CallbackRegistry`] and its handler receives the result.
//!
//! A callback can be cancelled while the library still owns the request.
//! The library cannot abandon a request, so the callback stays registered
//! until the completion arrives; at that point nothing is delivered and any
//! file handle that would otherwise leak is handed back for a deferred close.
//!
//! # Cancelled opens
//!
//! ```text
//!   open issued ──► cancel() ──► completion Ok(Opened(fh)) ──► close(fh) later
//!                                completion Err(_)          ──► nothing to do
//! ```

use crate::context::{FileHandle, NfsContext, Reply};
use crate::error::{NfsError, NfsResult};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;
use tracing::{debug, warn};

static NEXT_CALLBACK_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one pending operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(pub u64);

impl CallbackId {
    /// Allocates a process-wide unique identity.
    pub fn next() -> Self {
        Self(NEXT_CALLBACK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for CallbackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cb-{}", self.0)
    }
}

/// Channel half that receives the result of one operation.
pub(crate) type ReplySender = oneshot::Sender<NfsResult<Reply>>;

/// Binds a completion handler to one in-flight request.
#[derive(Debug)]
pub struct CancellableCallback {
    id: CallbackId,
    /// `None` once cancelled.
    handler: Option<ReplySender>,
    /// The request is an open; a successful result carries a handle that
    /// must be closed if nobody receives it.
    open: bool,
    /// Handle to close when the request unwinds after cancellation.
    close_fh: Option<FileHandle>,
}

impl CancellableCallback {
    pub(crate) fn new(id: CallbackId, handler: ReplySender, open: bool) -> Self {
        Self {
            id,
            handler: Some(handler),
            open,
            close_fh: None,
        }
    }

    /// The identity this callback is registered under.
    pub fn id(&self) -> CallbackId {
        self.id
    }

    /// True if the request is an open.
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// True once the handler has been detached.
    pub fn is_cancelled(&self) -> bool {
        self.handler.is_none()
    }

    /// Detaches the handler. The completion will be swallowed.
    pub fn cancel(&mut self) {
        self.handler = None;
    }

    /// Detaches the handler and remembers `fh` for closing once the library
    /// has finished with the request.
    pub fn cancel_and_schedule_close(&mut self, fh: FileHandle) {
        debug_assert!(self.close_fh.is_none(), "{} already has a close scheduled", self.id);
        self.handler = None;
        self.close_fh = Some(fh);
    }

    /// Called right before the context this request was issued on is
    /// destroyed: a scheduled close is issued on the old context now, since
    /// the completion that would have triggered it will never arrive.
    pub fn prepare_destroy_context(&mut self, ctx: &mut dyn NfsContext) {
        if let Some(fh) = self.close_fh.take() {
            debug!(callback = %self.id, %fh, "closing handle before context teardown");
            if let Err(e) = ctx.close_async(fh) {
                warn!(callback = %self.id, %fh, error = %e, "close before teardown failed");
            }
        }
    }

    /// Delivers the completion.
    ///
    /// Returns a handle the caller must close after the current service
    /// call returns: either an opened handle nobody will receive, or the
    /// handle stored by [`cancel_and_schedule_close`](Self::cancel_and_schedule_close).
    pub fn complete(mut self, result: NfsResult<Reply>) -> Option<FileHandle> {
        if let Some(handler) = self.handler.take() {
            // The receiver may have gone away without a cancel reaching us.
            return match handler.send(result) {
                Err(Ok(Reply::Opened(fh))) => Some(fh),
                _ => None,
            };
        }

        if self.open
            && let Ok(Reply::Opened(fh)) = result
        {
            debug_assert!(self.close_fh.is_none());
            debug!(callback = %self.id, %fh, "cancelled open succeeded, closing handle");
            return Some(fh);
        }
        self.close_fh.take()
    }

    /// Fails the request without a library completion (the context is gone).
    pub fn fail(mut self, error: NfsError) {
        if let Some(handler) = self.handler.take() {
            let _ = handler.send(Err(error));
        }
    }
}

/// Pending callbacks of one connection, ordered by issue.
#[derive(Debug, Default)]
pub struct CallbackRegistry {
    callbacks: BTreeMap<CallbackId, CancellableCallback>,
}

impl CallbackRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback. An identity that is already pending is
    /// rejected and the callback handed back.
    pub fn insert(&mut self, callback: CancellableCallback) -> Result<(), CancellableCallback> {
        if self.callbacks.contains_key(&callback.id) {
            return Err(callback);
        }
        self.callbacks.insert(callback.id, callback);
        Ok(())
    }

    /// Removes the callback registered under `id`.
    pub fn remove(&mut self, id: CallbackId) -> Option<CancellableCallback> {
        self.callbacks.remove(&id)
    }

    /// Looks up a pending callback.
    pub fn get_mut(&mut self, id: CallbackId) -> Option<&mut CancellableCallback> {
        self.callbacks.get_mut(&id)
    }

    /// True if `id` is pending.
    pub fn contains(&self, id: CallbackId) -> bool {
        self.callbacks.contains_key(&id)
    }

    /// Number of pending callbacks.
    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    /// True if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    /// Runs [`CancellableCallback::prepare_destroy_context`] on every entry.
    pub fn prepare_destroy_context(&mut self, ctx: &mut dyn NfsContext) {
        for callback in self.callbacks.values_mut() {
            callback.prepare_destroy_context(ctx);
        }
    }

    /// Fails every pending callback with `error` and empties the registry.
    pub fn fail_all(&mut self, error: &NfsError) {
        for (_, callback) in std::mem::take(&mut self.callbacks) {
            callback.fail(error.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::NfsStat;

    fn callback(open: bool) -> (CancellableCallback, oneshot::Receiver<NfsResult<Reply>>) {
        let (tx, rx) = oneshot::channel();
        (CancellableCallback::new(CallbackId::next(), tx, open), rx)
    }

    // ========================================================================
    // Completion delivery
    // ========================================================================

    #[test]
    fn test_complete_delivers_to_live_handler() {
        let (cb, mut rx) = callback(false);
        let leftover = cb.complete(Ok(Reply::Stat(NfsStat::regular(3))));
        assert!(leftover.is_none());
        assert_eq!(rx.try_recv().unwrap(), Ok(Reply::Stat(NfsStat::regular(3))));
    }

    #[test]
    fn test_cancelled_handler_never_fires() {
        let (mut cb, mut rx) = callback(false);
        cb.cancel();
        assert!(cb.is_cancelled());
        assert!(cb.complete(Ok(Reply::Stat(NfsStat::regular(1)))).is_none());
        // Sender dropped without a value.
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dropped_receiver_open_returns_handle() {
        let (cb, rx) = callback(true);
        drop(rx);
        assert_eq!(cb.complete(Ok(Reply::Opened(FileHandle(7)))), Some(FileHandle(7)));
    }

    // ========================================================================
    // Cancellation cleanup
    // ========================================================================

    #[test]
    fn test_cancelled_open_success_yields_handle() {
        let (mut cb, _rx) = callback(true);
        cb.cancel();
        assert_eq!(cb.complete(Ok(Reply::Opened(FileHandle(9)))), Some(FileHandle(9)));
    }

    #[test]
    fn test_cancelled_open_failure_yields_nothing() {
        let (mut cb, _rx) = callback(true);
        cb.cancel();
        assert!(cb.complete(Err(NfsError::from_errno(libc::ENOENT))).is_none());
    }

    #[test]
    fn test_schedule_close_returned_on_completion() {
        let (mut cb, _rx) = callback(false);
        cb.cancel_and_schedule_close(FileHandle(4));
        assert!(cb.is_cancelled());
        assert_eq!(cb.complete(Err(NfsError::from_errno(libc::EIO))), Some(FileHandle(4)));
    }

    // ========================================================================
    // Registry
    // ========================================================================

    #[test]
    fn test_registry_rejects_duplicate_identity() {
        let mut registry = CallbackRegistry::new();
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        let id = CallbackId::next();
        assert!(registry.insert(CancellableCallback::new(id, tx1, false)).is_ok());
        let rejected = registry.insert(CancellableCallback::new(id, tx2, false));
        assert_eq!(rejected.unwrap_err().id(), id);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_registry_fail_all_notifies_live_handlers() {
        let mut registry = CallbackRegistry::new();
        let (live, mut live_rx) = callback(false);
        let (mut cancelled, mut cancelled_rx) = callback(false);
        cancelled.cancel();
        registry.insert(live).unwrap();
        registry.insert(cancelled).unwrap();

        registry.fail_all(&NfsError::Shutdown);

        assert!(registry.is_empty());
        assert_eq!(live_rx.try_recv().unwrap(), Err(NfsError::Shutdown));
        assert!(cancelled_rx.try_recv().is_err());
    }

    #[test]
    fn test_callback_ids_are_unique() {
        let a = CallbackId::next();
        let b = CallbackId::next();
        assert_ne!(a, b);
        assert!(b > a);
        assert_eq!(format!("{}", CallbackId(12)), "cb-12");
    }
}
