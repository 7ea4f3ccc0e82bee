//! Driving a reader from outside the runtime.
//!
//! A [`ReaderHandle`] moves an [`NfsFileReader`] into a task on the tokio
//! runtime and talks to it over channels, so threads that are not part of
//! the runtime (decoder threads, player threads) can use it. Closing from
//! such a thread is a blocking hand-off: [`ReaderHandle::close_blocking`]
//! returns only after the task has closed the reader.

use super::{NfsFileReader, ReaderEvent};
use crate::error::{NfsError, NfsResult};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

enum Control {
    Read { offset: u64, size: u32 },
    CancelRead,
    Close { done: oneshot::Sender<()> },
}

/// Owns a reader running on the tokio runtime.
#[derive(Debug)]
pub struct ReaderHandle {
    control: mpsc::UnboundedSender<Control>,
    events: mpsc::UnboundedReceiver<ReaderEvent>,
    task: JoinHandle<()>,
}

impl ReaderHandle {
    /// Moves `reader` into a task on the current runtime.
    pub fn spawn(reader: NfsFileReader) -> NfsResult<Self> {
        let runtime = Handle::try_current().map_err(|_| NfsError::NoRuntime)?;
        Ok(Self::spawn_on(reader, &runtime))
    }

    /// Moves `reader` into a task on `runtime`. Usable from any thread.
    pub fn spawn_on(reader: NfsFileReader, runtime: &Handle) -> Self {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let task = runtime.spawn(drive(reader, control_rx, events_tx));
        Self {
            control: control_tx,
            events: events_rx,
            task,
        }
    }

    /// Starts a read. The result arrives as an event.
    pub fn read(&self, offset: u64, size: u32) -> NfsResult<()> {
        self.control
            .send(Control::Read { offset, size })
            .map_err(|_| NfsError::Shutdown)
    }

    /// Abandons the outstanding read.
    pub fn cancel_read(&self) {
        let _ = self.control.send(Control::CancelRead);
    }

    /// Waits for the next event. `None` once the reader task has exited.
    pub async fn next_event(&mut self) -> Option<ReaderEvent> {
        self.events.recv().await
    }

    /// Blocking variant of [`next_event`](Self::next_event) for threads
    /// outside the runtime.
    ///
    /// # Panics
    ///
    /// Panics if called from within an asynchronous execution context.
    pub fn blocking_next_event(&mut self) -> Option<ReaderEvent> {
        self.events.blocking_recv()
    }

    /// Closes the reader and waits for the task to finish doing so.
    pub async fn close(self) {
        let (done, rx) = oneshot::channel();
        if self.control.send(Control::Close { done }).is_ok() {
            let _ = rx.await;
        }
        let _ = self.task.await;
    }

    /// Closes the reader from a thread outside the runtime, blocking until
    /// the task has closed it.
    ///
    /// # Panics
    ///
    /// Panics if called from within an asynchronous execution context.
    pub fn close_blocking(self) {
        let (done, rx) = oneshot::channel();
        if self.control.send(Control::Close { done }).is_ok() {
            let _ = rx.blocking_recv();
        }
        debug!("reader closed from foreign thread");
    }
}

async fn drive(
    mut reader: NfsFileReader,
    mut control: mpsc::UnboundedReceiver<Control>,
    events: mpsc::UnboundedSender<ReaderEvent>,
) {
    loop {
        tokio::select! {
            biased;
            command = control.recv() => match command {
                Some(Control::Read { offset, size }) => {
                    if let Err(e) = reader.read(offset, size) {
                        let _ = events.send(ReaderEvent::Error(e));
                    }
                }
                Some(Control::CancelRead) => reader.cancel_read(),
                Some(Control::Close { done }) => {
                    reader.close();
                    let _ = done.send(());
                    break;
                }
                None => {
                    reader.close();
                    break;
                }
            },
            Some(event) = reader.next_event() => {
                trace!(?event, "reader event");
                let _ = events.send(event);
            }
        }
    }
}
