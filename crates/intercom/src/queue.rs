use crate::errors::IntercomError;
use std::{
    future::Future,
    sync::{Mutex, PoisonError},
};
use tokio::sync::oneshot;
use tracing::warn;

/// Runs asynchronous tasks one at a time, in the order they were enqueued.
///
/// The queue keeps a single "tail" signal that fires when the most recently enqueued task
/// settles. Each new task waits on the previous tail, runs, then fires its own signal, so
/// every caller sharing one instance observes a total order of side effects.
///
/// A task that fails (or panics) still releases the chain. There is no timeout and no
/// cancellation: a task that never finishes stalls every task behind it.
#[derive(Debug, Default)]
pub struct SerialQueue {
    tail: Mutex<Option<oneshot::Receiver<()>>>,
}

impl SerialQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Chain `factory` behind every task enqueued before it.
    ///
    /// The position in the queue is taken when this method is called, not when the returned
    /// future is first polled. Dropping the returned future does not cancel the task; it only
    /// discards its result. Must be called from within a tokio runtime.
    pub fn enqueue<F, Fut, T>(&self, factory: F) -> impl Future<Output = eyre::Result<T>> + Send
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = eyre::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel::<()>();
        let prev = self
            .tail
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(done_rx);

        let (result_tx, result_rx) = oneshot::channel();
        tokio::spawn(async move {
            if let Some(prev) = prev {
                // A closed channel means the previous task unwound; it is finished either way.
                drop(prev.await);
            }
            let out = factory().await;
            drop(done_tx);
            drop(result_tx.send(out));
        });

        async move {
            match result_rx.await {
                Ok(out) => out,
                Err(_closed) => {
                    warn!("queued task ended without producing a result");
                    Err(IntercomError::TaskAborted.into())
                }
            }
        }
    }
}
