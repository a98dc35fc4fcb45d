//! Coalescing of concurrent single-item requests into one batched call
//!
//! The SFU accepts a `tracks[]` array per signaling exchange, and reactive
//! pipelines commonly subscribe to several tracks in the same scheduler
//! turn. The dispatcher holds the first item of a burst in an open batch for
//! one cooperative yield (or until capacity), then runs the batch callback
//! exactly once and hands the single outcome back to every caller.

use crate::{Error, Result};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::trace;

struct OpenBatch<I, O> {
    id: u64,
    items: Vec<I>,
    waiters: Vec<oneshot::Sender<Result<O>>>,
}

struct BatchState<I, O> {
    open: Option<OpenBatch<I, O>>,
    serial: u64,
}

/// Batches concurrent [`submit`](BulkDispatcher::submit) calls into a single
/// callback invocation
///
/// One dispatcher instance exists per operation kind per session, so pushes,
/// pulls and closes batch separately while still serializing through the
/// session's scheduler inside their callbacks.
pub struct BulkDispatcher<I, O> {
    capacity: usize,
    state: Arc<Mutex<BatchState<I, O>>>,
}

impl<I, O> BulkDispatcher<I, O>
where
    I: Send + 'static,
    O: Clone + Send + 'static,
{
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Arc::new(Mutex::new(BatchState {
                open: None,
                serial: 0,
            })),
        }
    }

    /// Add `item` to the currently open batch, opening one if necessary, and
    /// wait for the batched outcome
    ///
    /// `batch_fn` runs once per batch with every coalesced item; whichever
    /// submission opened the batch (or filled it to capacity) supplies the
    /// callback that actually runs. All callers of the same batch receive
    /// clones of the same outcome. A caller that goes away before the flush
    /// leaves its item in the batch; the delivered outcome is simply
    /// discarded.
    pub async fn submit<F>(&self, item: I, batch_fn: F) -> Result<O>
    where
        F: FnOnce(Vec<I>) -> BoxFuture<'static, Result<O>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();

        enum Role<I, O> {
            Opened(u64),
            Joined,
            Filled(Vec<I>, Vec<oneshot::Sender<Result<O>>>),
        }

        let role = {
            let mut state = self.state.lock();
            match state.open.as_mut() {
                None => {
                    let id = state.serial;
                    state.serial += 1;
                    state.open = Some(OpenBatch {
                        id,
                        items: vec![item],
                        waiters: vec![tx],
                    });
                    Role::Opened(id)
                }
                Some(batch) => {
                    batch.items.push(item);
                    batch.waiters.push(tx);
                    if batch.items.len() >= self.capacity {
                        let batch = state.open.take().expect("batch present");
                        Role::Filled(batch.items, batch.waiters)
                    } else {
                        Role::Joined
                    }
                }
            }
        };

        match role {
            Role::Opened(id) => {
                // The flush runs in its own task so that no caller's
                // cancellation can strand a batch with queued waiters.
                let state = self.state.clone();
                tokio::spawn(async move {
                    // Keep the batch open for the rest of the current
                    // scheduler turn, then flush whatever accumulated.
                    tokio::task::yield_now().await;
                    tokio::task::yield_now().await;

                    let taken = {
                        let mut state = state.lock();
                        if state.open.as_ref().map(|batch| batch.id) == Some(id) {
                            state.open.take()
                        } else {
                            // already flushed by a capacity fill
                            None
                        }
                    };
                    if let Some(batch) = taken {
                        trace!(items = batch.items.len(), "flushing batch");
                        Self::flush(batch.items, batch.waiters, batch_fn).await;
                    }
                });
            }
            Role::Filled(items, waiters) => {
                trace!(items = items.len(), "flushing batch at capacity");
                Self::flush(items, waiters, batch_fn).await;
            }
            Role::Joined => {}
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Dispatch("batch dropped before flush".to_string())),
        }
    }

    async fn flush<F>(items: Vec<I>, waiters: Vec<oneshot::Sender<Result<O>>>, batch_fn: F)
    where
        F: FnOnce(Vec<I>) -> BoxFuture<'static, Result<O>> + Send + 'static,
    {
        let outcome = batch_fn(items).await;
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }
}
