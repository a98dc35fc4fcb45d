//! FIFO serialization of signaling jobs
//!
//! WebRTC offer/answer exchanges mutate the peer connection's local and
//! remote descriptions and must not interleave. Every signaling round-trip
//! of a session funnels through one [`FifoScheduler`], which runs submitted
//! jobs strictly in submission order.

use crate::{Error, Result};
use std::future::Future;
use std::pin::Pin;
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

type BoxedJob = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Serializes asynchronous jobs: job *n+1* does not start until job *n*'s
/// future has settled, success or failure
///
/// A failed job never blocks the queue; its error is delivered to the
/// submitter and the worker moves on. Jobs submitted from within a running
/// job queue behind everything already scheduled.
#[derive(Debug, Clone)]
pub struct FifoScheduler {
    tx: mpsc::UnboundedSender<BoxedJob>,
}

impl FifoScheduler {
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<BoxedJob>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job.await;
            }
            trace!("fifo scheduler worker stopped");
        });
        Self { tx }
    }

    /// Queue a job and return a future resolving to its outcome
    ///
    /// The job is enqueued immediately; dropping the returned future does
    /// not withdraw it.
    pub fn schedule<T, Fut>(&self, fut: Fut) -> impl Future<Output = Result<T>>
    where
        T: Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let job: BoxedJob = Box::pin(async move {
            let _ = done_tx.send(fut.await);
        });
        let queued = self.tx.send(job).is_ok();

        async move {
            if !queued {
                return Err(Error::Dispatch("signaling scheduler is closed".to_string()));
            }
            match done_rx.await {
                Ok(result) => result,
                Err(_) => Err(Error::Dispatch(
                    "scheduled job dropped before completion".to_string(),
                )),
            }
        }
    }
}

impl Default for FifoScheduler {
    fn default() -> Self {
        Self::new()
    }
}
