//! Serial execution timelines and one-shot replies
//!
//! A `Timeline` is a single task draining a FIFO of jobs, so no two jobs on
//! the same timeline ever run concurrently. Each connection gets its own.
//! Results travel back through a `Reply`, a oneshot-backed future that the
//! caller awaits on its own task, never on the timeline.

use super::BridgeError;
use futures::FutureExt;
use log::{debug, error};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Sending half of a `Reply`
pub type Responder<T> = oneshot::Sender<Result<T, BridgeError>>;

/// Result of a request-style operation, resolved exactly once
#[must_use = "a Reply does nothing unless awaited or dropped deliberately"]
pub struct Reply<T> {
    rx: oneshot::Receiver<Result<T, BridgeError>>,
}

/// Completion of a side-effect-only operation
pub type Ack = Reply<()>;

impl<T> Reply<T> {
    pub fn channel() -> (Self, Responder<T>) {
        let (tx, rx) = oneshot::channel();
        (Self { rx }, tx)
    }

    /// A reply that is already resolved
    pub fn ready(result: Result<T, BridgeError>) -> Self {
        let (reply, tx) = Self::channel();
        let _ = tx.send(result);
        reply
    }
}

impl<T> Future for Reply<T> {
    type Output = Result<T, BridgeError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(BridgeError::Interrupted)))
    }
}

/// A single ordered execution lane
pub struct Timeline {
    label: String,
    tx: mpsc::UnboundedSender<Job>,
}

impl Timeline {
    /// Spawn the worker task. Must be called inside a tokio runtime.
    ///
    /// The worker runs until every `Timeline` handle is dropped and the
    /// queued jobs are drained.
    pub fn spawn(label: impl Into<String>) -> Self {
        let label = label.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let worker_label = label.clone();

        tokio::spawn(async move {
            debug!("Timeline {} started", worker_label);
            while let Some(job) = rx.recv().await {
                if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                    error!("Timeline {}: job panicked, continuing with next job", worker_label);
                }
            }
            debug!("Timeline {} drained", worker_label);
        });

        Self { label, tx }
    }

    /// Queue a job behind everything already queued. Returns false if the
    /// worker is gone.
    pub fn enqueue<F>(&self, job: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.tx.send(Box::pin(job)).is_err() {
            error!("Timeline {} is not running, job dropped", self.label);
            return false;
        }
        true
    }

    /// Queue a job whose result resolves the returned `Reply`
    pub fn request<T, F>(&self, job: F) -> Reply<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, BridgeError>> + Send + 'static,
    {
        let (reply, responder) = Reply::channel();
        self.enqueue(async move {
            let _ = responder.send(job.await);
        });
        reply
    }
}
