//! Per-workflow serialized executor.
//!
//! Every workflow owns one [`SerializedExecutor`]: a single logical thread of
//! control fed by a mailbox. External callers on any tokio task may
//! [`SerializedExecutor::submit`] work. Only one job is ever *actively
//! running* at a time — the dispatch loop is a single task and never polls
//! two jobs' code concurrently — but a job that suspends (awaiting a wait
//! operator, a save, a nested call) yields the dispatch loop back to the
//! mailbox instead of blocking it, so other submissions keep flowing while
//! it's idle. Code already running on the executor can recurse back into it
//! via [`SerializedExecutor::run_or_inline`] without deadlocking on its own
//! queue.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task_local;

type BoxedJob = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("executor is closed")]
    Closed,
    #[error("task panicked: {0}")]
    Panicked(String),
}

task_local! {
    /// Set for the lifetime of the dispatch loop's own task so that code
    /// running on the executor can detect it is already "home" and should
    /// run inline instead of round-tripping through the mailbox.
    static ON_EXECUTOR: ();
}

/// A handle to a workflow's serialized executor. Cheap to clone; all clones
/// share the same mailbox and dispatch loop.
#[derive(Clone)]
pub struct SerializedExecutor {
    inner: Arc<Inner>,
}

struct Inner {
    tx: mpsc::UnboundedSender<BoxedJob>,
    closed: AtomicBool,
}

impl SerializedExecutor {
    /// Spawn the dispatch loop on the current tokio runtime and return a
    /// handle to it. The loop alternates, biased toward draining finished
    /// work first, between polling whichever jobs are currently suspended and
    /// accepting the next submission; a job that never suspends runs to
    /// completion before the loop looks at anything else, since polling it
    /// is the only thing happening on the task at that instant.
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<BoxedJob>();
        tokio::spawn(ON_EXECUTOR.scope((), async move {
            let mut in_flight = FuturesUnordered::new();
            loop {
                tokio::select! {
                    biased;
                    Some(()) = in_flight.next(), if !in_flight.is_empty() => {}
                    maybe_job = rx.recv() => {
                        match maybe_job {
                            Some(job) => in_flight.push(job()),
                            None => break,
                        }
                    }
                }
            }
            while in_flight.next().await.is_some() {}
        }));
        Self { inner: Arc::new(Inner { tx, closed: AtomicBool::new(false) }) }
    }

    /// True if the caller is already running on this executor's dispatch loop.
    pub fn is_inline(&self) -> bool {
        ON_EXECUTOR.try_with(|_| ()).is_ok()
    }

    /// Enqueue `f` and await its result. Fails with [`ExecutorError::Closed`]
    /// if the executor has shut down.
    pub async fn submit<F, Fut, T>(&self, f: F) -> Result<T, ExecutorError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(ExecutorError::Closed);
        }
        let (result_tx, result_rx) = oneshot::channel();
        let job: BoxedJob = Box::new(move || {
            Box::pin(async move {
                let value = f().await;
                let _ = result_tx.send(value);
            })
        });
        self.inner.tx.send(job).map_err(|_| ExecutorError::Closed)?;
        result_rx.await.map_err(|_| ExecutorError::Closed)
    }

    /// Enqueue `f` without waiting for it. Unlike [`submit`](Self::submit),
    /// the caller gets no result and no completion signal — use this for a
    /// long-lived job (a run loop) that must live on the executor so it
    /// serializes against everything else submitted to it, but that the
    /// caller starting it must not block on.
    pub fn spawn_job<F, Fut>(&self, f: F) -> Result<(), ExecutorError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(ExecutorError::Closed);
        }
        let job: BoxedJob = Box::new(move || Box::pin(f()));
        self.inner.tx.send(job).map_err(|_| ExecutorError::Closed)
    }

    /// Run `f` inline if already on the executor, otherwise enqueue and await
    /// it as [`submit`](Self::submit) would. Use this from handler code that
    /// needs to call back into workflow state without deadlocking.
    pub async fn run_or_inline<F, Fut, T>(&self, f: F) -> Result<T, ExecutorError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if self.is_inline() {
            Ok(f().await)
        } else {
            self.submit(f).await
        }
    }

    /// Reject all further submissions with [`ExecutorError::Closed`]. Jobs
    /// already enqueued still run to completion; the dispatch loop exits once
    /// every handle (and its mailbox sender) is dropped.
    pub fn cancel_and_drain(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }
}
