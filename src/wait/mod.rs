//! Composable, cancellation-aware suspending primitives.
//!
//! These are the only legitimate suspension points inside workflow handler
//! code. Every operator here takes an explicit [`CancellationScope`] instead
//! of reading one from task-local or thread-local storage, so the caller
//! always knows exactly which scope a wait is bound to and can link child
//! scopes (see [`wait_for_any`]) without relying on ambient propagation.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::activation::{ActivationDateTracker, ActivationHandleAllocator};
use crate::clock::Clock;
use crate::data::NamedValues;

#[derive(Debug, Error)]
pub enum WaitError {
    #[error("wait was canceled")]
    Canceled,
    #[error("wait timed out{}", .0.as_deref().map(|d| format!(": {d}")).unwrap_or_default())]
    Timeout(Option<String>),
    #[error("handler faulted: {0}")]
    Faulted(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("{} waits faulted", .0.len())]
    Aggregate(Vec<WaitError>),
}

impl From<&str> for WaitError {
    fn from(msg: &str) -> Self {
        WaitError::Faulted(Box::new(std::io::Error::new(std::io::ErrorKind::Other, msg.to_string())))
    }
}

/// An explicit cancellation handle, threaded through every wait operator and
/// workflow handler signature instead of relying on task-local storage.
#[derive(Clone)]
pub struct CancellationScope(CancellationToken);

impl CancellationScope {
    pub fn new() -> Self {
        Self(CancellationToken::new())
    }

    /// A scope linked to this one: cancelling `self` also cancels the child,
    /// but cancelling the child alone leaves `self` untouched.
    pub fn child(&self) -> Self {
        Self(self.0.child_token())
    }

    pub fn cancel(&self) {
        self.0.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.0.cancelled().await
    }
}

impl Default for CancellationScope {
    fn default() -> Self {
        Self::new()
    }
}

/// Suspend until `deadline`. A deadline already in the past resolves
/// immediately without sleeping or touching the clock. A deadline of
/// [`DateTime::<Utc>::MAX_UTC`] never resolves on its own, only via `scope`
/// cancellation.
pub async fn wait_for_date(
    clock: &dyn Clock,
    deadline: DateTime<Utc>,
    scope: &CancellationScope,
    tracker: &Mutex<ActivationDateTracker>,
    alloc: &Mutex<ActivationHandleAllocator>,
) -> Result<(), WaitError> {
    if deadline <= clock.now() {
        return Ok(());
    }

    let handle = alloc.lock().next();
    tracker.lock().add(handle, deadline);
    let _unregister = UnregisterOnDrop { tracker, handle };

    if let Some(mut changes) = clock.subscribe() {
        loop {
            tokio::select! {
                _ = scope.cancelled() => return Err(WaitError::Canceled),
                changed = changes.changed() => {
                    if changed.is_err() {
                        return Err(WaitError::Canceled);
                    }
                    if *changes.borrow() >= deadline {
                        return Ok(());
                    }
                }
            }
        }
    }

    // Production clock: sleep in bounded segments so a system suspend/resume
    // or wall-clock jump is noticed within seven days instead of overshooting.
    loop {
        let now = clock.now();
        if now >= deadline {
            return Ok(());
        }
        let remaining = (deadline - now).to_std().unwrap_or(Duration::ZERO);
        let chunk = remaining.min(Duration::from_secs(7 * 24 * 3600));
        tokio::select! {
            _ = scope.cancelled() => return Err(WaitError::Canceled),
            _ = tokio::time::sleep(chunk) => {}
        }
    }
}

struct UnregisterOnDrop<'a> {
    tracker: &'a Mutex<ActivationDateTracker>,
    handle: crate::activation::ActivationHandle,
}

impl Drop for UnregisterOnDrop<'_> {
    fn drop(&mut self) {
        self.tracker.lock().on_cancel(self.handle);
    }
}

/// An action dispatch, broadcast to any waiter once its handler, stats, and
/// save have all completed (see [`crate::workflow::WorkflowInstance::execute_action`]).
#[derive(Debug, Clone)]
pub struct ActionExecuted {
    pub synonyms: Vec<String>,
    pub params: NamedValues,
}

/// Suspend until the next execution of an action sharing a synonym with
/// `name`.
pub async fn wait_for_action(
    mut events: broadcast::Receiver<ActionExecuted>,
    name: &str,
    scope: &CancellationScope,
) -> Result<NamedValues, WaitError> {
    loop {
        tokio::select! {
            _ = scope.cancelled() => return Err(WaitError::Canceled),
            event = events.recv() => match event {
                Ok(exec) if exec.synonyms.iter().any(|s| s == name) => return Ok(exec.params),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return Err(WaitError::Canceled),
            },
        }
    }
}

/// Like [`wait_for_action`], but resolves immediately if `name` has already
/// executed at least once.
pub async fn wait_for_action_with_was_executed_check(
    events: broadcast::Receiver<ActionExecuted>,
    name: &str,
    already_executed: bool,
    scope: &CancellationScope,
) -> Result<Option<NamedValues>, WaitError> {
    if already_executed {
        return Ok(None);
    }
    wait_for_action(events, name, scope).await.map(Some)
}

/// Broadcast when a stateful workflow commits a new state.
#[derive(Debug, Clone)]
pub struct StateChangedEvent<S> {
    pub new_state: S,
}

/// Suspend until the workflow's state matches `target` (or, with
/// `any = true`, until any change at all). `check_initial` evaluates the
/// *current* state synchronously before subscribing, regardless of whether
/// the workflow is currently restoring state; the subscription itself is
/// gated by `is_restoring_state` so changes raised mid-restoration never
/// resolve a pending wait (resolves spec ambiguity: restoration suppresses
/// the subscription, not the initial check).
pub async fn wait_for_state<S>(
    mut changes: broadcast::Receiver<StateChangedEvent<S>>,
    current: impl Fn() -> S,
    is_restoring_state: impl Fn() -> bool,
    target: Option<&S>,
    check_initial: bool,
    any: bool,
    scope: &CancellationScope,
) -> Result<S, WaitError>
where
    S: Clone + PartialEq + Send,
{
    if check_initial {
        let now = current();
        if any || target.map(|t| *t == now).unwrap_or(false) {
            return Ok(now);
        }
    }
    loop {
        tokio::select! {
            _ = scope.cancelled() => return Err(WaitError::Canceled),
            event = changes.recv() => match event {
                Ok(ev) if is_restoring_state() => { let _ = ev; continue; }
                Ok(ev) if any || target.map(|t| *t == ev.new_state).unwrap_or(false) => return Ok(ev.new_state),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return Err(WaitError::Canceled),
            },
        }
    }
}

/// A child task submitted to [`wait_for_any`]. `Optional` children never end
/// the group on success, but still count toward fault propagation.
pub enum WaitChild<T> {
    Required(BoxFuture<'static, Result<T, WaitError>>),
    Optional(BoxFuture<'static, Result<T, WaitError>>),
}

pub fn required<T>(fut: impl Future<Output = Result<T, WaitError>> + Send + 'static) -> WaitChild<T> {
    WaitChild::Required(Box::pin(fut))
}

pub fn optional<T>(fut: impl Future<Output = Result<T, WaitError>> + Send + 'static) -> WaitChild<T> {
    WaitChild::Optional(Box::pin(fut))
}

/// Race a set of children built from `factories`, each given a scope linked
/// to `scope`. Resolves to the index and value of the first non-optional
/// child to complete successfully. A fault in any child cancels the rest and
/// propagates (aggregated if more than one fault lands before draining
/// finishes). Ambient cancellation cancels every child and propagates
/// [`WaitError::Canceled`].
pub async fn wait_for_any<T, F>(scope: &CancellationScope, factories: Vec<F>) -> Result<(usize, T), WaitError>
where
    T: Send + 'static,
    F: FnOnce(CancellationScope) -> WaitChild<T>,
{
    let child_scope = scope.child();
    let mut pending: FuturesUnordered<Pin<Box<dyn Future<Output = (usize, bool, Result<T, WaitError>)> + Send>>> =
        factories
            .into_iter()
            .enumerate()
            .map(|(i, factory)| {
                let (fut, is_optional) = match factory(child_scope.clone()) {
                    WaitChild::Required(f) => (f, false),
                    WaitChild::Optional(f) => (f, true),
                };
                Box::pin(async move { (i, is_optional, fut.await) })
                    as Pin<Box<dyn Future<Output = (usize, bool, Result<T, WaitError>)> + Send>>
            })
            .collect();

    let mut winner = None;
    let mut faults = Vec::new();

    loop {
        tokio::select! {
            _ = scope.cancelled() => {
                child_scope.cancel();
                while pending.next().await.is_some() {}
                return Err(WaitError::Canceled);
            }
            next = pending.next() => {
                match next {
                    None => break,
                    Some((i, is_optional, Ok(value))) => {
                        if !is_optional {
                            winner = Some((i, value));
                            child_scope.cancel();
                            while pending.next().await.is_some() {}
                            break;
                        }
                    }
                    Some((_, _, Err(err))) => {
                        faults.push(err);
                        child_scope.cancel();
                        while pending.next().await.is_some() {}
                        break;
                    }
                }
            }
        }
    }

    if !faults.is_empty() {
        return Err(if faults.len() == 1 { faults.remove(0) } else { WaitError::Aggregate(faults) });
    }
    winner.map(Ok).unwrap_or(Err(WaitError::Canceled))
}

/// Chain `after` on the successful result of `task`; cancellation and faults
/// pass through untouched.
pub async fn then<T, U>(
    task: impl Future<Output = Result<T, WaitError>>,
    after: impl FnOnce(T) -> BoxFuture<'static, Result<U, WaitError>>,
) -> Result<U, WaitError> {
    let value = task.await?;
    after(value).await
}

/// Race `task` against a fixed timeout.
pub async fn wait_with_timeout<T>(
    task: impl Future<Output = Result<T, WaitError>>,
    timeout: Duration,
    description: Option<String>,
) -> Result<T, WaitError> {
    tokio::select! {
        result = task => result,
        _ = tokio::time::sleep(timeout) => Err(WaitError::Timeout(description)),
    }
}
