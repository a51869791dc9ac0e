//! The live interpreter: commits transitions, tracks history/stats, and
//! drives restoration after load.
//!
//! [`StateLayer::start`]/[`StateLayer::start_restoring`] run the initial
//! transition synchronously (so the caller's `Start` operation observes the
//! workflow settled into its first state), then hand the rest of the
//! workflow's life to a single detached job on its executor: the interpreter
//! loop that races the current state's `on_async` chain against external
//! transition requests, forever, until the workflow is canceled.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot, Notify};
use tracing::{debug, instrument, warn};

use crate::clock::Clock;
use crate::wait::{self, CancellationScope, StateChangedEvent, WaitError};
use crate::workflow::{TerminalOutcome, WorkflowFault, WorkflowInstance};

use super::state::{StateKind, StateTable};
use super::transition::{ancestor_chain, compute_path};

#[derive(Debug, Clone, Copy, Default)]
pub struct StateStats {
    pub entered_counter: u64,
    pub ignore_suppression_entered_counter: u64,
}

/// Couples a [`WorkflowInstance`] with a hierarchical state table and runs
/// the interpreter loop over it. One `StateLayer` per stateful workflow.
pub struct StateLayer<S: StateKind> {
    pub workflow: Arc<WorkflowInstance>,
    states: StateTable<S>,
    current: Mutex<Option<S>>,
    /// The innermost hidden child currently occupied beneath the last named
    /// state, if any — cleared whenever a non-hidden state commits.
    internal_state: Mutex<Option<S>>,
    history: Mutex<VecDeque<S>>,
    full_history: Mutex<VecDeque<(S, DateTime<Utc>)>>,
    full_history_limit: usize,
    stats: Mutex<HashMap<S, StateStats>>,
    is_restoring: AtomicBool,
    transient_history: Mutex<VecDeque<S>>,
    state_changed: broadcast::Sender<StateChangedEvent<S>>,
    initialized: tokio::sync::watch::Sender<bool>,
    /// Set while the interpreter loop is settled and waiting; an external
    /// [`StateLayer::initiate_transition_to`] call takes it to hand over its
    /// requested target.
    pending_transition: Mutex<Option<oneshot::Sender<S>>>,
    /// Notified every time `pending_transition` is (re)armed, so a caller
    /// that arrives before the loop first settles can wait for it instead of
    /// racing a second transition loop into existence.
    settled: Notify,
}

/// Reserved data key under which the current state history is persisted
/// alongside the rest of a workflow's data, so a reload can reconstruct the
/// path [`StateLayer::start_restoring`] needs to walk.
pub const STATE_HISTORY_KEY: &str = "__state_history__";

impl<S: StateKind + PartialEq + serde::Serialize> StateLayer<S> {
    pub fn new(workflow: Arc<WorkflowInstance>, states: StateTable<S>, full_history_limit: usize) -> Arc<Self> {
        let (state_changed, _) = broadcast::channel(256);
        let (initialized, _) = tokio::sync::watch::channel(false);
        Arc::new(Self {
            workflow,
            states,
            current: Mutex::new(None),
            internal_state: Mutex::new(None),
            history: Mutex::new(VecDeque::new()),
            full_history: Mutex::new(VecDeque::new()),
            full_history_limit: full_history_limit.max(1),
            stats: Mutex::new(HashMap::new()),
            is_restoring: AtomicBool::new(false),
            transient_history: Mutex::new(VecDeque::new()),
            state_changed,
            initialized,
            pending_transition: Mutex::new(None),
            settled: Notify::new(),
        })
    }

    pub fn current(&self) -> Option<S> {
        self.current.lock().clone()
    }

    pub fn previous(&self) -> Option<S> {
        let history = self.history.lock();
        if history.len() == 2 {
            history.front().cloned()
        } else {
            None
        }
    }

    /// The hidden child currently occupied beneath the last named state, if
    /// the interpreter has descended into one.
    pub fn internal_state(&self) -> Option<S> {
        self.internal_state.lock().clone()
    }

    pub fn is_restoring_state(&self) -> bool {
        self.is_restoring.load(Ordering::SeqCst)
    }

    pub fn subscribe_state_changed(&self) -> broadcast::Receiver<StateChangedEvent<S>> {
        self.state_changed.subscribe()
    }

    pub fn subscribe_initialized(&self) -> tokio::sync::watch::Receiver<bool> {
        self.initialized.subscribe()
    }

    pub fn entered_counter(&self, state: &S) -> u64 {
        self.stats.lock().get(state).map(|s| s.entered_counter).unwrap_or(0)
    }

    /// The `Start` operation for a fresh (never-persisted) workflow: validate
    /// the table, commit into `initial`, resolve the started signal, then
    /// hand the rest of the workflow's life to a detached run loop. Runs at
    /// most once per workflow.
    pub async fn start(self: &Arc<Self>, initial: S, clock: Arc<dyn Clock>) -> Result<(), WorkflowFault> {
        self.workflow.begin_start()?;
        self.states.validate(&self.workflow.known_action_names())?;

        let this = self.clone();
        let boot_clock = clock.clone();
        self.workflow
            .executor
            .run_or_inline(move || {
                let this = this.clone();
                async move { this.apply_transition(initial, &boot_clock).await }
            })
            .await??;

        self.workflow.mark_started();
        self.spawn_run_loop(clock)
    }

    /// The `Start` operation for a workflow reloaded from storage: replay
    /// `persisted_history` (oldest first) with enter-side effects suppressed
    /// in favor of activation handlers, then hand off to the run loop the
    /// same way [`Self::start`] does. Runs at most once per workflow.
    #[instrument(skip(self, persisted_history, clock))]
    pub async fn start_restoring(self: &Arc<Self>, persisted_history: Vec<S>, clock: Arc<dyn Clock>) -> Result<(), WorkflowFault> {
        self.workflow.begin_start()?;
        self.states.validate(&self.workflow.known_action_names())?;

        self.is_restoring.store(true, Ordering::SeqCst);
        *self.transient_history.lock() = persisted_history.into_iter().collect();
        let first = self.transient_history.lock().pop_front();

        match first {
            Some(first) => {
                let this = self.clone();
                let boot_clock = clock.clone();
                self.workflow
                    .executor
                    .run_or_inline(move || {
                        let this = this.clone();
                        async move { this.apply_transition(first, &boot_clock).await }
                    })
                    .await??;
            }
            None => {
                self.is_restoring.store(false, Ordering::SeqCst);
                let _ = self.initialized.send(true);
            }
        }

        self.workflow.mark_started();
        self.spawn_run_loop(clock)
    }

    fn spawn_run_loop(self: &Arc<Self>, clock: Arc<dyn Clock>) -> Result<(), WorkflowFault> {
        let this = self.clone();
        self.workflow
            .executor
            .spawn_job(move || async move {
                let result = this.run_loop(clock).await;
                this.finish_from_result(result).await;
            })
            .map_err(WorkflowFault::from)
    }

    /// Race the current state's `on_async` chain against external transition
    /// requests, applying whichever resolves first, until the workflow is
    /// canceled. This is the workflow's `RunAsync`.
    async fn run_loop(self: &Arc<Self>, clock: Arc<dyn Clock>) -> Result<(), WorkflowFault> {
        loop {
            match self.settle_and_wait().await {
                Some(next) => self.apply_transition(next, &clock).await?,
                None => return Ok(()),
            }
        }
    }

    /// Map how the run loop (and the bootstrap transition, for an
    /// immediately-faulting initial state) ended into a terminal outcome and
    /// deliver it through [`WorkflowInstance::finish`].
    async fn finish_from_result(self: &Arc<Self>, result: Result<(), WorkflowFault>) {
        let cancel_requested = self.workflow.cancellation.is_cancelled();
        let outcome = match result {
            Ok(()) => {
                if cancel_requested {
                    TerminalOutcome::Canceled
                } else {
                    TerminalOutcome::Completed
                }
            }
            Err(WorkflowFault::Canceled) if cancel_requested => TerminalOutcome::Canceled,
            Err(WorkflowFault::Canceled) => {
                TerminalOutcome::Failed(Arc::new(WorkflowFault::User(
                    "workflow canceled without a prior cancellation request".into(),
                )))
            }
            Err(fault) => TerminalOutcome::Failed(Arc::new(fault)),
        };
        self.workflow.finish(outcome).await;
    }

    /// Arm the handoff channel and race the current state's `on_async` chain
    /// against it. Returns the next transition target, or `None` once the
    /// workflow is canceled with nothing left to do.
    async fn settle_and_wait(self: &Arc<Self>) -> Option<S> {
        let scope = self.workflow.cancellation.child();
        let (tx, rx) = oneshot::channel();
        *self.pending_transition.lock() = Some(tx);
        self.settled.notify_waiters();

        tokio::select! {
            biased;
            requested = rx => {
                scope.cancel();
                requested.ok()
            }
            result = self.watch_async_operations(&scope) => {
                *self.pending_transition.lock() = None;
                result.ok()
            }
        }
    }

    /// Request a transition to `target` from outside the run loop (an action
    /// handler, a coordinator callback, a test). Hands the target to the
    /// interpreter via the same rendezvous `on_async` results use, waiting
    /// for the loop to have settled at least once if it hasn't yet — never
    /// starts a second, competing transition loop.
    pub async fn initiate_transition_to(self: &Arc<Self>, target: S) -> Result<(), WorkflowFault> {
        loop {
            if let Some(tx) = self.pending_transition.lock().take() {
                let _ = tx.send(target);
                return Ok(());
            }
            self.settled.notified().await;
        }
    }

    /// Walk from the innermost ancestor of the current state outward,
    /// returning the first allow/disallow decision found. A state's own
    /// `categories` contribute to its allowed set as though their names had
    /// been listed directly. `None` means no state expressed an opinion — the
    /// caller should fall back to the base workflow's default.
    pub fn is_action_allowed(&self, name: &str) -> Option<bool> {
        let current = self.current.lock().clone()?;
        let chain = ancestor_chain(&self.states, &current);
        for state in chain.iter().rev() {
            if let Some(cfg) = self.states.get(state) {
                if cfg.disallowed_actions.contains(name) {
                    return Some(false);
                }
                if cfg.allowed_actions.contains(name) {
                    return Some(true);
                }
                let in_category = cfg
                    .categories
                    .iter()
                    .any(|category| self.states.categories.get(category).is_some_and(|actions| actions.contains(name)));
                if in_category {
                    return Some(true);
                }
            }
        }
        None
    }

    /// Continuously evaluate the current state's `on_async` chains, racing
    /// them under `scope`, until one requests a transition.
    async fn watch_async_operations(self: &Arc<Self>, scope: &CancellationScope) -> Result<S, WaitError> {
        let current = self.current.lock().clone().ok_or(WaitError::Canceled)?;
        let ops = self.states.get(&current).map(|c| c.on_async.clone()).unwrap_or_default();
        if ops.is_empty() {
            scope.cancelled().await;
            return Err(WaitError::Canceled);
        }
        let factories: Vec<_> = ops
            .into_iter()
            .map(|op| {
                move |scope: CancellationScope| {
                    wait::required(async move {
                        loop {
                            if scope.is_cancelled() {
                                return Err(WaitError::Canceled);
                            }
                            match op.run().await {
                                Ok(Some(target)) => return Ok(target),
                                Ok(None) => continue,
                                Err(e) => return Err(WaitError::Faulted(Box::new(e))),
                            }
                        }
                    })
                }
            })
            .collect();
        let (_, target) = wait::wait_for_any(scope, factories).await?;
        Ok(target)
    }

    /// Apply one transition chain: compute the exit/enter path from the
    /// current state to `target`, commit each entered state in turn, and keep
    /// following any further target a handler requests until one settles with
    /// nothing further to do.
    async fn apply_transition(self: &Arc<Self>, mut target: S, clock: &Arc<dyn Clock>) -> Result<(), WorkflowFault> {
        let mut compute_exit = true;
        loop {
            let from = self.current.lock().clone();
            let is_restoring = self.is_restoring.load(Ordering::SeqCst);

            let enter_path = if compute_exit {
                if let Some(from) = &from {
                    let (exit_path, enter_path) = compute_path(&self.states, from, &target);
                    for state in &exit_path {
                        self.run_exit_handlers(state).await?;
                    }
                    enter_path
                } else {
                    vec![target.clone()]
                }
            } else {
                vec![target.clone()]
            };
            compute_exit = true;

            let mut requested = None;
            for state in enter_path {
                if let Some(next) = self.commit_and_enter(state.clone(), is_restoring, clock).await? {
                    requested = Some((state, next));
                    break;
                }
            }

            match requested {
                None => return Ok(()),
                Some((state, next)) if next == state => {
                    // self-restart: re-enter without running exit handlers
                    target = next;
                    compute_exit = false;
                }
                Some((_, next)) => {
                    target = next;
                }
            }
        }
    }

    async fn run_exit_handlers(self: &Arc<Self>, state: &S) -> Result<(), WorkflowFault> {
        let Some(cfg) = self.states.get(state) else { return Ok(()) };
        for handler in &cfg.on_exit {
            handler().await?;
        }
        Ok(())
    }

    /// Commit `state` as current, update history/stats, broadcast, then run
    /// its enter (or activate, while restoring) handlers. Returns a further
    /// requested target if a handler asked for one. Hidden states still
    /// become the tracked leaf (so ancestor walks and `on_async` resolution
    /// see them) and still run their handlers, but are kept out of the
    /// persisted/broadcast history — only [`Self::internal_state`] reflects
    /// them.
    async fn commit_and_enter(self: &Arc<Self>, state: S, is_restoring: bool, clock: &Arc<dyn Clock>) -> Result<Option<S>, WorkflowFault> {
        let is_hidden = self.states.get(&state).map(|c| c.is_hidden).unwrap_or(false);

        if is_hidden {
            *self.internal_state.lock() = Some(state.clone());
        } else {
            *self.internal_state.lock() = None;
            {
                let mut history = self.history.lock();
                history.push_back(state.clone());
                while history.len() > 2 {
                    history.pop_front();
                }
            }
            {
                let mut full = self.full_history.lock();
                full.push_back((state.clone(), clock.now()));
                while full.len() > self.full_history_limit {
                    full.pop_front();
                }
            }
            {
                let mut stats = self.stats.lock();
                let entry = stats.entry(state.clone()).or_default();
                entry.entered_counter += 1;
                if is_restoring {
                    entry.ignore_suppression_entered_counter += 1;
                }
            }
            // O4: the commit (history/stats/broadcast) happens before handlers
            // run, so the workflow is visible as "in" the new state to any
            // concurrent action dispatch as soon as this fires.
            let _ = self.state_changed.send(StateChangedEvent { new_state: state.clone() });
        }
        *self.current.lock() = Some(state.clone());

        let Some(cfg) = self.states.get(&state) else { return Ok(None) };
        let handlers: &[_] = if is_restoring { &cfg.on_activate } else { &cfg.on_enter };
        let mut further = None;
        for handler in handlers {
            if let Some(next) = handler().await? {
                further = Some(next);
                break;
            }
        }

        if is_hidden {
            return Ok(further);
        }

        if !is_restoring {
            self.persist_history().await?;
            return Ok(further);
        }

        let is_empty = self.transient_history.lock().is_empty();
        if is_empty {
            self.is_restoring.store(false, Ordering::SeqCst);
            let _ = self.initialized.send(true);
            self.persist_history().await?;
            debug!("state restoration complete");
            return Ok(further);
        }

        let expected_next = self.transient_history.lock().front().cloned();
        match (&further, &expected_next) {
            (Some(requested), Some(expected)) if requested == expected => {
                self.transient_history.lock().pop_front();
                Ok(further)
            }
            (None, Some(expected)) => {
                self.transient_history.lock().pop_front();
                Ok(Some(expected.clone()))
            }
            _ => {
                warn!(?state, "restoration diverged from persisted history, switching to normal entry");
                self.is_restoring.store(false, Ordering::SeqCst);
                self.transient_history.lock().clear();
                let _ = self.initialized.send(true);
                Ok(further)
            }
        }
    }

    async fn persist_history(self: &Arc<Self>) -> Result<(), WorkflowFault> {
        let history: Vec<S> = self.full_history.lock().iter().map(|(s, _)| s.clone()).collect();
        self.workflow.with_data_mut(|data| data.set_serialize(STATE_HISTORY_KEY, &history));
        self.workflow.save_workflow_data().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::persistence::{InMemoryRepository, Repository};
    use crate::workflow::WorkflowId;
    use std::sync::Arc as StdArc;
    use std::time::Duration;

    use super::super::state::StateBuilder;

    fn workflow() -> Arc<WorkflowInstance> {
        let repo: Arc<dyn Repository> = StdArc::new(InMemoryRepository::new());
        let wf = WorkflowInstance::new("order", repo);
        wf.assign_id(WorkflowId::from("wf-1")).unwrap();
        wf
    }

    fn clock() -> Arc<dyn Clock> {
        Arc::new(TestClock::new("2020-01-01T00:00:00Z".parse().unwrap()))
    }

    /// Give the detached run-loop job a moment to reach its first settle
    /// point before a test drives an external transition into it.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    #[tokio::test]
    async fn start_enters_initial_state_once() {
        let wf = workflow();
        let mut states = StateTable::new();
        states.insert("Open", StateBuilder::new().build()).unwrap();
        let layer = StateLayer::new(wf, states, 10);
        layer.start("Open", clock()).await.unwrap();
        assert_eq!(layer.current(), Some("Open"));
        assert_eq!(layer.entered_counter(&"Open"), 1);
    }

    #[tokio::test]
    async fn action_allowance_follows_current_state() {
        let wf = workflow();
        let mut states = StateTable::new();
        states.insert("Open", StateBuilder::new().allow_actions(["pay".to_string()]).build()).unwrap();
        states.insert("Closed", StateBuilder::new().build()).unwrap();
        let layer = StateLayer::new(wf, states, 10);
        layer.start("Open", clock()).await.unwrap();
        assert_eq!(layer.is_action_allowed("pay"), Some(true));
        settle().await;
        layer.initiate_transition_to("Closed").await.unwrap();
        settle().await;
        assert_eq!(layer.is_action_allowed("pay"), None);
    }

    #[tokio::test]
    async fn category_membership_allows_an_action() {
        let wf = workflow();
        let mut states = StateTable::new();
        states.define_category("editable", ["edit".to_string()]);
        states.insert("Open", StateBuilder::new().in_category("editable").build()).unwrap();
        let layer = StateLayer::new(wf, states, 10);
        layer.start("Open", clock()).await.unwrap();
        assert_eq!(layer.is_action_allowed("edit"), Some(true));
    }

    #[tokio::test]
    async fn history_caps_at_two_entries() {
        let wf = workflow();
        let mut states = StateTable::new();
        states.insert("A", StateBuilder::new().build()).unwrap();
        states.insert("B", StateBuilder::new().build()).unwrap();
        states.insert("C", StateBuilder::new().build()).unwrap();
        let layer = StateLayer::new(wf, states, 10);
        layer.start("A", clock()).await.unwrap();
        settle().await;
        layer.initiate_transition_to("B").await.unwrap();
        settle().await;
        layer.initiate_transition_to("C").await.unwrap();
        settle().await;
        assert_eq!(layer.current(), Some("C"));
        assert_eq!(layer.previous(), Some("B"));
    }

    #[tokio::test]
    async fn hidden_state_updates_internal_state_without_touching_history() {
        let wf = workflow();
        let mut states = StateTable::new();
        states.insert("Open", StateBuilder::new().build()).unwrap();
        states.insert("OpenInternal", StateBuilder::new().substate_of("Open").hidden().build()).unwrap();
        let layer = StateLayer::new(wf, states, 10);
        layer.start("Open", clock()).await.unwrap();
        settle().await;
        layer.initiate_transition_to("OpenInternal").await.unwrap();
        settle().await;
        assert_eq!(layer.current(), Some("OpenInternal"));
        assert_eq!(layer.internal_state(), Some("OpenInternal"));
        assert_eq!(layer.entered_counter(&"OpenInternal"), 0);
    }

    #[tokio::test]
    async fn restoration_follows_persisted_history_then_initializes() {
        let wf = workflow();
        let mut states = StateTable::new();
        states.insert("A", StateBuilder::new().build()).unwrap();
        states.insert("B", StateBuilder::new().build()).unwrap();
        let layer = StateLayer::new(wf, states, 10);
        let mut initialized = layer.subscribe_initialized();
        layer.start_restoring(vec!["A", "B"], clock()).await.unwrap();
        assert!(!layer.is_restoring_state());
        assert_eq!(layer.current(), Some("B"));
        initialized.changed().await.unwrap();
        assert!(*initialized.borrow());
    }

    #[tokio::test]
    async fn restoration_aborts_on_divergence() {
        let wf = workflow();
        let mut states = StateTable::new();
        states
            .insert(
                "A",
                StateBuilder::new().on_activate(Arc::new(|| Box::pin(async { Ok(Some("D")) }))).build(),
            )
            .unwrap();
        states.insert("B", StateBuilder::new().build()).unwrap();
        states.insert("D", StateBuilder::new().build()).unwrap();
        let layer = StateLayer::new(wf, states, 10);
        layer.start_restoring(vec!["A", "B"], clock()).await.unwrap();
        assert!(!layer.is_restoring_state());
        assert_eq!(layer.current(), Some("D"));
    }

    #[tokio::test]
    async fn on_async_goto_drives_the_run_loop_without_external_help() {
        let wf = workflow();
        let mut states = StateTable::new();
        states
            .insert("Waiting", StateBuilder::new().on_async(super::super::state::AsyncOperationStep::GoTo("Done")).build())
            .unwrap();
        states.insert("Done", StateBuilder::new().build()).unwrap();
        let layer = StateLayer::new(wf, states, 10);
        layer.start("Waiting", clock()).await.unwrap();
        let mut tries = 0;
        while layer.current() != Some("Done") && tries < 100 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            tries += 1;
        }
        assert_eq!(layer.current(), Some("Done"));
    }

    #[tokio::test]
    async fn starting_twice_is_rejected() {
        let wf = workflow();
        let mut states = StateTable::new();
        states.insert("Open", StateBuilder::new().build()).unwrap();
        let layer = StateLayer::new(wf, states, 10);
        layer.start("Open", clock()).await.unwrap();
        let err = layer.start("Open", clock()).await;
        assert!(matches!(err, Err(WorkflowFault::AlreadyStarted)));
    }

    #[tokio::test]
    async fn canceling_a_settled_workflow_completes_the_finish_continuation() {
        let wf = workflow();
        let mut states = StateTable::new();
        states.insert("Open", StateBuilder::new().build()).unwrap();
        let layer = StateLayer::new(wf.clone(), states, 10);
        let mut completed = wf.subscribe_completed();
        layer.start("Open", clock()).await.unwrap();
        wf.cancel_workflow();
        completed.changed().await.unwrap();
        assert!(matches!(*completed.borrow(), Some(TerminalOutcome::Canceled)));
    }
}
