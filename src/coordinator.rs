//! Cross-workflow dependency wiring.
//!
//! The coordinator never holds workflow definitions by reference — only
//! [`WorkflowId`] endpoints, looked up against the engine's bookkeeping at
//! fire-time — so a cycle of dependencies between workflow types never
//! becomes a cycle of `Arc`s. Triggers are supplied as factories so the
//! coordinator stays generic over whatever event a dependency actually
//! watches (an action, a state, or something a host application defines).

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::engine::{Engine, WorkflowLogic};
use crate::state_machine::{StateChangedEvent, StateKind, StateLayer};
use crate::wait::{CancellationScope, WaitError};
use crate::workflow::{WorkflowId, WorkflowInstance};

pub type DependencyHandler = Arc<dyn Fn(WorkflowId, WorkflowId) + Send + Sync>;
pub type TriggerFactory = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Result<(), WaitError>> + Send>> + Send + Sync>;

#[derive(Debug, Error, Clone)]
pub enum CoordinatorFault {
    #[error("dependency trigger from '{src}' to '{dst}' faulted: {reason}")]
    TriggerFailed { src: String, dst: String, reason: String },
    #[error("dependency slot '{0}' has no bound workflow")]
    UnboundSlot(String),
}

/// One registered dependency, stored by value: only the slot names and the
/// closures needed to watch and react, never an `Arc` to either workflow.
struct Dependency {
    src_slot: String,
    dst_slot: String,
    trigger: TriggerFactory,
    on_fired: DependencyHandler,
    on_src_canceled: Option<DependencyHandler>,
}

/// Wires dependencies between workflows that the engine runs, without either
/// workflow knowing about the other at definition time.
pub struct Coordinator {
    pending: Mutex<Vec<Dependency>>,
    slots: Mutex<HashMap<String, WorkflowId>>,
    unhandled: broadcast::Sender<CoordinatorFault>,
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl Coordinator {
    pub fn new() -> Self {
        let (unhandled, _) = broadcast::channel(64);
        Self { pending: Mutex::new(Vec::new()), slots: Mutex::new(HashMap::new()), unhandled }
    }

    pub fn subscribe_unhandled(&self) -> broadcast::Receiver<CoordinatorFault> {
        self.unhandled.subscribe()
    }

    /// Declare a dependency between two named slots. Registration order is
    /// preserved and governs the order dependencies are bound in
    /// [`Self::set_workflows`].
    pub fn register_workflow_dependency(
        &self,
        src_slot: impl Into<String>,
        dst_slot: impl Into<String>,
        trigger: TriggerFactory,
        on_fired: DependencyHandler,
        on_src_canceled: Option<DependencyHandler>,
    ) {
        self.pending.lock().push(Dependency {
            src_slot: src_slot.into(),
            dst_slot: dst_slot.into(),
            trigger,
            on_fired,
            on_src_canceled,
        });
    }

    /// Resolve `mapping` (slot name -> workflow id) against the engine's
    /// running workflows, then, if `init_deps`, spawn a watcher task per
    /// pending dependency in registration order.
    pub fn set_workflows(
        self: &Arc<Self>,
        engine: &Arc<Engine>,
        mapping: HashMap<String, WorkflowId>,
        init_deps: bool,
    ) -> HashMap<String, Arc<dyn WorkflowLogic>> {
        let mut resolved = HashMap::new();
        {
            let mut slots = self.slots.lock();
            for (slot, id) in &mapping {
                slots.insert(slot.clone(), id.clone());
                if let Some(logic) = engine.get_active_workflow_by_id(id) {
                    resolved.insert(slot.clone(), logic);
                }
            }
        }

        if init_deps {
            let deps: Vec<_> = {
                let mut pending = self.pending.lock();
                pending.drain(..).collect()
            };
            for dep in deps {
                self.bind(&dep, &resolved);
            }
        }

        resolved
    }

    fn bind(self: &Arc<Self>, dep: &Dependency, resolved: &HashMap<String, Arc<dyn WorkflowLogic>>) {
        let Some(src) = resolved.get(&dep.src_slot) else {
            let _ = self.unhandled.send(CoordinatorFault::UnboundSlot(dep.src_slot.clone()));
            return;
        };
        let Some(dst_id) = self.slots.lock().get(&dep.dst_slot).cloned() else {
            let _ = self.unhandled.send(CoordinatorFault::UnboundSlot(dep.dst_slot.clone()));
            return;
        };
        let Some(src_id) = src.instance().id().cloned() else {
            return;
        };
        let cancellation = src.instance().cancellation.clone();
        let trigger = dep.trigger.clone();
        let on_fired = dep.on_fired.clone();
        let on_src_canceled = dep.on_src_canceled.clone();
        let unhandled = self.unhandled.clone();
        let src_slot = dep.src_slot.clone();
        let dst_slot = dep.dst_slot.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancellation.cancelled() => {
                        if let Some(handler) = &on_src_canceled {
                            handler(src_id.clone(), dst_id.clone());
                        }
                        break;
                    }
                    result = trigger() => {
                        match result {
                            Ok(()) => {
                                on_fired(src_id.clone(), dst_id.clone());
                                info!(src = %src_id, dst = %dst_id, "workflow dependency fired");
                            }
                            Err(e) => {
                                warn!(src = %src_slot, dst = %dst_slot, error = %e, "dependency trigger faulted");
                                let _ = unhandled.send(CoordinatorFault::TriggerFailed {
                                    src: src_slot.clone(),
                                    dst: dst_slot.clone(),
                                    reason: e.to_string(),
                                });
                                break;
                            }
                        }
                    }
                }
            }
        });
    }
}

/// Build a [`TriggerFactory`] that fires each time `name` (or a synonym of
/// it) executes on `instance`. Subscribes fresh on every call, so there is a
/// narrow window between one firing and the next subscription during which
/// an action execution could be missed; acceptable for the coarse-grained
/// cross-workflow signalling this is meant for.
pub fn action_trigger(instance: Arc<WorkflowInstance>, name: impl Into<String>, scope: CancellationScope) -> TriggerFactory {
    let name = name.into();
    Arc::new(move || {
        let instance = instance.clone();
        let name = name.clone();
        let scope = scope.clone();
        Box::pin(async move {
            let rx = instance.subscribe_actions();
            crate::wait::wait_for_action(rx, &name, &scope).await.map(|_| ())
        })
    })
}

/// Build a [`TriggerFactory`] that fires each time a stateful workflow
/// commits into `target`.
pub fn state_trigger<S>(layer: &Arc<StateLayer<S>>, target: S, scope: CancellationScope) -> TriggerFactory
where
    S: StateKind + PartialEq + serde::Serialize,
{
    let layer = layer.clone();
    let target = target;
    Arc::new(move || {
        let layer = layer.clone();
        let target = target.clone();
        let scope = scope.clone();
        Box::pin(async move {
            let rx: broadcast::Receiver<StateChangedEvent<S>> = layer.subscribe_state_changed();
            crate::wait::wait_for_state(
                rx,
                || layer.current().expect("state machine must be started before watching it"),
                || layer.is_restoring_state(),
                Some(&target),
                true,
                false,
                &scope,
            )
            .await
            .map(|_| ())
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::data::NamedValues;
    use crate::engine::{WorkflowLogicWrapper, WorkflowRegistry};
    use crate::persistence::{InMemoryRepository, Repository};
    use crate::state_machine::{StateBuilder, StateTable};
    use crate::workflow::WorkflowInstance;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn registry() -> WorkflowRegistry {
        let mut registry = WorkflowRegistry::new();
        registry
            .register(
                "shipper",
                Arc::new(|repo| {
                    let wf = WorkflowInstance::new("shipper", repo);
                    let mut states: StateTable<String> = StateTable::new();
                    states.insert("Waiting".to_string(), StateBuilder::new().build()).unwrap();
                    states.insert("Shipped".to_string(), StateBuilder::new().build()).unwrap();
                    let layer = StateLayer::new(wf, states, 10);
                    Arc::new(WorkflowLogicWrapper { layer, initial_state: "Waiting".to_string() }) as Arc<dyn WorkflowLogic>
                }),
            )
            .unwrap();
        registry
            .register(
                "biller",
                Arc::new(|repo| {
                    let wf = WorkflowInstance::new("biller", repo);
                    let mut states: StateTable<String> = StateTable::new();
                    states.insert("Idle".to_string(), StateBuilder::new().build()).unwrap();
                    let layer = StateLayer::new(wf, states, 10);
                    Arc::new(WorkflowLogicWrapper { layer, initial_state: "Idle".to_string() }) as Arc<dyn WorkflowLogic>
                }),
            )
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn action_dependency_fires_once_bound() {
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
        let clock: Arc<dyn crate::clock::Clock> = Arc::new(crate::clock::SystemClock);
        let engine = Engine::new(registry(), repo, clock);
        let shipper = engine
            .create_workflow("shipper", Some(WorkflowId::from("ship-1")), NamedValues::new(), NamedValues::new())
            .await
            .unwrap();
        let biller = engine
            .create_workflow("biller", Some(WorkflowId::from("bill-1")), NamedValues::new(), NamedValues::new())
            .await
            .unwrap();
        shipper
            .instance()
            .configure_action("pay", Arc::new(|_| Box::pin(async { Ok(()) })), vec![], false)
            .unwrap();

        let coordinator = Arc::new(Coordinator::new());
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        coordinator.register_workflow_dependency(
            "shipper",
            "biller",
            action_trigger(shipper.instance().clone(), "pay", CancellationScope::new()),
            Arc::new(move |_src, _dst| fired_clone.store(true, Ordering::SeqCst)),
            None,
        );

        let mut mapping = HashMap::new();
        mapping.insert("shipper".to_string(), WorkflowId::from("ship-1"));
        mapping.insert("biller".to_string(), WorkflowId::from("bill-1"));
        coordinator.set_workflows(&engine, mapping, true);

        shipper.instance().execute_action("pay", NamedValues::new(), true, |_| true).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(fired.load(Ordering::SeqCst));
        let _ = biller;
    }

    #[test]
    fn unbound_slot_reports_unhandled() {
        let coordinator = Arc::new(Coordinator::new());
        let mut rx = coordinator.subscribe_unhandled();
        coordinator.register_workflow_dependency(
            "missing-src",
            "missing-dst",
            Arc::new(|| Box::pin(async { Ok(()) })),
            Arc::new(|_, _| {}),
            None,
        );
        let engine = Engine::new(registry(), Arc::new(InMemoryRepository::new()), Arc::new(crate::clock::SystemClock));
        coordinator.set_workflows(&engine, HashMap::new(), true);
        assert!(matches!(rx.try_recv(), Ok(CoordinatorFault::UnboundSlot(_))));
    }
}
