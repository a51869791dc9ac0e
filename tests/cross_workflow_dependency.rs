//! Cross-module integration test: an engine running two workflow types, a
//! coordinator wiring an action dependency between them, and the coordinator's
//! cancellation-propagation path — end to end, against the in-memory
//! repository and the deterministic testing clock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use workflow_runtime::prelude::*;

fn build_registry() -> WorkflowRegistry {
    let mut registry = WorkflowRegistry::new();
    registry
        .register(
            "order",
            Arc::new(|repo| {
                let wf = WorkflowInstance::new("order", repo);
                let mut states: StateTable<String> = StateTable::new();
                states.insert("Open".to_string(), StateBuilder::new().build()).unwrap();
                let layer = StateLayer::new(wf, states, 10);
                Arc::new(WorkflowLogicWrapper { layer, initial_state: "Open".to_string() }) as Arc<dyn WorkflowLogic>
            }),
        )
        .unwrap();
    registry
        .register(
            "invoice",
            Arc::new(|repo| {
                let wf = WorkflowInstance::new("invoice", repo);
                let mut states: StateTable<String> = StateTable::new();
                states.insert("Pending".to_string(), StateBuilder::new().build()).unwrap();
                states.insert("Sent".to_string(), StateBuilder::new().build()).unwrap();
                let layer = StateLayer::new(wf, states, 10);
                Arc::new(WorkflowLogicWrapper { layer, initial_state: "Pending".to_string() }) as Arc<dyn WorkflowLogic>
            }),
        )
        .unwrap();
    registry
}

#[tokio::test]
async fn shipped_action_on_order_sends_the_invoice() {
    let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
    let clock: Arc<dyn Clock> = Arc::new(TestClock::new("2020-01-01T00:00:00Z".parse().unwrap()));
    let engine = Engine::new(build_registry(), repo, clock.clone());

    let order = engine
        .create_workflow("order", Some(WorkflowId::from("order-1")), NamedValues::new(), NamedValues::new())
        .await
        .unwrap();
    order
        .instance()
        .configure_action("shipped", Arc::new(|_| Box::pin(async { Ok(()) })), vec![], false)
        .unwrap();
    engine
        .create_workflow("invoice", Some(WorkflowId::from("invoice-1")), NamedValues::new(), NamedValues::new())
        .await
        .unwrap();

    let coordinator = Arc::new(Coordinator::new());
    let engine_for_handler = engine.clone();
    coordinator.register_workflow_dependency(
        "order",
        "invoice",
        action_trigger(order.instance().clone(), "shipped", CancellationScope::new()),
        Arc::new(move |_src, dst| {
            let engine = engine_for_handler.clone();
            tokio::spawn(async move {
                if let Some(invoice) = engine.get_active_workflow_by_id(&dst) {
                    invoice.transition_to(serde_json::json!("Sent")).await.unwrap();
                }
            });
        }),
        Some(Arc::new(|_src, _dst| {})),
    );

    let mut mapping = HashMap::new();
    mapping.insert("order".to_string(), WorkflowId::from("order-1"));
    mapping.insert("invoice".to_string(), WorkflowId::from("invoice-1"));
    coordinator.set_workflows(&engine, mapping, true);

    order.instance().execute_action("shipped", NamedValues::new(), true, |_| true).await.unwrap();

    let invoice = engine.get_active_workflow_by_id(&WorkflowId::from("invoice-1")).unwrap();
    let key = workflow_runtime::state_machine::STATE_HISTORY_KEY;
    let mut waited = Duration::ZERO;
    while invoice.instance().data().get(key).is_none() && waited < Duration::from_secs(1) {
        tokio::time::sleep(Duration::from_millis(10)).await;
        waited += Duration::from_millis(10);
    }
    let history: Vec<String> = invoice.instance().data().get_as(key).unwrap();
    assert_eq!(history.last(), Some(&"Sent".to_string()));
}

#[tokio::test]
async fn canceling_order_runs_on_src_canceled_for_both_workflows() {
    let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
    let clock: Arc<dyn Clock> = Arc::new(TestClock::new("2020-01-01T00:00:00Z".parse().unwrap()));
    let engine = Engine::new(build_registry(), repo, clock);

    let order = engine
        .create_workflow("order", Some(WorkflowId::from("order-2")), NamedValues::new(), NamedValues::new())
        .await
        .unwrap();
    engine
        .create_workflow("invoice", Some(WorkflowId::from("invoice-2")), NamedValues::new(), NamedValues::new())
        .await
        .unwrap();

    let coordinator = Arc::new(Coordinator::new());
    let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let fired_clone = fired.clone();
    coordinator.register_workflow_dependency(
        "order",
        "invoice",
        action_trigger(order.instance().clone(), "shipped", CancellationScope::new()),
        Arc::new(|_src, _dst| {}),
        Some(Arc::new(move |_src, _dst| {
            fired_clone.store(true, std::sync::atomic::Ordering::SeqCst);
        })),
    );

    let mut mapping = HashMap::new();
    mapping.insert("order".to_string(), WorkflowId::from("order-2"));
    mapping.insert("invoice".to_string(), WorkflowId::from("invoice-2"));
    coordinator.set_workflows(&engine, mapping, true);

    order.instance().cancel_workflow();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(fired.load(std::sync::atomic::Ordering::SeqCst));
}
