//! Task Orchestrator scenarios (spec §8 S4, invariants 1-2).

use std::time::Duration;

use tempfile::tempdir;
use tokio::time::{sleep, timeout};

use wintermute_gateway::events::{EventBus, GatewayEvent};
use wintermute_gateway::executor::Executor;
use wintermute_gateway::orchestrator::{TaskHandle, TaskOrchestrator};
use wintermute_gateway::planner::Planner;
use wintermute_gateway::policy::CommandPolicy;
use wintermute_gateway::registry::ToolRegistry;
use wintermute_gateway::replanner::Replanner;
use wintermute_gateway::runtime::{RuntimeLimits, ToolRuntime};
use wintermute_gateway::session::SessionStore;
use wintermute_gateway::types::{ChannelSessionKey, TaskState};

async fn orchestrator() -> (TaskOrchestrator, EventBus) {
    let dir = tempdir().unwrap();
    let registry = ToolRegistry::new();
    let bus = EventBus::new();
    let approval_flow = wintermute_gateway::approval_flow::ApprovalFlow::new(
        dir.path().join("approvals.json"),
        Duration::from_secs(900),
        bus.clone(),
    )
    .await
    .unwrap();
    let runtime = ToolRuntime::new(
        registry.clone(),
        approval_flow,
        bus.clone(),
        RuntimeLimits {
            default_timeout: Duration::from_secs(5),
            invocation_ttl: Duration::from_secs(600),
            max_concurrent: 4,
        },
        None::<(String, CommandPolicy)>,
    );
    let sessions = SessionStore::new(dir.path().to_path_buf());
    let planner = Planner::new(registry, None);
    let handle = TaskHandle::new(bus.clone());
    let executor = Executor::new(runtime, sessions.clone(), Replanner::default(), handle.clone(), bus.clone());
    (TaskOrchestrator::new(handle, sessions, planner, executor, bus.clone()), bus)
}

/// S4: three `chat.send` requests on the same channel-session key run
/// strictly one at a time and their terminal notifications arrive in
/// issuance order.
#[tokio::test]
async fn three_requests_on_one_key_complete_in_fifo_order() {
    let (orchestrator, bus) = orchestrator().await;
    let mut events = bus.subscribe();

    let key = ChannelSessionKey::new("cli", "room", "user");
    let first = orchestrator.create_task(key.clone(), "first message".to_string(), Vec::new()).await;
    let second = orchestrator.create_task(key.clone(), "second message".to_string(), Vec::new()).await;
    let third = orchestrator.create_task(key, "third message".to_string(), Vec::new()).await;

    let mut completion_order = Vec::new();
    timeout(Duration::from_secs(5), async {
        while completion_order.len() < 3 {
            if let Ok(GatewayEvent::TaskCompleted { task_id, .. }) = events.recv().await {
                completion_order.push(task_id);
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(completion_order, vec![first.task_id, second.task_id, third.task_id]);
}

/// Invariant 1 (per-key serialization): two distinct channel-session keys
/// make progress concurrently rather than serializing against each other.
#[tokio::test]
async fn distinct_keys_run_independently() {
    let (orchestrator, _bus) = orchestrator().await;

    let key_a = ChannelSessionKey::new("cli", "room-a", "user");
    let key_b = ChannelSessionKey::new("cli", "room-b", "user");
    let task_a = orchestrator.create_task(key_a, "hello a".to_string(), Vec::new()).await;
    let task_b = orchestrator.create_task(key_b, "hello b".to_string(), Vec::new()).await;

    timeout(Duration::from_secs(5), async {
        loop {
            let a = orchestrator.get(task_a.task_id).await.unwrap();
            let b = orchestrator.get(task_b.task_id).await.unwrap();
            if a.state == TaskState::Done && b.state == TaskState::Done {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}
