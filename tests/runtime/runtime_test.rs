//! Tool Runtime scenarios (spec §8 S1, S5).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::tempdir;
use uuid::Uuid;

use wintermute_gateway::approval_flow::ApprovalFlow;
use wintermute_gateway::events::EventBus;
use wintermute_gateway::policy::CommandPolicy;
use wintermute_gateway::registry::ToolRegistry;
use wintermute_gateway::runtime::{RuntimeLimits, ToolHandler, ToolRuntime};
use wintermute_gateway::types::{InvocationStatus, SchemaType, ToolDescriptor};

fn read_descriptor() -> ToolDescriptor {
    ToolDescriptor {
        id: "fs.read".to_string(),
        description: "read a file".to_string(),
        input_schema: SchemaType::Object {
            properties: [("path".to_string(), SchemaType::String)].into_iter().collect(),
            required: vec!["path".to_string()],
        },
        requires_approval: false,
    }
}

struct EchoFile;

#[async_trait]
impl ToolHandler for EchoFile {
    async fn call(&self, _input: serde_json::Value) -> Result<serde_json::Value, String> {
        Ok(serde_json::json!({"content": "hi\n", "size": 3}))
    }
}

struct SlowHandler {
    delay: Duration,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl ToolHandler for SlowHandler {
    async fn call(&self, _input: serde_json::Value) -> Result<serde_json::Value, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(serde_json::json!({"ok": true}))
    }
}

/// S1: a tool with no approval requirement runs straight through and
/// returns its result; the task-level wiring (chat.send -> planner ->
/// executor) is covered in the orchestrator tests, so here we exercise
/// the runtime directly as `tools.invoke` does.
#[tokio::test]
async fn simple_read_completes_without_approval() {
    let registry = ToolRegistry::new();
    let dir = tempdir().unwrap();
    let bus = EventBus::new();
    let approval_flow = ApprovalFlow::new(dir.path().join("approvals.json"), Duration::from_secs(900), bus.clone())
        .await
        .unwrap();
    let runtime = ToolRuntime::new(
        registry.clone(),
        approval_flow,
        bus,
        RuntimeLimits {
            default_timeout: Duration::from_secs(5),
            invocation_ttl: Duration::from_secs(600),
            max_concurrent: 4,
        },
        None::<(String, CommandPolicy)>,
    );
    registry.register(read_descriptor()).await;
    runtime.register_handler("fs.read", Arc::new(EchoFile)).await.unwrap();

    let invocation = runtime
        .invoke(
            "fs.read",
            Uuid::new_v4(),
            "agent",
            "user",
            serde_json::json!({"path": "hello.txt"}),
            None,
        )
        .await
        .unwrap();

    assert_eq!(invocation.status, InvocationStatus::Completed);
    let result = invocation.result.unwrap();
    assert!(result.ok);
    assert_eq!(result.data.unwrap()["content"], "hi\n");
}

/// S5: with `maxConcurrent=2`, three simultaneous invocations leave
/// exactly one rejected with `CONCURRENCY_LIMIT` and no invocation record,
/// while the other two complete.
#[tokio::test]
async fn concurrency_cap_rejects_the_excess_invocation() {
    let registry = ToolRegistry::new();
    registry
        .register(ToolDescriptor {
            id: "slow.op".to_string(),
            description: "a slow op".to_string(),
            input_schema: SchemaType::Object {
                properties: Default::default(),
                required: Vec::new(),
            },
            requires_approval: false,
        })
        .await;

    let dir = tempdir().unwrap();
    let bus = EventBus::new();
    let approval_flow = ApprovalFlow::new(dir.path().join("approvals.json"), Duration::from_secs(900), bus.clone())
        .await
        .unwrap();
    let runtime = ToolRuntime::new(
        registry,
        approval_flow,
        bus,
        RuntimeLimits {
            default_timeout: Duration::from_secs(5),
            invocation_ttl: Duration::from_secs(600),
            max_concurrent: 2,
        },
        None::<(String, CommandPolicy)>,
    );
    let calls = Arc::new(AtomicUsize::new(0));
    runtime
        .register_handler(
            "slow.op",
            Arc::new(SlowHandler {
                delay: Duration::from_millis(100),
                calls: calls.clone(),
            }),
        )
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..3 {
        let runtime = runtime.clone();
        handles.push(tokio::spawn(async move {
            runtime
                .invoke("slow.op", Uuid::new_v4(), "agent", "user", serde_json::json!({}), None)
                .await
        }));
    }

    let mut ok_count = 0;
    let mut rejected_count = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(invocation) => {
                assert_eq!(invocation.status, InvocationStatus::Completed);
                ok_count += 1;
            }
            Err(wintermute_gateway::error::RuntimeError::ConcurrencyLimit) => rejected_count += 1,
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    assert_eq!(ok_count, 2);
    assert_eq!(rejected_count, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}
