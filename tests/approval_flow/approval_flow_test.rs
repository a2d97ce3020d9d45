//! Approval Flow scenarios (spec §8 S3, S6) exercised through the Tool
//! Runtime rather than the bare `ApprovalFlow` (unit-tested in
//! `src/approval_flow.rs` already).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::tempdir;
use uuid::Uuid;

use wintermute_gateway::approval_flow::ApprovalFlow;
use wintermute_gateway::error::ApprovalError;
use wintermute_gateway::events::EventBus;
use wintermute_gateway::policy::CommandPolicy;
use wintermute_gateway::registry::ToolRegistry;
use wintermute_gateway::runtime::{RuntimeLimits, ToolHandler, ToolRuntime};
use wintermute_gateway::types::{ApprovalStatus, InvocationStatus, SchemaType, ToolDescriptor};

struct NeverRun;

#[async_trait]
impl ToolHandler for NeverRun {
    async fn call(&self, _input: serde_json::Value) -> Result<serde_json::Value, String> {
        panic!("handler must not run until approval is granted");
    }
}

fn gated_descriptor() -> ToolDescriptor {
    ToolDescriptor {
        id: "exec.command".to_string(),
        description: "run a shell command".to_string(),
        input_schema: SchemaType::Object {
            properties: Default::default(),
            required: Vec::new(),
        },
        requires_approval: true,
    }
}

/// S3: a denied approval fails the invocation with `APPROVAL_DENIED` and
/// never re-runs the handler.
#[tokio::test]
async fn rejected_approval_fails_the_invocation() {
    let registry = ToolRegistry::new();
    registry.register(gated_descriptor()).await;

    let dir = tempdir().unwrap();
    let bus = EventBus::new();
    let approval_flow = ApprovalFlow::new(dir.path().join("approvals.json"), Duration::from_secs(900), bus.clone())
        .await
        .unwrap();
    let runtime = ToolRuntime::new(
        registry,
        approval_flow.clone(),
        bus,
        RuntimeLimits {
            default_timeout: Duration::from_secs(5),
            invocation_ttl: Duration::from_secs(600),
            max_concurrent: 4,
        },
        None::<(String, CommandPolicy)>,
    );
    runtime.register_handler("exec.command", Arc::new(NeverRun)).await.unwrap();

    let session_id = Uuid::new_v4();
    let invocation = runtime
        .invoke(
            "exec.command",
            session_id,
            "agent",
            "user",
            serde_json::json!({"argv": ["rm", "-rf", "/"]}),
            None,
        )
        .await
        .unwrap();
    assert_eq!(invocation.status, InvocationStatus::AwaitingApproval);

    let pending = approval_flow.list_pending().await;
    let approval_id = pending.first().unwrap().approval_id;
    approval_flow
        .respond(approval_id, ApprovalStatus::Rejected, "operator".to_string())
        .await
        .unwrap();

    let invocation = runtime.approve_request(invocation.invocation_id, false).await.unwrap();
    assert_eq!(invocation.status, InvocationStatus::Failed);
    let error = invocation.result.unwrap().error.unwrap();
    assert_eq!(error.code, "APPROVAL_DENIED");
}

/// S6: an unanswered approval request expires on sweep, and a subsequent
/// `approval.respond` on it is rejected rather than re-running anything.
#[tokio::test]
async fn expired_approval_rejects_a_later_response() {
    let dir = tempdir().unwrap();
    let flow = ApprovalFlow::new(dir.path().join("approvals.json"), Duration::from_millis(50), EventBus::new())
        .await
        .unwrap();

    let rx = flow
        .submit(
            Uuid::new_v4(),
            "exec.command".to_string(),
            Uuid::new_v4(),
            serde_json::json!({}),
            "user-1".to_string(),
        )
        .await;

    tokio::time::sleep(Duration::from_millis(60)).await;
    let expired = flow.sweep_expired(chrono::Utc::now()).await;
    assert_eq!(expired.len(), 1);
    assert_eq!(rx.await.unwrap(), ApprovalStatus::Expired);

    let err = flow
        .respond(expired[0].approval_id, ApprovalStatus::Approved, "operator".to_string())
        .await
        .unwrap_err();
    assert!(matches!(err, ApprovalError::AlreadyResolved(_)));
}
