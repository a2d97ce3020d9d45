//! Gateway Facade scenarios (spec §8 S2, S3) through the privileged
//! command-execution tool and its command policy gate.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::tempdir;
use uuid::Uuid;

use wintermute_gateway::approval_flow::ApprovalFlow;
use wintermute_gateway::auth::{hash_token, AuthManager};
use wintermute_gateway::events::EventBus;
use wintermute_gateway::executor::Executor;
use wintermute_gateway::gateway::{ConnectParams, Gateway, ToolsInvokeParams};
use wintermute_gateway::orchestrator::{TaskHandle, TaskOrchestrator};
use wintermute_gateway::planner::Planner;
use wintermute_gateway::policy::{Allowlist, CommandPolicy, Denylist, DEFAULT_DENY_PATTERNS};
use wintermute_gateway::registry::ToolRegistry;
use wintermute_gateway::replanner::Replanner;
use wintermute_gateway::runtime::{RuntimeLimits, ToolHandler, ToolRuntime};
use wintermute_gateway::session::SessionStore;
use wintermute_gateway::types::{SchemaType, ToolDescriptor};

const COMMAND_TOOL_ID: &str = "system.run";

struct FakeShell;

#[async_trait]
impl ToolHandler for FakeShell {
    async fn call(&self, input: serde_json::Value) -> Result<serde_json::Value, String> {
        Ok(serde_json::json!({"stdout": format!("ran: {}", input["command"])}))
    }
}

fn command_policy() -> CommandPolicy {
    CommandPolicy {
        allowlist: Allowlist {
            commands: vec!["git".to_string()],
            cwd_prefix: vec![".".to_string()],
        },
        denylist: Denylist {
            patterns: DEFAULT_DENY_PATTERNS.iter().map(|s| s.to_string()).collect(),
        },
    }
}

async fn gateway() -> Gateway {
    let dir = tempdir().unwrap();
    let registry = ToolRegistry::new();
    registry
        .register(ToolDescriptor {
            id: COMMAND_TOOL_ID.to_string(),
            description: "run a shell command".to_string(),
            input_schema: SchemaType::Object {
                properties: [("command".to_string(), SchemaType::String)].into_iter().collect(),
                required: vec!["command".to_string()],
            },
            requires_approval: false,
        })
        .await;

    let bus = EventBus::new();
    let approval_flow = ApprovalFlow::new(dir.path().join("approvals.json"), Duration::from_secs(900), bus.clone())
        .await
        .unwrap();
    let runtime = ToolRuntime::new(
        registry.clone(),
        approval_flow.clone(),
        bus.clone(),
        RuntimeLimits {
            default_timeout: Duration::from_secs(5),
            invocation_ttl: Duration::from_secs(600),
            max_concurrent: 4,
        },
        Some((COMMAND_TOOL_ID.to_string(), command_policy())),
    );
    runtime.register_handler(COMMAND_TOOL_ID, Arc::new(FakeShell)).await.unwrap();

    let sessions = SessionStore::new(dir.path().to_path_buf());
    let planner = Planner::new(registry.clone(), None);
    let handle = TaskHandle::new(bus.clone());
    let executor = Executor::new(
        runtime.clone(),
        sessions.clone(),
        Replanner::default(),
        handle.clone(),
        bus.clone(),
    );
    let orchestrator = TaskOrchestrator::new(handle, sessions.clone(), planner, executor, bus.clone());
    let auth = AuthManager::new(vec![hash_token("secret")], false, bus);

    Gateway::new(registry, runtime, approval_flow, sessions, orchestrator, auth)
}

/// S2: an allowlisted command (`git ...`) runs straight through without
/// any approval round-trip.
#[tokio::test]
async fn allowlisted_command_runs_without_approval() {
    let gateway = gateway().await;
    gateway
        .connect(ConnectParams {
            client_type: "cli".to_string(),
            version: "1.0".to_string(),
            token: "secret".to_string(),
        })
        .unwrap();

    let result = gateway
        .tools_invoke(ToolsInvokeParams {
            tool_id: COMMAND_TOOL_ID.to_string(),
            session_id: Uuid::new_v4(),
            agent_id: "agent".to_string(),
            user_id: "user".to_string(),
            input: serde_json::json!({"command": "git status"}),
        })
        .await
        .unwrap();

    assert!(!result.awaiting_approval);
    assert!(result.result.unwrap().ok);
}

/// S3: a denylisted command (`rm -rf /`) is rejected outright with
/// `APPROVAL_DENIED`, never reaching the handler.
#[tokio::test]
async fn denylisted_command_is_rejected_outright() {
    let gateway = gateway().await;
    let result = gateway
        .tools_invoke(ToolsInvokeParams {
            tool_id: COMMAND_TOOL_ID.to_string(),
            session_id: Uuid::new_v4(),
            agent_id: "agent".to_string(),
            user_id: "user".to_string(),
            input: serde_json::json!({"command": "rm -rf /"}),
        })
        .await
        .unwrap();

    assert!(!result.awaiting_approval);
    let error = result.result.unwrap().error.unwrap();
    assert_eq!(error.code, "APPROVAL_DENIED");
}

#[tokio::test]
async fn status_reflects_registered_tools_and_retry_stats() {
    let gateway = gateway().await;
    let before = gateway.status().await;
    assert_eq!(before.registered_tools, 1);
    assert!(before.retry_stats.is_empty());

    gateway
        .tools_invoke(ToolsInvokeParams {
            tool_id: COMMAND_TOOL_ID.to_string(),
            session_id: Uuid::new_v4(),
            agent_id: "agent".to_string(),
            user_id: "user".to_string(),
            input: serde_json::json!({"command": "git status"}),
        })
        .await
        .unwrap();

    let after = gateway.status().await;
    assert_eq!(after.retry_stats.get(COMMAND_TOOL_ID), Some(&0.0));
}
