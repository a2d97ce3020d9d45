//! Gateway Facade (spec §4.9): the single entry point every JSON-RPC method
//! is routed through, wiring requests to the Orchestrator, Tool Registry,
//! Tool Runtime, Approval Flow, Session Store, and Auth Manager.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::approval_flow::ApprovalFlow;
use crate::auth::AuthManager;
use crate::error::GatewayError;
use crate::orchestrator::TaskOrchestrator;
use crate::registry::ToolRegistry;
use crate::runtime::ToolRuntime;
use crate::session::SessionStore;
use crate::types::{
    ApprovalStatus, ChannelSessionKey, PairingCode, SessionMessage, Task, ToolDescriptor, ToolResult,
};

/// Params for `connect` (spec §4.1, §4.9).
#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    /// Declared client kind, e.g. `"cli"`, `"telegram"`.
    pub client_type: String,
    /// Client-reported protocol/app version.
    pub version: String,
    /// Bearer token presented for authentication.
    pub token: String,
}

/// Result of a successful `connect` (spec §4.9).
#[derive(Debug, Serialize)]
pub struct ConnectResult {
    /// Whether the token was accepted.
    pub authenticated: bool,
}

/// Params for `chat.send` (spec §4.9).
#[derive(Debug, Deserialize)]
pub struct ChatSendParams {
    /// Surface adapter name.
    pub surface: String,
    /// Logical room/channel id.
    pub channel: String,
    /// User id on that surface.
    pub user: String,
    /// The user's chat message.
    pub text: String,
    /// Other surfaces that should also receive the final `chat.response`.
    #[serde(default)]
    pub observers: Vec<String>,
}

/// Result of `chat.send` (spec §4.9).
#[derive(Debug, Serialize)]
pub struct ChatSendResult {
    /// The newly created task's id.
    pub task_id: Uuid,
    /// Lifecycle state immediately after creation (always `pending`).
    pub state: crate::types::TaskState,
}

/// Params for `tools.invoke` (spec §4.9: bypasses the planner).
#[derive(Debug, Deserialize)]
pub struct ToolsInvokeParams {
    /// Tool id to invoke.
    pub tool_id: String,
    /// Session this invocation is attributed to.
    pub session_id: Uuid,
    /// Agent id issuing the invocation.
    pub agent_id: String,
    /// User id on whose behalf the invocation runs.
    pub user_id: String,
    /// Already-shaped input for the tool's schema.
    pub input: Value,
}

/// Result of `tools.invoke`: either a terminal result or a suspension.
#[derive(Debug, Serialize)]
pub struct ToolsInvokeResult {
    /// The invocation's id.
    pub invocation_id: Uuid,
    /// Populated once the invocation reaches a terminal status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ToolResult>,
    /// True while the invocation is suspended awaiting human approval.
    pub awaiting_approval: bool,
}

/// Params for `approval.respond` (spec §4.9).
#[derive(Debug, Deserialize)]
pub struct ApprovalRespondParams {
    /// The approval request being resolved.
    pub approval_id: Uuid,
    /// Human decision.
    pub approved: bool,
    /// Id of the human who responded.
    pub responder_id: String,
}

/// Params for `sessions.send` (spec §4.9: cross-agent context handoff).
#[derive(Debug, Deserialize)]
pub struct SessionsSendParams {
    /// Session to append to.
    pub session_id: Uuid,
    /// Message to append.
    pub message: SessionMessage,
}

/// Response to `status` (spec §4.9).
#[derive(Debug, Serialize)]
pub struct StatusResult {
    /// Number of tools currently registered.
    pub registered_tools: usize,
    /// Pending approval requests across the whole gateway.
    pub pending_approvals: usize,
    /// Mean retry depth per tool id, across every invocation the runtime
    /// still holds in memory (SPEC_FULL §B.1).
    pub retry_stats: std::collections::BTreeMap<String, f64>,
}

/// Everything the Gateway Facade needs to route a request, wired once at
/// startup (see `main.rs`'s `serve` subcommand).
#[derive(Clone)]
pub struct Gateway {
    registry: ToolRegistry,
    runtime: ToolRuntime,
    approval_flow: ApprovalFlow,
    sessions: SessionStore,
    orchestrator: TaskOrchestrator,
    auth: AuthManager,
}

impl Gateway {
    /// Build a facade over already-wired components.
    pub fn new(
        registry: ToolRegistry,
        runtime: ToolRuntime,
        approval_flow: ApprovalFlow,
        sessions: SessionStore,
        orchestrator: TaskOrchestrator,
        auth: AuthManager,
    ) -> Self {
        Self {
            registry,
            runtime,
            approval_flow,
            sessions,
            orchestrator,
            auth,
        }
    }

    /// `connect`: validate the bearer token presented on the first message
    /// of a connection (spec §4.1: required first message).
    pub fn connect(&self, params: ConnectParams) -> Result<ConnectResult, GatewayError> {
        self.auth.verify_token(&params.token)?;
        tracing::info!(client_type = %params.client_type, version = %params.version, "client connected");
        Ok(ConnectResult { authenticated: true })
    }

    /// `chat.send`: enqueue a new task for the originating channel-session key.
    pub async fn chat_send(&self, params: ChatSendParams) -> ChatSendResult {
        let key = ChannelSessionKey::new(params.surface, params.channel, params.user);
        let task = self.orchestrator.create_task(key, params.text, params.observers).await;
        ChatSendResult {
            task_id: task.task_id,
            state: task.state,
        }
    }

    /// `status`/orchestrator-adjacent helper: look up a task's current state.
    pub async fn get_task(&self, task_id: Uuid) -> Result<Task, GatewayError> {
        Ok(self.orchestrator.get(task_id).await?)
    }

    /// `tools.list`.
    pub async fn tools_list(&self) -> Vec<ToolDescriptor> {
        self.registry.list().await
    }

    /// `tools.invoke`: direct runtime invocation, bypassing the planner.
    pub async fn tools_invoke(&self, params: ToolsInvokeParams) -> Result<ToolsInvokeResult, GatewayError> {
        let invocation = self
            .runtime
            .invoke(
                &params.tool_id,
                params.session_id,
                &params.agent_id,
                &params.user_id,
                params.input,
                None,
            )
            .await?;

        Ok(ToolsInvokeResult {
            invocation_id: invocation.invocation_id,
            awaiting_approval: matches!(
                invocation.status,
                crate::types::InvocationStatus::AwaitingApproval
            ),
            result: invocation.result,
        })
    }

    /// `approval.respond`: resolve a pending approval request, then drive
    /// the invocation it gates to completion via `runtime.approveRequest`
    /// (spec §4.9: the Facade calls into the runtime once the Approval Flow
    /// resolves or receives a response).
    pub async fn approval_respond(&self, params: ApprovalRespondParams) -> Result<(), GatewayError> {
        let decision = if params.approved {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Rejected
        };
        let resolved = self
            .approval_flow
            .respond(params.approval_id, decision, params.responder_id)
            .await?;
        self.runtime
            .approve_request(resolved.invocation_id, params.approved)
            .await?;
        Ok(())
    }

    /// `sessions.send`: append a message to an existing session's log.
    pub async fn sessions_send(&self, params: SessionsSendParams) -> Result<(), GatewayError> {
        Ok(self.sessions.append(params.session_id, params.message).await?)
    }

    /// `status`: runtime/orchestrator summary for operator tooling.
    pub async fn status(&self) -> StatusResult {
        StatusResult {
            registered_tools: self.registry.list().await.len(),
            pending_approvals: self.approval_flow.list_pending().await.len(),
            retry_stats: self.runtime.retry_stats().await,
        }
    }

    /// `auth.pair`: issue a one-time pairing code binding a new surface
    /// identity to `user_id` (spec §4.10). Not part of the original method
    /// table; exposed here so the pairing workflow is reachable over the
    /// same transport as every other facade call instead of only from the
    /// `gateway pair` CLI subcommand.
    pub async fn pair(&self, user_id: &str, ttl: std::time::Duration) -> PairingCode {
        self.auth.issue_pairing_code(user_id, ttl).await
    }

    /// `auth.approve_pairing`: consume a pairing code, returning the user
    /// id it was issued for.
    pub async fn approve_pairing(&self, code: &str) -> Result<String, GatewayError> {
        Ok(self.auth.approve_pairing_code(code).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval_flow::ApprovalFlow;
    use crate::auth::hash_token;
    use crate::events::EventBus;
    use crate::executor::Executor;
    use crate::orchestrator::TaskHandle;
    use crate::planner::Planner;
    use crate::policy::CommandPolicy;
    use crate::replanner::Replanner;
    use crate::runtime::RuntimeLimits;
    use std::time::Duration;
    use tempfile::tempdir;

    async fn gateway() -> Gateway {
        let dir = tempdir().unwrap();
        let registry = ToolRegistry::new();
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
            None::<(String, CommandPolicy)>,
        );
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

    #[tokio::test]
    async fn connect_rejects_unknown_token() {
        let gateway = gateway().await;
        let err = gateway
            .connect(ConnectParams {
                client_type: "cli".to_string(),
                version: "1.0".to_string(),
                token: "wrong".to_string(),
            })
            .unwrap_err();
        assert!(matches!(err, GatewayError::Auth(_)));
    }

    #[tokio::test]
    async fn connect_accepts_known_token() {
        let gateway = gateway().await;
        let result = gateway
            .connect(ConnectParams {
                client_type: "cli".to_string(),
                version: "1.0".to_string(),
                token: "secret".to_string(),
            })
            .unwrap();
        assert!(result.authenticated);
    }

    #[tokio::test]
    async fn chat_send_creates_a_pending_task() {
        let gateway = gateway().await;
        let result = gateway
            .chat_send(ChatSendParams {
                surface: "cli".to_string(),
                channel: "room".to_string(),
                user: "user".to_string(),
                text: "say hello".to_string(),
                observers: Vec::new(),
            })
            .await;
        assert_eq!(result.state, crate::types::TaskState::Pending);
        assert!(gateway.get_task(result.task_id).await.is_ok());
    }

    #[tokio::test]
    async fn status_reports_zero_tools_and_approvals_when_empty() {
        let gateway = gateway().await;
        let status = gateway.status().await;
        assert_eq!(status.registered_tools, 0);
        assert_eq!(status.pending_approvals, 0);
    }

    #[tokio::test]
    async fn tools_invoke_reports_tool_not_found() {
        let gateway = gateway().await;
        let err = gateway
            .tools_invoke(ToolsInvokeParams {
                tool_id: "nope".to_string(),
                session_id: Uuid::new_v4(),
                agent_id: "agent".to_string(),
                user_id: "user".to_string(),
                input: serde_json::json!({}),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Runtime(_)));
    }
}
