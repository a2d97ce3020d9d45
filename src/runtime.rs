//! Tool Runtime (spec §4.5): validates input, enforces the concurrency cap
//! and command policy, routes through approval when required, and executes
//! tool handlers under a timeout.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::{RwLock, Semaphore};
use uuid::Uuid;

use crate::approval_flow::ApprovalFlow;
use crate::error::{FailureCode, RegistryError, RuntimeError};
use crate::events::{EventBus, GatewayEvent};
use crate::policy::{CommandPolicy, PolicyDecision};
use crate::registry::ToolRegistry;
use crate::schema;
use crate::types::{Invocation, InvocationStatus, ToolResult};

/// A tool's executable behavior, registered alongside (but separately
/// from) its descriptor in the Tool Registry.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Run the tool against already-schema-validated `input`.
    ///
    /// Returning `Err` maps to `EXECUTION_ERROR`; handlers should not
    /// panic, but a panic is still caught and converted by the runtime.
    async fn call(&self, input: Value) -> Result<Value, String>;
}

/// How long a tool invocation (including any time spent awaiting approval)
/// may exist before the periodic sweep force-fails it (spec §4.5 TTL).
#[derive(Debug, Clone, Copy)]
pub struct RuntimeLimits {
    /// Applied when a tool descriptor doesn't specify its own.
    pub default_timeout: Duration,
    /// Maximum invocation age before the TTL sweep force-fails it.
    pub invocation_ttl: Duration,
    /// Global cap on invocations actively executing (not counting ones
    /// suspended awaiting approval).
    pub max_concurrent: u32,
}

struct CommandGate {
    tool_id: String,
    policy: CommandPolicy,
}

/// The Tool Runtime: owns live invocation state and drives execution.
#[derive(Clone)]
pub struct ToolRuntime {
    registry: ToolRegistry,
    handlers: Arc<RwLock<HashMap<String, Arc<dyn ToolHandler>>>>,
    invocations: Arc<RwLock<HashMap<Uuid, Invocation>>>,
    semaphore: Arc<Semaphore>,
    limits: RuntimeLimits,
    approval_flow: ApprovalFlow,
    command_gate: Option<Arc<CommandGate>>,
    bus: EventBus,
}

impl ToolRuntime {
    /// Build a runtime over `registry`, gated by `approval_flow` for any
    /// tool whose descriptor sets `requires_approval`, or whose id matches
    /// `command_policy`'s tool (the privileged command-execution tool).
    pub fn new(
        registry: ToolRegistry,
        approval_flow: ApprovalFlow,
        bus: EventBus,
        limits: RuntimeLimits,
        command_policy: Option<(String, CommandPolicy)>,
    ) -> Self {
        Self {
            registry,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            invocations: Arc::new(RwLock::new(HashMap::new())),
            semaphore: Arc::new(Semaphore::new(limits.max_concurrent as usize)),
            limits,
            approval_flow,
            command_gate: command_policy.map(|(tool_id, policy)| {
                Arc::new(CommandGate { tool_id, policy })
            }),
            bus,
        }
    }

    /// Register the executable behavior for a tool already present in the
    /// Tool Registry.
    pub async fn register_handler(
        &self,
        tool_id: &str,
        handler: Arc<dyn ToolHandler>,
    ) -> Result<(), RegistryError> {
        if !self.registry.contains(tool_id).await {
            return Err(RegistryError::NotFound(tool_id.to_string()));
        }
        self.handlers
            .write()
            .await
            .insert(tool_id.to_string(), handler);
        Ok(())
    }

    /// Invoke `tool_id` fresh (not a retry). See [`ToolRuntime::invoke_internal`].
    pub async fn invoke(
        &self,
        tool_id: &str,
        session_id: Uuid,
        agent_id: &str,
        user_id: &str,
        input: Value,
        cwd: Option<&Path>,
    ) -> Result<Invocation, RuntimeError> {
        self.invoke_internal(tool_id, session_id, agent_id, user_id, input, cwd, None)
            .await
    }

    /// Retry a previously failed invocation, forming a retry chain via
    /// `parentInvocationId` (spec §4.5).
    pub async fn retry(&self, parent_invocation_id: Uuid, cwd: Option<&Path>) -> Result<Invocation, RuntimeError> {
        let parent = self.get(parent_invocation_id).await?;
        self.invoke_internal(
            &parent.tool_id,
            parent.session_id,
            &parent.agent_id,
            &parent.user_id,
            parent.input.clone(),
            cwd,
            Some(parent),
        )
        .await
    }

    async fn invoke_internal(
        &self,
        tool_id: &str,
        session_id: Uuid,
        agent_id: &str,
        user_id: &str,
        input: Value,
        cwd: Option<&Path>,
        parent: Option<Invocation>,
    ) -> Result<Invocation, RuntimeError> {
        let descriptor = self
            .registry
            .get(tool_id)
            .await
            .map_err(|_| RuntimeError::ToolNotFound(tool_id.to_string()))?;

        // Admission check (spec §4.5 step 2) comes before input validation
        // (step 3): reject outright, before any invocation record exists or
        // the input is even checked, if the runtime is already at its
        // concurrency cap. This permit is only held while the invocation
        // actually executes; it is released again before suspending on
        // approval (running count is decremented while an invocation awaits
        // approval) and re-acquired by `approve_request` afterward.
        let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
            return Err(RuntimeError::ConcurrencyLimit);
        };

        schema::validate(&descriptor.input_schema, &input)?;

        let mut invocation = Invocation {
            invocation_id: Uuid::new_v4(),
            tool_id: tool_id.to_string(),
            session_id,
            input: input.clone(),
            status: InvocationStatus::Pending,
            start_time: Utc::now(),
            end_time: None,
            result: None,
            retry_count: parent.as_ref().map_or(0, |p| p.retry_count + 1),
            parent_invocation_id: parent.as_ref().map(|p| p.invocation_id),
            agent_id: agent_id.to_string(),
            user_id: user_id.to_string(),
        };
        self.store(invocation.clone()).await;

        let mut needs_approval = descriptor.requires_approval;
        if let Some(gate) = &self.command_gate {
            if gate.tool_id == tool_id {
                let command = input.get("command").and_then(Value::as_str).unwrap_or("");
                let gate_cwd = cwd.unwrap_or_else(|| Path::new("."));
                match gate.policy.check(command, gate_cwd) {
                    PolicyDecision::Allow => {}
                    PolicyDecision::RequireApproval => needs_approval = true,
                    PolicyDecision::Deny(reason) => {
                        self.bus.publish(GatewayEvent::PolicyDenied {
                            tool_id: tool_id.to_string(),
                            reason: reason.clone(),
                        });
                        return self
                            .fail(invocation, FailureCode::ApprovalDenied.as_str(), reason)
                            .await;
                    }
                }
            }
        }

        if needs_approval {
            // Release the slot while suspended: an invocation awaiting a
            // human decision isn't "running" and shouldn't block other work
            // from acquiring the cap.
            drop(permit);

            invocation.status = InvocationStatus::AwaitingApproval;
            self.store(invocation.clone()).await;
            self.publish_invocation(&invocation);

            self.approval_flow
                .submit(
                    invocation.invocation_id,
                    tool_id.to_string(),
                    session_id,
                    input.clone(),
                    user_id.to_string(),
                )
                .await;

            // Return to the caller immediately with `awaiting_approval`;
            // the invocation resumes later via `approve_request` once a
            // human decides, rather than blocking this call until then.
            return Ok(invocation);
        }

        self.run_handler(invocation, permit).await
    }

    /// Resume a suspended invocation with a human decision
    /// (`approveRequest`, spec §4.5). Fails with `InvalidState` if the
    /// invocation is not currently `awaiting_approval`.
    pub async fn approve_request(
        &self,
        invocation_id: Uuid,
        approved: bool,
    ) -> Result<Invocation, RuntimeError> {
        let invocation = self.get(invocation_id).await?;
        if invocation.status != InvocationStatus::AwaitingApproval {
            return Err(RuntimeError::InvalidState(invocation_id));
        }

        if !approved {
            return self
                .fail(
                    invocation,
                    FailureCode::ApprovalDenied.as_str(),
                    "approval request was rejected".to_string(),
                )
                .await;
        }

        let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
            return self
                .fail(
                    invocation,
                    FailureCode::ConcurrencyLimit.as_str(),
                    "global concurrency limit reached".to_string(),
                )
                .await;
        };

        // The input was already validated before suspension; re-run the
        // handler directly rather than revalidating.
        self.run_handler(invocation, permit).await
    }

    /// Run `invocation`'s registered handler under the configured timeout,
    /// recording and publishing the terminal outcome. `permit` is released
    /// as soon as the handler returns.
    async fn run_handler(
        &self,
        mut invocation: Invocation,
        permit: tokio::sync::OwnedSemaphorePermit,
    ) -> Result<Invocation, RuntimeError> {
        invocation.status = InvocationStatus::Running;
        self.store(invocation.clone()).await;
        self.publish_invocation(&invocation);

        let handler = self.handlers.read().await.get(&invocation.tool_id).cloned();
        let Some(handler) = handler else {
            drop(permit);
            let tool_id = invocation.tool_id.clone();
            return self
                .fail(
                    invocation,
                    FailureCode::ExecutionError.as_str(),
                    format!("no handler registered for tool `{tool_id}`"),
                )
                .await;
        };

        let started = std::time::Instant::now();
        let call_future = handler.call(invocation.input.clone());
        let outcome = tokio::time::timeout(self.limits.default_timeout, call_future).await;
        drop(permit);

        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let result = match outcome {
            Ok(Ok(data)) => ToolResult::success(data, duration_ms),
            Ok(Err(message)) => ToolResult::failure(FailureCode::ExecutionError.as_str(), message, duration_ms),
            Err(_) => ToolResult::failure(
                FailureCode::ExecutionError.as_str(),
                "tool invocation timed out".to_string(),
                duration_ms,
            ),
        };

        invocation.status = if result.ok {
            InvocationStatus::Completed
        } else {
            InvocationStatus::Failed
        };
        invocation.end_time = Some(Utc::now());
        invocation.result = Some(result);
        self.store(invocation.clone()).await;
        self.publish_invocation(&invocation);

        Ok(invocation)
    }

    async fn fail(
        &self,
        mut invocation: Invocation,
        code: &str,
        message: String,
    ) -> Result<Invocation, RuntimeError> {
        let duration_ms = u64::try_from((Utc::now() - invocation.start_time).num_milliseconds().max(0))
            .unwrap_or(0);
        invocation.status = InvocationStatus::Failed;
        invocation.end_time = Some(Utc::now());
        invocation.result = Some(ToolResult::failure(code, message, duration_ms));
        self.store(invocation.clone()).await;
        self.publish_invocation(&invocation);
        Ok(invocation)
    }

    async fn store(&self, invocation: Invocation) {
        self.invocations
            .write()
            .await
            .insert(invocation.invocation_id, invocation);
    }

    fn publish_invocation(&self, invocation: &Invocation) {
        self.bus.publish(GatewayEvent::InvocationTransitioned {
            invocation_id: invocation.invocation_id,
            status: invocation.status,
        });
    }

    /// Look up an invocation by id.
    pub async fn get(&self, invocation_id: Uuid) -> Result<Invocation, RuntimeError> {
        self.invocations
            .read()
            .await
            .get(&invocation_id)
            .cloned()
            .ok_or(RuntimeError::InvocationNotFound(invocation_id))
    }

    /// Mean retry depth per tool id, walking each invocation's
    /// `parent_invocation_id` chain back to its root (SPEC_FULL §B.1).
    /// An invocation with no parent contributes depth 0; one retried twice
    /// contributes depth 2. Tools with no recorded invocations are absent
    /// from the result rather than reported as zero.
    pub async fn retry_stats(&self) -> std::collections::BTreeMap<String, f64> {
        let invocations = self.invocations.read().await;
        let by_id: HashMap<Uuid, &Invocation> =
            invocations.values().map(|inv| (inv.invocation_id, inv)).collect();

        let mut totals: HashMap<String, (u64, u64)> = HashMap::new();
        for inv in invocations.values() {
            let mut depth: u64 = 0;
            let mut cursor = inv.parent_invocation_id;
            while let Some(parent_id) = cursor {
                depth = depth.saturating_add(1);
                cursor = by_id.get(&parent_id).and_then(|parent| parent.parent_invocation_id);
            }
            let entry = totals.entry(inv.tool_id.clone()).or_insert((0, 0));
            entry.0 = entry.0.saturating_add(depth);
            entry.1 = entry.1.saturating_add(1);
        }

        #[allow(clippy::cast_precision_loss)]
        totals
            .into_iter()
            .map(|(tool_id, (sum, count))| (tool_id, sum as f64 / count as f64))
            .collect()
    }

    /// Force-fail any invocation stuck in a non-terminal state past the
    /// configured TTL (spec §4.5, SPEC_FULL §A.3 cleanup interval).
    pub async fn sweep_expired(&self) -> Vec<Uuid> {
        let ttl = chrono::Duration::from_std(self.limits.invocation_ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(600));
        let now = Utc::now();
        let stale: Vec<Uuid> = {
            let invocations = self.invocations.read().await;
            invocations
                .values()
                .filter(|inv| {
                    matches!(
                        inv.status,
                        InvocationStatus::Pending
                            | InvocationStatus::Running
                            | InvocationStatus::AwaitingApproval
                    ) && now - inv.start_time > ttl
                })
                .map(|inv| inv.invocation_id)
                .collect()
        };

        for invocation_id in &stale {
            if let Ok(mut invocation) = self.get(*invocation_id).await {
                invocation.status = InvocationStatus::Failed;
                invocation.end_time = Some(now);
                invocation.result = Some(ToolResult::failure(
                    FailureCode::ExecutionError.as_str(),
                    "invocation exceeded its time-to-live".to_string(),
                    0,
                ));
                self.store(invocation.clone()).await;
                self.publish_invocation(&invocation);
            }
        }
        stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval_flow::ApprovalFlow;
    use crate::types::{SchemaType, ToolDescriptor};
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    struct Echo;

    #[async_trait]
    impl ToolHandler for Echo {
        async fn call(&self, input: Value) -> Result<Value, String> {
            Ok(input)
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl ToolHandler for AlwaysFails {
        async fn call(&self, _input: Value) -> Result<Value, String> {
            Err("boom".to_string())
        }
    }

    struct Slow;

    #[async_trait]
    impl ToolHandler for Slow {
        async fn call(&self, _input: Value) -> Result<Value, String> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(Value::Null)
        }
    }

    async fn runtime_with(max_concurrent: u32, timeout: Duration) -> ToolRuntime {
        let dir = tempdir().unwrap();
        let registry = ToolRegistry::new();
        registry
            .register(ToolDescriptor {
                id: "echo".to_string(),
                description: "echoes input".to_string(),
                input_schema: SchemaType::Object {
                    properties: BTreeMap::new(),
                    required: Vec::new(),
                },
                requires_approval: false,
            })
            .await;
        let approval_flow = ApprovalFlow::new(
            dir.path().join("approvals.json"),
            Duration::from_secs(900),
            EventBus::new(),
        )
        .await
        .unwrap();
        ToolRuntime::new(
            registry,
            approval_flow,
            EventBus::new(),
            RuntimeLimits {
                default_timeout: timeout,
                invocation_ttl: Duration::from_secs(600),
                max_concurrent,
            },
            None,
        )
    }

    #[tokio::test]
    async fn unknown_tool_is_reported() {
        let runtime = runtime_with(4, Duration::from_secs(5)).await;
        let err = runtime
            .invoke("nope", Uuid::new_v4(), "agent", "user", Value::Null, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::ToolNotFound(_)));
    }

    #[tokio::test]
    async fn successful_invocation_completes() {
        let runtime = runtime_with(4, Duration::from_secs(5)).await;
        runtime.register_handler("echo", Arc::new(Echo)).await.unwrap();
        let invocation = runtime
            .invoke("echo", Uuid::new_v4(), "agent", "user", serde_json::json!({}), None)
            .await
            .unwrap();
        assert_eq!(invocation.status, InvocationStatus::Completed);
        assert!(invocation.result.unwrap().ok);
    }

    #[tokio::test]
    async fn handler_error_becomes_execution_error() {
        let runtime = runtime_with(4, Duration::from_secs(5)).await;
        runtime
            .register_handler("echo", Arc::new(AlwaysFails))
            .await
            .unwrap();
        let invocation = runtime
            .invoke("echo", Uuid::new_v4(), "agent", "user", serde_json::json!({}), None)
            .await
            .unwrap();
        assert_eq!(invocation.status, InvocationStatus::Failed);
        let result = invocation.result.unwrap();
        assert_eq!(result.error.unwrap().code, "EXECUTION_ERROR");
    }

    #[tokio::test]
    async fn timeout_fails_with_execution_error() {
        let runtime = runtime_with(4, Duration::from_millis(20)).await;
        runtime.register_handler("echo", Arc::new(Slow)).await.unwrap();
        let invocation = runtime
            .invoke("echo", Uuid::new_v4(), "agent", "user", serde_json::json!({}), None)
            .await
            .unwrap();
        assert_eq!(invocation.status, InvocationStatus::Failed);
    }

    #[tokio::test]
    async fn retry_chain_links_parent_invocation() {
        let runtime = runtime_with(4, Duration::from_secs(5)).await;
        runtime
            .register_handler("echo", Arc::new(AlwaysFails))
            .await
            .unwrap();
        let first = runtime
            .invoke("echo", Uuid::new_v4(), "agent", "user", serde_json::json!({}), None)
            .await
            .unwrap();
        let retried = runtime.retry(first.invocation_id, None).await.unwrap();
        assert_eq!(retried.parent_invocation_id, Some(first.invocation_id));
        assert_eq!(retried.retry_count, 1);
    }

    #[tokio::test]
    async fn retry_stats_averages_depth_per_tool() {
        let runtime = runtime_with(4, Duration::from_secs(5)).await;
        runtime
            .register_handler("echo", Arc::new(AlwaysFails))
            .await
            .unwrap();
        let first = runtime
            .invoke("echo", Uuid::new_v4(), "agent", "user", serde_json::json!({}), None)
            .await
            .unwrap();
        let retried = runtime.retry(first.invocation_id, None).await.unwrap();
        let _ = runtime.retry(retried.invocation_id, None).await.unwrap();

        let stats = runtime.retry_stats().await;
        // Chain depths are 0, 1, 2 across the three invocations for "echo".
        assert_eq!(stats.get("echo"), Some(&1.0));
    }

    #[tokio::test]
    async fn concurrency_limit_rejects_without_creating_an_invocation_record() {
        let runtime = runtime_with(1, Duration::from_secs(5)).await;
        runtime.register_handler("echo", Arc::new(Slow)).await.unwrap();

        let runtime_clone = runtime.clone();
        let occupying = tokio::spawn(async move {
            runtime_clone
                .invoke("echo", Uuid::new_v4(), "agent", "user", serde_json::json!({}), None)
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let before = runtime.invocations.read().await.len();
        let err = runtime
            .invoke("echo", Uuid::new_v4(), "agent", "user", serde_json::json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::ConcurrencyLimit));
        let after = runtime.invocations.read().await.len();
        assert_eq!(before, after, "rejected call must not create an invocation record");

        occupying.abort();
    }
}
