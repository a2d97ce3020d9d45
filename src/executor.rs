//! Executor (spec §4.7): runs a [`Plan`]'s steps in dependency order,
//! invoking the Tool Runtime for steps that name a tool, recording every
//! thought/tool/result to the session log, and handing failures to the
//! [`Replanner`] for bounded recovery.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;

use chrono::Utc;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use crate::error::ExecutorError;
use crate::events::{EventBus, GatewayEvent};
use crate::orchestrator::TaskHandle;
use crate::replanner::{RecoveryAction, Replanner};
use crate::runtime::ToolRuntime;
use crate::session::SessionStore;
use crate::types::{Invocation, InvocationStatus, MessageKind, Plan, PlanStep, SessionMessage};

/// Runs plans against a [`ToolRuntime`], recording to a [`SessionStore`].
#[derive(Clone)]
pub struct Executor {
    runtime: ToolRuntime,
    sessions: SessionStore,
    replanner: Replanner,
    task_handle: TaskHandle,
    bus: EventBus,
}

impl Executor {
    /// Build an executor over an already-wired runtime and session store,
    /// sharing `task_handle` with the [`crate::orchestrator::TaskOrchestrator`]
    /// so a task can be paused while one of its invocations awaits approval.
    pub fn new(
        runtime: ToolRuntime,
        sessions: SessionStore,
        replanner: Replanner,
        task_handle: TaskHandle,
        bus: EventBus,
    ) -> Self {
        Self {
            runtime,
            sessions,
            replanner,
            task_handle,
            bus,
        }
    }

    /// Execute every step of `plan` in dependency order, returning the text
    /// to send back to the user once every step completes. `task_id`, when
    /// given, is paused while a step's invocation awaits human approval and
    /// resumed once it resolves.
    pub async fn execute(
        &self,
        session_id: Uuid,
        agent_id: &str,
        user_id: &str,
        task_id: Option<Uuid>,
        plan: Plan,
        cwd: Option<&Path>,
    ) -> Result<String, ExecutorError> {
        let order = topological_order(&plan)?;
        let steps: HashMap<String, PlanStep> =
            plan.steps.into_iter().map(|s| (s.step_id.clone(), s)).collect();

        let mut response_lines = Vec::new();
        for step_id in order {
            let step = steps.get(&step_id).expect("topological_order only yields known steps");
            self.record_thought(session_id, step).await;

            let Some(tool_id) = step.tool_id.clone() else {
                response_lines.push(step.description.clone());
                continue;
            };

            let input = step.input.clone().unwrap_or(serde_json::Value::Null);
            let output = self
                .run_with_recovery(session_id, agent_id, user_id, task_id, tool_id, input, cwd)
                .await?;
            response_lines.push(output);
        }

        Ok(response_lines.join("\n"))
    }

    async fn run_with_recovery(
        &self,
        session_id: Uuid,
        agent_id: &str,
        user_id: &str,
        task_id: Option<Uuid>,
        tool_id: String,
        input: serde_json::Value,
        cwd: Option<&Path>,
    ) -> Result<String, ExecutorError> {
        let mut current_tool_id = tool_id;
        let mut invocation = self
            .runtime
            .invoke(&current_tool_id, session_id, agent_id, user_id, input.clone(), cwd)
            .await?;
        self.record_tool_call(session_id, &current_tool_id, &input).await;
        invocation = self.await_resolution(task_id, invocation).await?;

        loop {
            let result = invocation.result.clone().expect("a terminal invocation always carries a result");
            self.record_result(session_id, &result).await;

            if result.ok {
                return Ok(result
                    .data
                    .map(|d| d.to_string())
                    .unwrap_or_else(|| "ok".to_string()));
            }

            let error = result.error.expect("a failed result always carries an error");
            match self.replanner.recover(&current_tool_id, &error, invocation.retry_count) {
                RecoveryAction::Retry => {
                    invocation = self.runtime.retry(invocation.invocation_id, cwd).await?;
                    invocation = self.await_resolution(task_id, invocation).await?;
                }
                RecoveryAction::Alternative(alternative) => {
                    current_tool_id = alternative;
                    invocation = self
                        .runtime
                        .invoke(&current_tool_id, session_id, agent_id, user_id, input.clone(), cwd)
                        .await?;
                    self.record_tool_call(session_id, &current_tool_id, &input).await;
                    invocation = self.await_resolution(task_id, invocation).await?;
                }
                RecoveryAction::Approval => {
                    // Route the step back through the runtime so a tool
                    // gated on human approval gets a fresh approval
                    // request rather than being abandoned after a denial.
                    invocation = self.runtime.retry(invocation.invocation_id, cwd).await?;
                    invocation = self.await_resolution(task_id, invocation).await?;
                }
                RecoveryAction::Abort => {
                    return Err(ExecutorError::Aborted(current_tool_id));
                }
            }
        }
    }

    /// If `invocation` is suspended awaiting approval, pause `task_id` (when
    /// given), wait for the approval flow to drive it to a terminal decision
    /// via [`ToolRuntime::approve_request`], resume the task, and return the
    /// resolved invocation. Otherwise return `invocation` unchanged.
    async fn await_resolution(
        &self,
        task_id: Option<Uuid>,
        invocation: Invocation,
    ) -> Result<Invocation, ExecutorError> {
        if invocation.status != InvocationStatus::AwaitingApproval {
            return Ok(invocation);
        }

        if let Some(task_id) = task_id {
            let _ = self.task_handle.pause(task_id).await;
        }

        let invocation_id = invocation.invocation_id;
        let mut receiver = self.bus.subscribe();
        let resolved = loop {
            match receiver.recv().await {
                Ok(GatewayEvent::InvocationTransitioned { invocation_id: id, status })
                    if id == invocation_id && status.is_terminal() =>
                {
                    break self.runtime.get(invocation_id).await?;
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(_)) => {
                    let current = self.runtime.get(invocation_id).await?;
                    if current.status.is_terminal() {
                        break current;
                    }
                }
                Err(RecvError::Closed) => break self.runtime.get(invocation_id).await?,
            }
        };

        if let Some(task_id) = task_id {
            let _ = self.task_handle.resume(task_id).await;
        }
        Ok(resolved)
    }

    async fn record_thought(&self, session_id: Uuid, step: &PlanStep) {
        let _ = self
            .sessions
            .append(
                session_id,
                SessionMessage {
                    kind: MessageKind::Thought,
                    content: serde_json::json!(step.description),
                    timestamp: Utc::now(),
                    metadata: Some(serde_json::json!({"step_id": step.step_id})),
                },
            )
            .await;
    }

    async fn record_tool_call(&self, session_id: Uuid, tool_id: &str, input: &serde_json::Value) {
        let _ = self
            .sessions
            .append(
                session_id,
                SessionMessage {
                    kind: MessageKind::Tool,
                    content: serde_json::json!({"tool_id": tool_id, "input": input}),
                    timestamp: Utc::now(),
                    metadata: None,
                },
            )
            .await;
    }

    async fn record_result(&self, session_id: Uuid, result: &crate::types::ToolResult) {
        let _ = self
            .sessions
            .append(
                session_id,
                SessionMessage {
                    kind: if result.ok { MessageKind::Result } else { MessageKind::Error },
                    content: serde_json::to_value(result).unwrap_or(serde_json::Value::Null),
                    timestamp: Utc::now(),
                    metadata: None,
                },
            )
            .await;
    }
}

/// Kahn's algorithm over `plan.steps[*].depends_on`, erroring on an unknown
/// dependency or a cycle (spec §4.7).
fn topological_order(plan: &Plan) -> Result<Vec<String>, ExecutorError> {
    let ids: HashSet<&str> = plan.steps.iter().map(|s| s.step_id.as_str()).collect();
    for step in &plan.steps {
        for dep in &step.depends_on {
            if !ids.contains(dep.as_str()) {
                return Err(ExecutorError::UnknownDependency(step.step_id.clone(), dep.clone()));
            }
        }
    }

    let mut in_degree: HashMap<&str, usize> =
        plan.steps.iter().map(|s| (s.step_id.as_str(), 0)).collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for step in &plan.steps {
        for dep in &step.depends_on {
            in_degree
                .entry(step.step_id.as_str())
                .and_modify(|degree| *degree = degree.saturating_add(1));
            dependents.entry(dep.as_str()).or_default().push(step.step_id.as_str());
        }
    }

    let mut queue: VecDeque<&str> = plan
        .steps
        .iter()
        .map(|s| s.step_id.as_str())
        .filter(|id| in_degree[id] == 0)
        .collect();

    let mut order = Vec::with_capacity(plan.steps.len());
    while let Some(id) = queue.pop_front() {
        order.push(id.to_string());
        if let Some(next) = dependents.get(id) {
            for &dependent in next {
                let Some(degree) = in_degree.get_mut(dependent) else {
                    continue;
                };
                *degree = degree.saturating_sub(1);
                if *degree == 0 {
                    queue.push_back(dependent);
                }
            }
        }
    }

    if order.len() != plan.steps.len() {
        return Err(ExecutorError::DependencyCycle);
    }
    Ok(order)
}
