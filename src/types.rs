//! Core data model shared across the gateway (spec §3).
//!
//! These types are intentionally thin: components own their own state
//! (the orchestrator owns `Task`, the session store owns `Session`, the
//! runtime owns `Invocation`, the approval flow owns `ApprovalRequest`)
//! and only ever reference each other's state by id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies the surface, logical room, and user a task belongs to.
///
/// The orchestrator serializes execution per key: at most one task with
/// a given key is ever RUNNING or PAUSED at once (spec §3 invariant).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelSessionKey {
    /// Surface adapter name (e.g. `"telegram"`, `"cli"`).
    pub surface: String,
    /// Logical room/channel id on that surface.
    pub channel: String,
    /// User id on that surface.
    pub user: String,
}

impl ChannelSessionKey {
    /// Build a key from its three parts.
    pub fn new(surface: impl Into<String>, channel: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            surface: surface.into(),
            channel: channel.into(),
            user: user.into(),
        }
    }
}

impl std::fmt::Display for ChannelSessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.surface, self.channel, self.user)
    }
}

/// Lifecycle state of a `Task` (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Created, queued behind any running task on the same key.
    Pending,
    /// Dequeued and actively being planned/executed.
    Running,
    /// Suspended awaiting a human approval decision.
    Paused,
    /// Completed successfully.
    Done,
    /// Completed with an unrecoverable error.
    Failed,
    /// Cancelled by explicit user action.
    Aborted,
}

impl TaskState {
    /// Terminal states never transition again (spec §8 invariant 8).
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Done | TaskState::Failed | TaskState::Aborted)
    }
}

/// A short error descriptor attached to a failed task or tool result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    /// One of the taxonomy codes from spec §7 (e.g. `"EXECUTION_ERROR"`).
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

/// One unit of orchestrated work for a single user chat message (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task id.
    pub task_id: Uuid,
    /// The channel-session key this task serializes behind.
    pub key: ChannelSessionKey,
    /// Session this task executes against.
    pub session_id: Uuid,
    /// The user message that created this task.
    pub user_message: String,
    /// Current lifecycle state.
    pub state: TaskState,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
    /// When the task last transitioned.
    pub updated_at: DateTime<Utc>,
    /// Populated once the task reaches FAILED.
    pub error: Option<ErrorDescriptor>,
    /// Populated once the task reaches DONE.
    pub result_text: Option<String>,
    /// Surfaces to notify with the final `chat.response` on terminal transition.
    pub observers: Vec<String>,
}

impl Task {
    /// Construct a new PENDING task for `key`.
    pub fn new(key: ChannelSessionKey, session_id: Uuid, user_message: String) -> Self {
        let now = Utc::now();
        Self {
            task_id: Uuid::new_v4(),
            key,
            session_id,
            user_message,
            state: TaskState::Pending,
            created_at: now,
            updated_at: now,
            error: None,
            result_text: None,
            observers: Vec::new(),
        }
    }

    /// Move to `state`, stamping `updated_at`.
    pub fn transition(&mut self, state: TaskState) {
        self.state = state;
        self.updated_at = Utc::now();
    }
}

/// One entry in a session's append-only message log (spec §6 persisted state).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMessage {
    /// Discriminates the kind of message.
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Message body; shape depends on `kind`.
    pub content: serde_json::Value,
    /// When the message was appended.
    pub timestamp: DateTime<Utc>,
    /// Optional free-form metadata (tool id, step id, etc).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// The kind of a `SessionMessage` (spec §6 persisted state: session log).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// A message from the user.
    User,
    /// A message from the agent's final response.
    Assistant,
    /// An intermediate planning/reasoning note.
    Thought,
    /// A tool invocation was made.
    Tool,
    /// A tool invocation result.
    Result,
    /// An error occurred.
    Error,
}

/// A session owned by exactly one agent and one user (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Unique session id.
    pub session_id: Uuid,
    /// The channel-session key that owns this session.
    pub key: ChannelSessionKey,
    /// When the session was first created.
    pub created_at: DateTime<Utc>,
}

/// JSON-Schema subset accepted by the Schema Validator (spec §4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SchemaType {
    /// A UTF-8 string.
    String,
    /// A numeric value (integer or float).
    Number,
    /// A boolean value.
    Boolean,
    /// An array whose elements match `items`.
    Array {
        /// Schema each array element must satisfy.
        items: Box<SchemaType>,
    },
    /// A nested object with its own property schema.
    Object {
        /// Typed properties, by name.
        properties: std::collections::BTreeMap<String, SchemaType>,
        /// Property names that must be present.
        #[serde(default)]
        required: Vec<String>,
    },
}

/// A tool's full input schema: always a top-level object (spec §3).
pub type InputSchema = SchemaType;

/// Stable, dotted-namespace description of a tool (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Stable id, e.g. `"fs.read"`.
    pub id: String,
    /// Human-readable description shown to the LLM and operators.
    pub description: String,
    /// Input schema validated before every invocation.
    pub input_schema: InputSchema,
    /// Whether this tool routes through the Approval Flow before running.
    pub requires_approval: bool,
}

/// Execution status of one `Invocation` (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    /// Created, not yet dispatched to the handler.
    Pending,
    /// Handler is running.
    Running,
    /// Suspended behind a pending approval request.
    AwaitingApproval,
    /// Handler returned a result.
    Completed,
    /// Handler errored, timed out, or was denied approval.
    Failed,
}

impl InvocationStatus {
    /// Whether this status is final — no further transition will occur.
    pub fn is_terminal(self) -> bool {
        matches!(self, InvocationStatus::Completed | InvocationStatus::Failed)
    }
}

/// One runtime call of a tool (spec §3; distinct from a Plan Step).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invocation {
    /// Unique invocation id.
    pub invocation_id: Uuid,
    /// The tool being invoked.
    pub tool_id: String,
    /// Session this invocation is attributed to.
    pub session_id: Uuid,
    /// Input already validated against the tool's schema.
    pub input: serde_json::Value,
    /// Current status.
    pub status: InvocationStatus,
    /// When the invocation was created.
    pub start_time: DateTime<Utc>,
    /// When the invocation reached a terminal status.
    pub end_time: Option<DateTime<Utc>>,
    /// Result payload once completed or failed.
    pub result: Option<ToolResult>,
    /// How many times this logical step has been retried.
    pub retry_count: u32,
    /// The invocation this one retries, if any, forming a retry chain.
    pub parent_invocation_id: Option<Uuid>,
    /// Agent id that issued the invocation.
    pub agent_id: String,
    /// User id on whose behalf the invocation runs.
    pub user_id: String,
}

/// Structured metadata carried by every `ToolResult` (spec §6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolResultMeta {
    /// Wall-clock duration of the invocation in milliseconds.
    pub duration_ms: u64,
    /// Paths to any artifacts the tool produced.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<String>,
    /// Set when the tool's output was truncated.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
}

/// A structured error returned by a failed tool invocation (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResultError {
    /// Taxonomy code (spec §4.5 / §7).
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional extra structured detail (e.g. schema validation error list).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// The shape returned through `tools.invoke` and between components (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// Whether the invocation succeeded.
    pub ok: bool,
    /// Present iff `ok`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Present iff `!ok`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolResultError>,
    /// Duration/artifact metadata.
    pub meta: ToolResultMeta,
}

impl ToolResult {
    /// Build a successful result with the given data and duration.
    pub fn success(data: serde_json::Value, duration_ms: u64) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
            meta: ToolResultMeta {
                duration_ms,
                ..Default::default()
            },
        }
    }

    /// Build a failed result with the given taxonomy code and message.
    pub fn failure(code: impl Into<String>, message: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(ToolResultError {
                code: code.into(),
                message: message.into(),
                details: None,
            }),
            meta: ToolResultMeta {
                duration_ms,
                ..Default::default()
            },
        }
    }

    /// Attach structured detail (e.g. schema validation errors) to a failure.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        if let Some(error) = self.error.as_mut() {
            error.details = Some(details);
        }
        self
    }
}

/// One step of a `Plan` produced by the Planner (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    /// Unique step id, stable within the plan.
    pub step_id: String,
    /// Human-readable description shown in the session's thought log.
    pub description: String,
    /// Tool to invoke for this step, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_id: Option<String>,
    /// Input for `tool_id`, matching that tool's schema.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
    /// Step ids that must complete before this step may run.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

/// An ordered sequence of steps produced by the Planner for one user message
/// (spec §3). Consumed exactly once by the Executor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Plan {
    /// Steps in planner-emitted order.
    pub steps: Vec<PlanStep>,
}

/// Status of one `ApprovalRequest` (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    /// Awaiting a human decision.
    Pending,
    /// Approved.
    Approved,
    /// Rejected.
    Rejected,
    /// Expired before a decision was made.
    Expired,
}

/// A pending (or resolved) human approval for one tool invocation (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// Unique approval request id.
    pub approval_id: Uuid,
    /// The invocation this request gates.
    pub invocation_id: Uuid,
    /// Tool being invoked.
    pub tool_id: String,
    /// Session the invocation belongs to.
    pub session_id: Uuid,
    /// The already-validated tool input.
    pub input: serde_json::Value,
    /// Current status.
    pub status: ApprovalStatus,
    /// User id that triggered the invocation requiring approval.
    pub requesting_user_id: String,
    /// When the request was created.
    pub created_at: DateTime<Utc>,
    /// When the request expires if left unresolved.
    pub expires_at: DateTime<Utc>,
    /// User id that resolved the request, if resolved by a human.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responder_id: Option<String>,
    /// When the request was resolved, if resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responded_at: Option<DateTime<Utc>>,
}

impl ApprovalRequest {
    /// Terminal statuses never transition again (spec §8 invariant 8).
    pub fn is_terminal(&self) -> bool {
        !matches!(self.status, ApprovalStatus::Pending)
    }
}

/// A single-use pairing code mapped to a user id (spec §3, §4.10).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingCode {
    /// The 8-character high-entropy code.
    pub code: String,
    /// User id this code pairs.
    pub user_id: String,
    /// When the code was issued.
    pub created_at: DateTime<Utc>,
    /// When the code expires if unused.
    pub expires_at: DateTime<Utc>,
    /// Set once the code has been successfully consumed.
    pub approved: bool,
}
