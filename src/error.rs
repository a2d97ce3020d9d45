//! Component-local error types and the crate-level error taxonomy (spec §7).

use thiserror::Error;
use uuid::Uuid;

/// One of the stable failure codes from spec §7, attached to every
/// non-`ok` `ToolResult` and surfaced verbatim over JSON-RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCode {
    /// No tool is registered under the requested id.
    ToolNotFound,
    /// Input failed schema validation.
    InvalidInput,
    /// The global concurrency cap was reached.
    ConcurrencyLimit,
    /// The tool handler returned an error, panicked, or timed out.
    ExecutionError,
    /// A human rejected the approval request gating this invocation.
    ApprovalDenied,
    /// No invocation/approval exists under the requested id.
    InvocationNotFound,
    /// The requested transition is not valid from the current state.
    InvalidState,
    /// No approval request exists under the requested id.
    ApprovalNotFound,
    /// The approval request has already reached a terminal status.
    ApprovalAlreadyResolved,
    /// The approval request's deadline passed before it was resolved.
    ApprovalExpired,
}

impl FailureCode {
    /// The wire string used in `ToolResultError.code` / JSON-RPC error data.
    pub fn as_str(self) -> &'static str {
        match self {
            FailureCode::ToolNotFound => "TOOL_NOT_FOUND",
            FailureCode::InvalidInput => "INVALID_INPUT",
            FailureCode::ConcurrencyLimit => "CONCURRENCY_LIMIT",
            FailureCode::ExecutionError => "EXECUTION_ERROR",
            FailureCode::ApprovalDenied => "APPROVAL_DENIED",
            FailureCode::InvocationNotFound => "INVOCATION_NOT_FOUND",
            FailureCode::InvalidState => "INVALID_STATE",
            FailureCode::ApprovalNotFound => "APPROVAL_NOT_FOUND",
            FailureCode::ApprovalAlreadyResolved => "APPROVAL_ALREADY_RESOLVED",
            FailureCode::ApprovalExpired => "APPROVAL_EXPIRED",
        }
    }
}

impl std::fmt::Display for FailureCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by the Tool Registry (spec §4.2).
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No tool is registered under this id.
    #[error("no tool registered under id `{0}`")]
    NotFound(String),
}

/// Errors raised by the Schema Validator (spec §4.3).
#[derive(Debug, Error)]
pub enum SchemaError {
    /// A required property was missing.
    #[error("missing required property `{0}`")]
    MissingProperty(String),
    /// A property's value did not match its declared type.
    #[error("property `{path}` expected {expected}, got {actual}")]
    TypeMismatch {
        /// Dotted path to the offending property.
        path: String,
        /// Expected JSON-Schema type name.
        expected: &'static str,
        /// Actual JSON type name encountered.
        actual: &'static str,
    },
    /// The top-level input was not a JSON object.
    #[error("input must be a JSON object")]
    NotAnObject,
}

/// Errors raised by the Approval Manager's command policy (spec §4.4).
#[derive(Debug, Error)]
pub enum PolicyError {
    /// The command matched a denylist pattern.
    #[error("command denied by policy: {0}")]
    Denied(String),
    /// The command's working directory escaped the permitted workspace root.
    #[error("working directory `{0}` is outside the workspace root")]
    CwdOutsideRoot(String),
    /// The policy file could not be parsed.
    #[error("failed to parse policy file: {0}")]
    InvalidPolicyFile(String),
}

/// Errors raised by the Tool Runtime (spec §4.5).
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// See [`FailureCode::ToolNotFound`].
    #[error("tool `{0}` not found")]
    ToolNotFound(String),
    /// See [`FailureCode::InvalidInput`].
    #[error("invalid input: {0}")]
    InvalidInput(#[from] SchemaError),
    /// See [`FailureCode::ConcurrencyLimit`].
    #[error("global concurrency limit reached")]
    ConcurrencyLimit,
    /// See [`FailureCode::ExecutionError`]; wraps the handler's error text.
    #[error("execution error: {0}")]
    ExecutionError(String),
    /// See [`FailureCode::ApprovalDenied`].
    #[error("invocation {0} was denied approval")]
    ApprovalDenied(Uuid),
    /// See [`FailureCode::InvocationNotFound`].
    #[error("invocation {0} not found")]
    InvocationNotFound(Uuid),
    /// See [`FailureCode::InvalidState`].
    #[error("invocation {0} is not in a state that allows this operation")]
    InvalidState(Uuid),
}

impl RuntimeError {
    /// The stable failure code this error maps to.
    pub fn code(&self) -> FailureCode {
        match self {
            RuntimeError::ToolNotFound(_) => FailureCode::ToolNotFound,
            RuntimeError::InvalidInput(_) => FailureCode::InvalidInput,
            RuntimeError::ConcurrencyLimit => FailureCode::ConcurrencyLimit,
            RuntimeError::ExecutionError(_) => FailureCode::ExecutionError,
            RuntimeError::ApprovalDenied(_) => FailureCode::ApprovalDenied,
            RuntimeError::InvocationNotFound(_) => FailureCode::InvocationNotFound,
            RuntimeError::InvalidState(_) => FailureCode::InvalidState,
        }
    }
}

/// Errors raised by the Approval Flow (spec §4.6).
#[derive(Debug, Error)]
pub enum ApprovalError {
    /// No pending (or resolved) approval exists under this id.
    #[error("approval {0} not found")]
    NotFound(Uuid),
    /// The approval has already reached a terminal status.
    #[error("approval {0} was already resolved")]
    AlreadyResolved(Uuid),
    /// The approval's deadline passed before it was resolved.
    #[error("approval {0} expired before a decision was made")]
    Expired(Uuid),
    /// Persisting the approval store to disk failed.
    #[error("failed to persist approval store: {0}")]
    Persistence(String),
}

impl ApprovalError {
    /// The stable failure code this error maps to, where one applies.
    pub fn code(&self) -> Option<FailureCode> {
        match self {
            ApprovalError::NotFound(_) => Some(FailureCode::ApprovalNotFound),
            ApprovalError::AlreadyResolved(_) => Some(FailureCode::ApprovalAlreadyResolved),
            ApprovalError::Expired(_) => Some(FailureCode::ApprovalExpired),
            ApprovalError::Persistence(_) => None,
        }
    }
}

/// Errors raised by the Planner (spec §4.7).
#[derive(Debug, Error)]
pub enum PlannerError {
    /// The LLM provider call itself failed (network, auth, rate limit).
    #[error("planner provider error: {0}")]
    Provider(String),
    /// The provider's response could not be parsed into any supported shape.
    #[error("could not parse a plan from the model response")]
    Unparseable,
}

/// Errors raised by the Executor/Replanner (spec §4.7).
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// A plan step referenced a `dependsOn` id that does not exist in the plan.
    #[error("step `{0}` depends on unknown step `{1}`")]
    UnknownDependency(String, String),
    /// A plan step's `dependsOn` graph contains a cycle.
    #[error("plan contains a dependency cycle")]
    DependencyCycle,
    /// The replanner gave up on a step: its retry budget was exhausted, the
    /// failure was a non-retryable validation error, or human approval was
    /// denied on a retried attempt.
    #[error("step `{0}` failed and recovery did not retry it")]
    Aborted(String),
    /// The underlying tool invocation failed.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// Errors raised by the Task Orchestrator (spec §4.8).
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// No task exists under this id.
    #[error("task {0} not found")]
    TaskNotFound(Uuid),
    /// The requested transition is not valid from the task's current state.
    #[error("task {0} is not in a state that allows this operation")]
    InvalidState(Uuid),
}

/// Errors raised by Auth & Pairing (spec §4.10).
#[derive(Debug, Error)]
pub enum AuthError {
    /// The bearer token did not match any configured hash.
    #[error("invalid or unknown token")]
    InvalidToken,
    /// The pairing code does not exist, already expired, or was already used.
    #[error("invalid or expired pairing code")]
    InvalidPairingCode,
}

/// Crate-level error surfaced at the Gateway Facade boundary (spec §4.9),
/// wrapping every component error into a single JSON-RPC-error-shaped type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// See [`RegistryError`].
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// See [`SchemaError`].
    #[error(transparent)]
    Schema(#[from] SchemaError),
    /// See [`PolicyError`].
    #[error(transparent)]
    Policy(#[from] PolicyError),
    /// See [`RuntimeError`].
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    /// See [`ApprovalError`].
    #[error(transparent)]
    Approval(#[from] ApprovalError),
    /// See [`PlannerError`].
    #[error(transparent)]
    Planner(#[from] PlannerError),
    /// See [`ExecutorError`].
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    /// See [`OrchestratorError`].
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    /// See [`AuthError`].
    #[error(transparent)]
    Auth(#[from] AuthError),
    /// See [`crate::session::SessionError`].
    #[error(transparent)]
    Session(#[from] crate::session::SessionError),
    /// The request did not name a known JSON-RPC method.
    #[error("unknown method `{0}`")]
    UnknownMethod(String),
    /// The request's `params` did not match the method's expected shape.
    #[error("invalid params: {0}")]
    InvalidParams(String),
}

impl GatewayError {
    /// A JSON-RPC-friendly numeric code, following the `-32000`..`-32099`
    /// "Server error" reservation for application errors and the standard
    /// `-32601`/`-32602` codes for method/param problems.
    pub fn rpc_code(&self) -> i64 {
        match self {
            GatewayError::UnknownMethod(_) => -32601,
            GatewayError::InvalidParams(_) | GatewayError::Schema(_) => -32602,
            _ => -32000,
        }
    }

    /// The stable taxonomy code (spec §7), where applicable, for inclusion
    /// in the JSON-RPC error's `data` field.
    pub fn failure_code(&self) -> Option<FailureCode> {
        match self {
            GatewayError::Runtime(e) => Some(e.code()),
            GatewayError::Registry(RegistryError::NotFound(_)) => Some(FailureCode::ToolNotFound),
            GatewayError::Schema(_) => Some(FailureCode::InvalidInput),
            GatewayError::Approval(e) => e.code(),
            GatewayError::Session(crate::session::SessionError::NotFound(_)) => {
                Some(FailureCode::InvocationNotFound)
            }
            _ => None,
        }
    }
}
