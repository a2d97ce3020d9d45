//! Internal pub/sub broker (spec §9 design note).
//!
//! Every component that needs to notify others of a state change
//! (task transitions, approval transitions, invocation completion)
//! publishes a [`GatewayEvent`] here instead of calling into its peers
//! directly. The Gateway Facade subscribes to turn these into JSON-RPC
//! notifications; the audit logger subscribes to turn privileged ones
//! into audit-trail entries.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::types::{ApprovalStatus, InvocationStatus, TaskState};

/// Broadcast channel capacity. Slow subscribers that fall this far behind
/// drop the oldest events rather than back-pressuring publishers.
const CHANNEL_CAPACITY: usize = 1024;

/// One notifiable fact published on the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GatewayEvent {
    /// A task transitioned state.
    TaskTransitioned {
        /// The task that transitioned.
        task_id: Uuid,
        /// State before the transition.
        from: TaskState,
        /// State after the transition.
        to: TaskState,
    },
    /// A task reached a terminal state and has a response ready for its observers.
    TaskCompleted {
        /// The task that completed.
        task_id: Uuid,
        /// Logical room/channel id the task's key belongs to.
        channel_id: String,
        /// User id the task's key belongs to.
        user_id: String,
        /// Final response text, if any.
        result_text: Option<String>,
    },
    /// An invocation transitioned state.
    InvocationTransitioned {
        /// The invocation that transitioned.
        invocation_id: Uuid,
        /// State after the transition.
        status: InvocationStatus,
    },
    /// A new approval request was created and needs surfacing to a human.
    ApprovalRequested {
        /// The new request's id.
        approval_id: Uuid,
        /// Tool awaiting approval.
        tool_id: String,
    },
    /// An approval request was resolved (approved, rejected, or expired).
    ApprovalResolved {
        /// The resolved request's id.
        approval_id: Uuid,
        /// Resulting status; always terminal.
        status: ApprovalStatus,
    },
    /// A command was denied by policy before it ever reached the runtime.
    PolicyDenied {
        /// Tool the denied command belonged to.
        tool_id: String,
        /// Human-readable denial reason.
        reason: String,
    },
    /// An authentication attempt failed.
    AuthFailed {
        /// Best-effort identifier of the caller (may be `"unknown"`).
        principal: String,
    },
    /// A pairing code was successfully consumed.
    PairingApproved {
        /// The user id that was paired.
        user_id: String,
    },
}

/// Shared publish/subscribe handle over [`GatewayEvent`]s.
///
/// Cloning an `EventBus` shares the same underlying channel; every clone
/// publishes to and can subscribe from the same stream.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<GatewayEvent>,
}

impl EventBus {
    /// Create a new broker with its own bounded channel.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Publish an event. Returns the number of active subscribers that
    /// received it; `0` is not an error, it just means nobody is listening.
    pub fn publish(&self, event: GatewayEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Subscribe to the event stream from this point forward.
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
