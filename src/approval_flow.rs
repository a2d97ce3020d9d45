//! Approval Flow (spec §4.6): a persistent, surfaced-to-humans state machine
//! for tool invocations that require sign-off before they run.
//!
//! Pending requests survive a restart (one JSON file under the configured
//! data directory) and resolve via either `approval.respond` or the
//! periodic expiry sweep. Surface handlers are fanned out to independently;
//! one handler's failure to deliver a notification never blocks another's,
//! mirroring a `Promise.allSettled` fan-out.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{oneshot, Mutex, RwLock};
use uuid::Uuid;

use crate::error::ApprovalError;
use crate::events::{EventBus, GatewayEvent};
use crate::types::{ApprovalRequest, ApprovalStatus};

/// Something that can be notified of an approval request's lifecycle,
/// e.g. a chat surface adapter posting or editing an interactive message.
#[async_trait]
pub trait ApprovalHandler: Send + Sync {
    /// Deliver the initial notification for a newly created `request`.
    /// Errors are logged and do not affect other handlers or the request
    /// itself.
    async fn send_request(&self, request: &ApprovalRequest) -> Result<(), String>;

    /// Deliver an update once `request` reaches a terminal status
    /// (approved, rejected, or expired). Same error semantics as
    /// [`ApprovalHandler::send_request`].
    async fn send_update(&self, request: &ApprovalRequest) -> Result<(), String>;
}

struct Entry {
    request: ApprovalRequest,
    resolved_tx: Option<oneshot::Sender<ApprovalStatus>>,
}

/// Handle to the approval subsystem, cloneable and safe to share across
/// tasks.
#[derive(Clone)]
pub struct ApprovalFlow {
    inner: Arc<Mutex<HashMap<Uuid, Entry>>>,
    handlers: Arc<RwLock<Vec<Arc<dyn ApprovalHandler>>>>,
    store_path: PathBuf,
    default_ttl: chrono::Duration,
    bus: EventBus,
}

impl ApprovalFlow {
    /// Create a flow backed by `store_path`, loading any pending requests
    /// left over from a previous run.
    pub async fn new(
        store_path: PathBuf,
        default_ttl: std::time::Duration,
        bus: EventBus,
    ) -> Result<Self, ApprovalError> {
        let default_ttl = chrono::Duration::from_std(default_ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(900));
        let loaded = load_from_disk(&store_path)?;
        let inner = loaded
            .into_iter()
            .map(|request| {
                (
                    request.approval_id,
                    Entry {
                        request,
                        resolved_tx: None,
                    },
                )
            })
            .collect();
        Ok(Self {
            inner: Arc::new(Mutex::new(inner)),
            handlers: Arc::new(RwLock::new(Vec::new())),
            store_path,
            default_ttl,
            bus,
        })
    }

    /// Register a surface to be notified of every request this flow
    /// creates, resolves, or expires.
    pub async fn add_handler(&self, handler: Arc<dyn ApprovalHandler>) {
        self.handlers.write().await.push(handler);
    }

    /// Submit a new request gating `invocation_id`, fan it out to every
    /// registered handler, and return a receiver that resolves once the
    /// request reaches a terminal status.
    pub async fn submit(
        &self,
        invocation_id: Uuid,
        tool_id: String,
        session_id: Uuid,
        input: Value,
        requesting_user_id: String,
    ) -> oneshot::Receiver<ApprovalStatus> {
        let now = Utc::now();
        let request = ApprovalRequest {
            approval_id: Uuid::new_v4(),
            invocation_id,
            tool_id: tool_id.clone(),
            session_id,
            input,
            status: ApprovalStatus::Pending,
            requesting_user_id,
            created_at: now,
            expires_at: now + self.default_ttl,
            responder_id: None,
            responded_at: None,
        };

        let (tx, rx) = oneshot::channel();
        {
            let mut guard = self.inner.lock().await;
            guard.insert(
                request.approval_id,
                Entry {
                    request: request.clone(),
                    resolved_tx: Some(tx),
                },
            );
            self.persist(&guard).ok();
        }

        self.bus.publish(GatewayEvent::ApprovalRequested {
            approval_id: request.approval_id,
            tool_id,
        });

        let handlers = self.handlers.read().await.clone();
        for (handler_index, handler) in handlers.iter().enumerate() {
            if let Err(err) = handler.send_request(&request).await {
                tracing::warn!(
                    approval_id = %request.approval_id,
                    handler_index,
                    error = %err,
                    "approval handler failed to deliver request notification"
                );
            }
        }

        rx
    }

    /// Fan out `send_update` to every registered handler for a now-resolved
    /// `request`. One handler's failure is logged and never blocks another.
    async fn notify_update(&self, request: &ApprovalRequest) {
        let handlers = self.handlers.read().await.clone();
        for (handler_index, handler) in handlers.iter().enumerate() {
            if let Err(err) = handler.send_update(request).await {
                tracing::warn!(
                    approval_id = %request.approval_id,
                    handler_index,
                    error = %err,
                    "approval handler failed to deliver update notification"
                );
            }
        }
    }

    /// Resolve a pending request with a human decision (`handleResponse`,
    /// spec §4.6). Fails if the request doesn't exist, already reached a
    /// terminal status, or has passed its `expires_at` — in the last case
    /// the request is itself transitioned to `expired` here rather than
    /// waiting for the next sweep.
    pub async fn respond(
        &self,
        approval_id: Uuid,
        decision: ApprovalStatus,
        responder_id: String,
    ) -> Result<ApprovalRequest, ApprovalError> {
        if !matches!(decision, ApprovalStatus::Approved | ApprovalStatus::Rejected) {
            return Err(ApprovalError::AlreadyResolved(approval_id));
        }

        let now = Utc::now();
        let outcome = {
            let mut guard = self.inner.lock().await;
            let entry = guard
                .get_mut(&approval_id)
                .ok_or(ApprovalError::NotFound(approval_id))?;
            if entry.request.is_terminal() {
                return Err(ApprovalError::AlreadyResolved(approval_id));
            }
            if entry.request.expires_at <= now {
                entry.request.status = ApprovalStatus::Expired;
                entry.request.responded_at = Some(now);
                if let Some(tx) = entry.resolved_tx.take() {
                    let _ = tx.send(ApprovalStatus::Expired);
                }
                let expired = entry.request.clone();
                self.persist(&guard)?;
                Err(expired)
            } else {
                entry.request.status = decision;
                entry.request.responder_id = Some(responder_id);
                entry.request.responded_at = Some(now);
                if let Some(tx) = entry.resolved_tx.take() {
                    let _ = tx.send(decision);
                }
                let resolved = entry.request.clone();
                self.persist(&guard)?;
                Ok(resolved)
            }
        };

        let request = match &outcome {
            Ok(resolved) | Err(resolved) => resolved.clone(),
        };
        self.bus.publish(GatewayEvent::ApprovalResolved {
            approval_id,
            status: request.status,
        });
        self.notify_update(&request).await;

        match outcome {
            Ok(resolved) => Ok(resolved),
            Err(_) => Err(ApprovalError::Expired(approval_id)),
        }
    }

    /// Look up a request by id, whatever its status.
    pub async fn get(&self, approval_id: Uuid) -> Result<ApprovalRequest, ApprovalError> {
        self.inner
            .lock()
            .await
            .get(&approval_id)
            .map(|e| e.request.clone())
            .ok_or(ApprovalError::NotFound(approval_id))
    }

    /// List every still-pending request, oldest first.
    pub async fn list_pending(&self) -> Vec<ApprovalRequest> {
        let guard = self.inner.lock().await;
        let mut pending: Vec<_> = guard
            .values()
            .map(|e| e.request.clone())
            .filter(|r| r.status == ApprovalStatus::Pending)
            .collect();
        pending.sort_by_key(|r| r.created_at);
        pending
    }

    /// Expire every pending request whose `expires_at` has passed, fanning
    /// out `send_update` to every registered handler for each one. Called
    /// periodically by the cleanup sweep (spec §4.6, §A.4). Returns the
    /// expired requests so the caller can drive their gated invocations to
    /// failure.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Vec<ApprovalRequest> {
        let mut expired = Vec::new();
        let mut guard = self.inner.lock().await;
        for entry in guard.values_mut() {
            if entry.request.status == ApprovalStatus::Pending && entry.request.expires_at <= now {
                entry.request.status = ApprovalStatus::Expired;
                entry.request.responded_at = Some(now);
                if let Some(tx) = entry.resolved_tx.take() {
                    let _ = tx.send(ApprovalStatus::Expired);
                }
                expired.push(entry.request.clone());
            }
        }
        if !expired.is_empty() {
            let _ = self.persist(&guard);
        }
        drop(guard);
        for request in &expired {
            self.bus.publish(GatewayEvent::ApprovalResolved {
                approval_id: request.approval_id,
                status: ApprovalStatus::Expired,
            });
            self.notify_update(request).await;
        }
        expired
    }

    fn persist(&self, guard: &HashMap<Uuid, Entry>) -> Result<(), ApprovalError> {
        let requests: Vec<&ApprovalRequest> = guard.values().map(|e| &e.request).collect();
        let json = serde_json::to_string_pretty(&requests)
            .map_err(|e| ApprovalError::Persistence(e.to_string()))?;
        if let Some(parent) = self.store_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ApprovalError::Persistence(e.to_string()))?;
        }
        std::fs::write(&self.store_path, json).map_err(|e| ApprovalError::Persistence(e.to_string()))
    }
}

fn load_from_disk(path: &Path) -> Result<Vec<ApprovalRequest>, ApprovalError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = std::fs::read_to_string(path).map_err(|e| ApprovalError::Persistence(e.to_string()))?;
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(&text).map_err(|e| ApprovalError::Persistence(e.to_string()))
}
