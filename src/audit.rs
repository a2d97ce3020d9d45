//! Audit trail (SPEC_FULL §B.2): a structured, append-only record of every
//! privileged decision the gateway makes — approval requests and
//! resolutions, policy denials, and authentication failures.
//!
//! This is purely additive observability: nothing reads it back at runtime.
//! It exists so an operator can reconstruct "who approved what, and why"
//! after the fact, the way the teacher's `AuditLogger` does for its own
//! privileged-operation log.

use std::path::Path;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use uuid::Uuid;

use crate::events::{EventBus, GatewayEvent};

/// Discriminates the kind of privileged event recorded (spec §7, §9).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    /// A new approval request was created.
    ApprovalRequested,
    /// An approval request reached a terminal status.
    ApprovalResolved,
    /// A command was denied by the command policy before reaching the runtime.
    PolicyDenied,
    /// A bearer token failed verification.
    AuthFailed,
    /// A pairing code was successfully consumed.
    PairingApproved,
}

#[derive(Debug, Serialize)]
struct AuditEntry {
    timestamp: chrono::DateTime<chrono::Utc>,
    kind: AuditEventKind,
    details: serde_json::Value,
}

/// Errors raised while writing to the audit log.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// The audit log file could not be opened or written.
    #[error("failed to write audit log: {0}")]
    Io(#[from] std::io::Error),
}

/// Appends one JSON line per privileged decision to a file sink.
///
/// Writes are serialized through a `Mutex` the same way the teacher's
/// `AuditLogger` does; a slow or failing write never blocks the caller's
/// own control flow, since every call site treats audit logging as
/// best-effort and only logs (via `tracing`) if it fails.
pub struct AuditLogger {
    writer: Mutex<Box<dyn std::io::Write + Send>>,
}

impl AuditLogger {
    /// Open (creating if absent) an append-only audit log at `path`.
    pub fn open(path: &Path) -> Result<Self, AuditError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            writer: Mutex::new(Box::new(file)),
        })
    }

    /// Build a logger over an arbitrary writer, for tests.
    pub fn from_writer(writer: Box<dyn std::io::Write + Send>) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Record that an approval request was created.
    pub fn approval_requested(&self, approval_id: Uuid, tool_id: &str, session_id: Uuid) {
        self.write(
            AuditEventKind::ApprovalRequested,
            serde_json::json!({"approval_id": approval_id, "tool_id": tool_id, "session_id": session_id}),
        );
    }

    /// Record that an approval request reached a terminal status.
    pub fn approval_resolved(&self, approval_id: Uuid, status: &str, responder_id: Option<&str>) {
        self.write(
            AuditEventKind::ApprovalResolved,
            serde_json::json!({"approval_id": approval_id, "status": status, "responder_id": responder_id}),
        );
    }

    /// Record a command policy denial.
    pub fn policy_denied(&self, tool_id: &str, reason: &str) {
        self.write(
            AuditEventKind::PolicyDenied,
            serde_json::json!({"tool_id": tool_id, "reason": reason}),
        );
    }

    /// Record a failed authentication attempt.
    pub fn auth_failed(&self, principal: &str) {
        self.write(AuditEventKind::AuthFailed, serde_json::json!({"principal": principal}));
    }

    /// Record a successful pairing-code consumption.
    pub fn pairing_approved(&self, user_id: &str) {
        self.write(AuditEventKind::PairingApproved, serde_json::json!({"user_id": user_id}));
    }

    /// Record an `ApprovalRequested`/`ApprovalResolved`/`PolicyDenied`/
    /// `AuthFailed`/`PairingApproved` event coming off the [`EventBus`]
    /// (spec §9: "the audit logger subscribes to turn privileged ones
    /// into audit-trail entries"). Other event kinds are ignored.
    fn record_event(&self, event: GatewayEvent) {
        match event {
            GatewayEvent::ApprovalRequested { approval_id, tool_id } => {
                self.write(
                    AuditEventKind::ApprovalRequested,
                    serde_json::json!({"approval_id": approval_id, "tool_id": tool_id}),
                );
            }
            GatewayEvent::ApprovalResolved { approval_id, status } => {
                self.write(
                    AuditEventKind::ApprovalResolved,
                    serde_json::json!({"approval_id": approval_id, "status": status}),
                );
            }
            GatewayEvent::PolicyDenied { tool_id, reason } => {
                self.policy_denied(&tool_id, &reason);
            }
            GatewayEvent::AuthFailed { principal } => {
                self.auth_failed(&principal);
            }
            GatewayEvent::PairingApproved { user_id } => {
                self.pairing_approved(&user_id);
            }
            _ => {}
        }
    }

    fn write(&self, kind: AuditEventKind, details: serde_json::Value) {
        let entry = AuditEntry {
            timestamp: chrono::Utc::now(),
            kind,
            details,
        };
        let Ok(mut line) = serde_json::to_string(&entry) else {
            return;
        };
        line.push('\n');
        if let Ok(mut writer) = self.writer.lock() {
            if let Err(err) = writer.write_all(line.as_bytes()) {
                tracing::warn!(error = %err, "failed to append audit log entry");
            }
        }
    }
}

/// Spawn a background task that feeds every privileged [`GatewayEvent`]
/// published on `bus` into `logger` for the lifetime of the process
/// (spec §9). Returns the task's handle; dropping it without aborting
/// leaves the subscriber running, which is the intended shutdown
/// behavior (the bus's sender is dropped when the gateway itself stops).
pub fn spawn_subscriber(logger: Arc<AuditLogger>, bus: &EventBus) -> tokio::task::JoinHandle<()> {
    let mut events = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => logger.record_event(event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "audit subscriber lagged behind the event bus");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::{Arc, Mutex as StdMutex};

    #[derive(Clone)]
    struct SharedBuf(Arc<StdMutex<Cursor<Vec<u8>>>>);

    impl std::io::Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().expect("lock").write(buf)
        }
        fn flush(&mut self) -> std::io::Result<()> {
            self.0.lock().expect("lock").flush()
        }
    }

    #[test]
    fn writes_one_json_line_per_event() {
        let buf = SharedBuf(Arc::new(StdMutex::new(Cursor::new(Vec::new()))));
        let logger = AuditLogger::from_writer(Box::new(buf.clone()));
        logger.policy_denied("system.run", "matched deny pattern");
        logger.auth_failed("unknown");

        let contents = buf.0.lock().unwrap().get_ref().clone();
        let text = String::from_utf8(contents).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            assert!(value.get("timestamp").is_some());
            assert!(value.get("kind").is_some());
        }
    }

    #[tokio::test]
    async fn subscriber_records_bus_events() {
        let buf = SharedBuf(Arc::new(StdMutex::new(Cursor::new(Vec::new()))));
        let logger = Arc::new(AuditLogger::from_writer(Box::new(buf.clone())));
        let bus = EventBus::new();
        let handle = spawn_subscriber(logger, &bus);

        bus.publish(GatewayEvent::AuthFailed { principal: "unknown".to_string() });
        bus.publish(GatewayEvent::TaskTransitioned {
            task_id: Uuid::new_v4(),
            from: crate::types::TaskState::Pending,
            to: crate::types::TaskState::Running,
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        handle.abort();

        let contents = buf.0.lock().unwrap().get_ref().clone();
        let text = String::from_utf8(contents).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        // Only the AuthFailed event is a privileged kind; TaskTransitioned is ignored.
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("auth_failed"));
    }
}
