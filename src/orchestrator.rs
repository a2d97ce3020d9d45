//! Task Orchestrator (spec §4.8): owns the task registry and a per-key FIFO
//! queue that guarantees at most one task for a given [`ChannelSessionKey`]
//! is ever RUNNING or PAUSED at a time.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::events::{EventBus, GatewayEvent};
use crate::executor::Executor;
use crate::planner::Planner;
use crate::session::SessionStore;
use crate::types::{ChannelSessionKey, ErrorDescriptor, Task, TaskState};

/// Shared handle to the live task registry. Cloned into both the
/// [`TaskOrchestrator`] (which owns task creation, queuing, and draining)
/// and the [`Executor`] (which pauses a task while one of its invocations
/// awaits approval and resumes it afterward) so neither needs to own the
/// other.
#[derive(Clone)]
pub struct TaskHandle {
    tasks: Arc<RwLock<HashMap<Uuid, Task>>>,
    bus: EventBus,
}

impl TaskHandle {
    /// Build an empty handle publishing task transitions onto `bus`.
    pub fn new(bus: EventBus) -> Self {
        Self {
            tasks: Arc::new(RwLock::new(HashMap::new())),
            bus,
        }
    }

    /// Look up a task by id.
    pub async fn get(&self, task_id: Uuid) -> Result<Task, OrchestratorError> {
        self.tasks
            .read()
            .await
            .get(&task_id)
            .cloned()
            .ok_or(OrchestratorError::TaskNotFound(task_id))
    }

    /// Insert or overwrite a task's stored state.
    pub async fn store(&self, task: Task) {
        self.tasks.write().await.insert(task.task_id, task);
    }

    /// Suspend a RUNNING task (spec §3: e.g. while one of its invocations
    /// awaits approval).
    pub async fn pause(&self, task_id: Uuid) -> Result<(), OrchestratorError> {
        self.transition_if(task_id, TaskState::Running, TaskState::Paused).await
    }

    /// Resume a PAUSED task back to RUNNING.
    pub async fn resume(&self, task_id: Uuid) -> Result<(), OrchestratorError> {
        self.transition_if(task_id, TaskState::Paused, TaskState::Running).await
    }

    /// Abort a non-terminal task.
    pub async fn abort(&self, task_id: Uuid) -> Result<(), OrchestratorError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(&task_id).ok_or(OrchestratorError::TaskNotFound(task_id))?;
        if task.state.is_terminal() {
            return Err(OrchestratorError::InvalidState(task_id));
        }
        let from = task.state;
        task.transition(TaskState::Aborted);
        self.bus.publish(GatewayEvent::TaskTransitioned {
            task_id,
            from,
            to: TaskState::Aborted,
        });
        Ok(())
    }

    async fn transition_if(
        &self,
        task_id: Uuid,
        expected: TaskState,
        to: TaskState,
    ) -> Result<(), OrchestratorError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(&task_id).ok_or(OrchestratorError::TaskNotFound(task_id))?;
        if task.state != expected {
            return Err(OrchestratorError::InvalidState(task_id));
        }
        task.transition(to);
        self.bus.publish(GatewayEvent::TaskTransitioned {
            task_id,
            from: expected,
            to,
        });
        Ok(())
    }
}

/// Owns every task, serialized per channel-session key.
///
/// A task is appended to its key's queue on creation; a background drain
/// loop (spawned the first time a key goes from empty to non-empty) pops
/// tasks one at a time, fully running each to a terminal state before the
/// next one starts. This is the single place the "at most one RUNNING or
/// PAUSED task per key" invariant (spec §3) is enforced.
#[derive(Clone)]
pub struct TaskOrchestrator {
    handle: TaskHandle,
    queues: Arc<RwLock<HashMap<ChannelSessionKey, VecDeque<Uuid>>>>,
    processing: Arc<RwLock<HashMap<ChannelSessionKey, bool>>>,
    sessions: SessionStore,
    planner: Planner,
    executor: Executor,
    bus: EventBus,
}

impl TaskOrchestrator {
    /// Build an orchestrator over an already-wired planner and executor,
    /// sharing `handle` with the executor so it can pause/resume tasks
    /// suspended on approval.
    pub fn new(
        handle: TaskHandle,
        sessions: SessionStore,
        planner: Planner,
        executor: Executor,
        bus: EventBus,
    ) -> Self {
        Self {
            handle,
            queues: Arc::new(RwLock::new(HashMap::new())),
            processing: Arc::new(RwLock::new(HashMap::new())),
            sessions,
            planner,
            executor,
            bus,
        }
    }

    /// Create a PENDING task for `key` and enqueue it. Spawns the drain
    /// loop for `key` if it isn't already running.
    pub async fn create_task(
        &self,
        key: ChannelSessionKey,
        user_message: String,
        observers: Vec<String>,
    ) -> Task {
        let session = self.sessions.get_or_create(&key).await;
        let _ = self
            .sessions
            .append(
                session.session_id,
                crate::types::SessionMessage {
                    kind: crate::types::MessageKind::User,
                    content: serde_json::json!(user_message),
                    timestamp: chrono::Utc::now(),
                    metadata: None,
                },
            )
            .await;

        let mut task = Task::new(key.clone(), session.session_id, user_message);
        task.observers = observers;

        self.handle.store(task.clone()).await;
        self.queues
            .write()
            .await
            .entry(key.clone())
            .or_default()
            .push_back(task.task_id);

        self.maybe_spawn_drain(key).await;
        task
    }

    /// Look up a task by id.
    pub async fn get(&self, task_id: Uuid) -> Result<Task, OrchestratorError> {
        self.handle.get(task_id).await
    }

    /// Suspend a RUNNING task (spec §3: e.g. while one of its invocations
    /// awaits approval).
    pub async fn pause(&self, task_id: Uuid) -> Result<(), OrchestratorError> {
        self.handle.pause(task_id).await
    }

    /// Resume a PAUSED task back to RUNNING.
    pub async fn resume(&self, task_id: Uuid) -> Result<(), OrchestratorError> {
        self.handle.resume(task_id).await
    }

    /// Abort a non-terminal task.
    pub async fn abort(&self, task_id: Uuid) -> Result<(), OrchestratorError> {
        self.handle.abort(task_id).await
    }

    async fn maybe_spawn_drain(&self, key: ChannelSessionKey) {
        let mut processing = self.processing.write().await;
        if *processing.get(&key).unwrap_or(&false) {
            return;
        }
        processing.insert(key.clone(), true);
        drop(processing);

        let this = self.clone();
        tokio::spawn(async move {
            this.drain(key).await;
        });
    }

    async fn drain(&self, key: ChannelSessionKey) {
        loop {
            let next = self.queues.write().await.get_mut(&key).and_then(VecDeque::pop_front);
            let Some(task_id) = next else {
                break;
            };
            self.run_one(task_id).await;
        }
        self.processing.write().await.insert(key, false);
    }

    async fn run_one(&self, task_id: Uuid) {
        let Ok(mut task) = self.get(task_id).await else {
            return;
        };
        if task.state.is_terminal() {
            return;
        }

        let from = task.state;
        task.transition(TaskState::Running);
        self.handle.store(task.clone()).await;
        self.bus.publish(GatewayEvent::TaskTransitioned {
            task_id,
            from,
            to: TaskState::Running,
        });

        let plan = match self.planner.plan_with_context(&task.user_message, Some(&task.key.user)).await {
            Ok(plan) => plan,
            Err(err) => {
                self.finish_failed(&mut task, "PLANNER_ERROR", err.to_string()).await;
                return;
            }
        };

        match self
            .executor
            .execute(task.session_id, &task.key.surface, &task.key.user, Some(task_id), plan, None)
            .await
        {
            Ok(result_text) => self.finish_done(&mut task, result_text).await,
            Err(err) => self.finish_failed(&mut task, "EXECUTION_ERROR", err.to_string()).await,
        }
    }

    async fn finish_done(&self, task: &mut Task, result_text: String) {
        task.result_text = Some(result_text.clone());
        task.transition(TaskState::Done);
        self.handle.store(task.clone()).await;
        self.bus.publish(GatewayEvent::TaskCompleted {
            task_id: task.task_id,
            channel_id: task.key.channel.clone(),
            user_id: task.key.user.clone(),
            result_text: Some(result_text),
        });
    }

    async fn finish_failed(&self, task: &mut Task, code: &str, message: String) {
        task.error = Some(ErrorDescriptor {
            code: code.to_string(),
            message,
        });
        task.transition(TaskState::Failed);
        self.handle.store(task.clone()).await;
        self.bus.publish(GatewayEvent::TaskCompleted {
            task_id: task.task_id,
            channel_id: task.key.channel.clone(),
            user_id: task.key.user.clone(),
            result_text: None,
        });
    }
}
