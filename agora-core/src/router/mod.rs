//! Capability-based task routing
//!
//! Agents advertise capabilities with [`TaskRouter::register_capabilities`].
//! [`TaskRouter::submit`] picks one registered agent advertising the task's
//! capability, round-robin per capability, and sends it a TASK from the
//! router's endpoint. A background listener on that endpoint matches
//! RESPONSE messages to assignments by correlation id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;

use crate::agent::{Task, TaskOutcome};
use crate::bus::{Endpoint, Message, MessageBus, MessageKind};
use crate::config::RouterConfig;
use crate::error::{AgoraError, Result};

/// Lifecycle of a routed task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentStatus {
    /// Sent, no response yet
    Assigned,
    Completed,
    /// The handler failed or the TASK could not be delivered
    Failed,
}

/// Record of a task handed to an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub task: Task,
    pub agent_id: String,
    pub status: AssignmentStatus,
    pub assigned_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl TaskAssignment {
    fn new(task: Task, agent_id: String) -> Self {
        Self {
            task,
            agent_id,
            status: AssignmentStatus::Assigned,
            assigned_at: Utc::now(),
            finished_at: None,
            result: None,
            error: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status != AssignmentStatus::Assigned
    }

    fn finish(&mut self, outcome: TaskOutcome) {
        self.status = if outcome.success {
            AssignmentStatus::Completed
        } else {
            AssignmentStatus::Failed
        };
        self.finished_at = Some(Utc::now());
        self.result = outcome.result;
        self.error = outcome.error;
    }
}

#[derive(Default)]
struct RouterState {
    /// (agent id, capabilities) in registration order
    registrations: Vec<(String, BTreeSet<String>)>,
    /// Submissions per capability, drives round-robin
    counters: HashMap<String, usize>,
    assignments: HashMap<Uuid, watch::Sender<TaskAssignment>>,
    /// Task ids in submission order
    order: Vec<Uuid>,
}

/// Routes tasks to capable agents over the bus
pub struct TaskRouter {
    bus: MessageBus,
    config: RouterConfig,
    state: Mutex<RouterState>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for TaskRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRouter")
            .field("endpoint_id", &self.config.endpoint_id)
            .finish()
    }
}

impl TaskRouter {
    /// Open the router's endpoint on `bus` and start listening for responses.
    ///
    /// # Errors
    ///
    /// `AlreadyRegistered` when the endpoint id is taken.
    pub async fn start(bus: MessageBus, config: RouterConfig) -> Result<Arc<Self>> {
        let endpoint = bus.open_endpoint(config.endpoint_id.clone()).await?;
        let router = Arc::new(Self {
            bus,
            config,
            state: Mutex::new(RouterState::default()),
            listener: Mutex::new(None),
        });

        let span = tracing::info_span!("router", endpoint_id = %router.config.endpoint_id);
        let handle = tokio::spawn(listen(Arc::downgrade(&router), endpoint).instrument(span));
        *router.listener() = Some(handle);

        tracing::info!(endpoint_id = %router.config.endpoint_id, "Task router started");
        Ok(router)
    }

    /// Id of the endpoint TASK messages are sent from
    pub fn endpoint_id(&self) -> &str {
        &self.config.endpoint_id
    }

    /// Advertise `capabilities` for `agent_id`.
    ///
    /// An agent registered before keeps its position; its set is replaced.
    pub fn register_capabilities(
        &self,
        agent_id: impl Into<String>,
        capabilities: impl IntoIterator<Item = impl Into<String>>,
    ) {
        let agent_id = agent_id.into();
        let capabilities: BTreeSet<String> = capabilities.into_iter().map(Into::into).collect();
        tracing::debug!(%agent_id, ?capabilities, "Registering capabilities");

        let mut state = self.state();
        match state
            .registrations
            .iter_mut()
            .find(|(id, _)| *id == agent_id)
        {
            Some((_, existing)) => *existing = capabilities,
            None => state.registrations.push((agent_id, capabilities)),
        }
    }

    /// Stop routing to `agent_id`; returns false if it had no registration
    pub fn unregister_capabilities(&self, agent_id: &str) -> bool {
        let mut state = self.state();
        let before = state.registrations.len();
        state.registrations.retain(|(id, _)| id != agent_id);
        state.registrations.len() != before
    }

    /// Agents advertising `capability`, in registration order
    pub fn capable_agents(&self, capability: &str) -> Vec<String> {
        self.state()
            .registrations
            .iter()
            .filter(|(_, caps)| caps.contains(capability))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Assign `task` to a capable agent and send it a TASK.
    ///
    /// Returns without waiting for the agent.
    ///
    /// # Errors
    ///
    /// `NoCapableAgent` when no registered agent advertises the capability.
    /// A send failure is returned after marking the assignment failed.
    pub async fn submit(&self, task: Task) -> Result<TaskAssignment> {
        let live = self.bus.agent_ids().await;

        let assignment = {
            let mut state = self.state();
            let eligible: Vec<&String> = state
                .registrations
                .iter()
                .filter(|(id, caps)| caps.contains(&task.required_capability) && live.contains(id))
                .map(|(id, _)| id)
                .collect();
            if eligible.is_empty() {
                return Err(AgoraError::NoCapableAgent(task.required_capability.clone()));
            }

            let counter = state
                .counters
                .get(&task.required_capability)
                .copied()
                .unwrap_or(0);
            let agent_id = eligible[counter % eligible.len()].clone();
            state
                .counters
                .insert(task.required_capability.clone(), counter + 1);

            let assignment = TaskAssignment::new(task.clone(), agent_id);
            let (sender, _) = watch::channel(assignment.clone());
            state.assignments.insert(task.id, sender);
            state.order.push(task.id);
            assignment
        };

        let message = Message::new(
            MessageKind::Task,
            self.config.endpoint_id.clone(),
            serde_json::to_value(&task)?,
        )
        .to(assignment.agent_id.clone())
        .with_correlation_id(task.id);

        tracing::debug!(
            task_id = %task.id,
            capability = %task.required_capability,
            agent_id = %assignment.agent_id,
            "Routing task"
        );
        if let Err(e) = self.bus.send(message).await {
            tracing::warn!(task_id = %task.id, error = %e, "Could not deliver task");
            self.update(task.id, |assignment| {
                assignment.status = AssignmentStatus::Failed;
                assignment.finished_at = Some(Utc::now());
                assignment.error = Some(e.to_string());
            });
            return Err(e);
        }
        Ok(assignment)
    }

    /// Current record of task `task_id`
    pub fn assignment(&self, task_id: Uuid) -> Option<TaskAssignment> {
        self.state()
            .assignments
            .get(&task_id)
            .map(|sender| sender.borrow().clone())
    }

    /// Every assignment, in submission order
    pub fn assignments(&self) -> Vec<TaskAssignment> {
        let state = self.state();
        state
            .order
            .iter()
            .filter_map(|id| state.assignments.get(id))
            .map(|sender| sender.borrow().clone())
            .collect()
    }

    /// Number of retained assignments per agent
    pub fn assignment_counts(&self) -> HashMap<String, usize> {
        let state = self.state();
        let mut counts = HashMap::new();
        for sender in state.assignments.values() {
            *counts.entry(sender.borrow().agent_id.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Wait until task `task_id` finishes or `timeout` elapses.
    ///
    /// Returns the assignment as it stands at that point; check
    /// [`TaskAssignment::is_finished`] to tell a timeout apart.
    pub async fn await_completion(&self, task_id: Uuid, timeout: Duration) -> Result<TaskAssignment> {
        let mut receiver = self
            .state()
            .assignments
            .get(&task_id)
            .map(watch::Sender::subscribe)
            .ok_or_else(|| AgoraError::Other(format!("Unknown task: {}", task_id)))?;

        let finished = tokio::time::timeout(timeout, async {
            receiver
                .wait_for(TaskAssignment::is_finished)
                .await
                .map(|assignment| assignment.clone())
        })
        .await;
        match finished {
            Ok(Ok(assignment)) => Ok(assignment),
            _ => Ok(receiver.borrow().clone()),
        }
    }

    /// Drop the record of a finished task; records of tasks in flight are kept
    pub fn forget(&self, task_id: Uuid) -> Option<TaskAssignment> {
        let mut state = self.state();
        if !state.assignments.get(&task_id)?.borrow().is_finished() {
            return None;
        }
        state.order.retain(|id| *id != task_id);
        state
            .assignments
            .remove(&task_id)
            .map(|sender| sender.borrow().clone())
    }

    /// Drop the records of every finished task; returns how many were dropped
    pub fn prune_finished(&self) -> usize {
        let mut state = self.state();
        let RouterState {
            assignments, order, ..
        } = &mut *state;
        let before = assignments.len();
        assignments.retain(|_, sender| !sender.borrow().is_finished());
        order.retain(|id| assignments.contains_key(id));
        before - assignments.len()
    }

    /// Stop the response listener and release the endpoint id.
    ///
    /// Dropping the router does the same.
    pub async fn shutdown(&self) {
        let handle = self.listener().take();
        if let Some(handle) = handle {
            handle.abort();
            self.bus.unregister(&self.config.endpoint_id).await;
            tracing::info!(endpoint_id = %self.config.endpoint_id, "Task router stopped");
        }
    }

    fn record_response(&self, message: &Message) {
        let Some(outcome) = TaskOutcome::from_message(message) else {
            tracing::warn!(from = %message.sender(), "Ignoring response without task outcome");
            return;
        };
        let task_id = message.correlation_id().unwrap_or(outcome.task_id);
        let success = outcome.success;
        if self.update(task_id, |assignment| assignment.finish(outcome)) {
            tracing::debug!(%task_id, from = %message.sender(), success, "Task finished");
        } else {
            tracing::warn!(%task_id, from = %message.sender(), "Response for unknown task");
        }
    }

    fn update(&self, task_id: Uuid, f: impl FnOnce(&mut TaskAssignment)) -> bool {
        match self.state().assignments.get(&task_id) {
            Some(sender) => {
                sender.send_modify(f);
                true
            }
            None => false,
        }
    }

    fn state(&self) -> MutexGuard<'_, RouterState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn listener(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for TaskRouter {
    fn drop(&mut self) {
        if let Some(handle) = self.listener().take() {
            handle.abort();
            self.bus.release(&self.config.endpoint_id);
        }
    }
}

async fn listen(router: Weak<TaskRouter>, mut endpoint: Endpoint) {
    while let Some(message) = endpoint.recv().await {
        let Some(router) = router.upgrade() else {
            break;
        };
        if message.kind() == MessageKind::Response {
            router.record_response(&message);
        } else {
            tracing::debug!(kind = %message.kind(), from = %message.sender(), "Ignoring message");
        }
    }
    tracing::debug!("Response listener stopped");
}
