//! Agent runtime
//!
//! An [`Agent`] is a single runtime configured with an injected
//! [`TaskHandler`]; it owns a short-term and a long-term [`MemoryStore`],
//! may hold a shared knowledge graph, and talks to peers over the
//! [`MessageBus`].
//!
//! Once registered on a bus, the agent drains its inbound queue one message
//! at a time:
//!
//! - `TASK`: `idle → processing → idle | error`, then a RESPONSE to the sender
//! - `QUERY`: answered from memory or the knowledge graph, status unchanged
//! - `PROPOSAL`: handed to the coordinator, if any, and voted on when a
//!   [`VotePolicy`] is set
//! - `CONSENSUS_REACHED`: recorded in long-term memory
//! - `RESPONSE`: recorded in short-term memory
//!
//! # Example
//!
//! ```rust,ignore
//! let agent = Agent::builder()
//!     .id("greeter")
//!     .capability("greet")
//!     .handler(handler_fn(|task| Box::pin(async move {
//!         Ok(json!(format!("Hello, {}!", task.payload["name"])))
//!     })))
//!     .bus(bus.clone())
//!     .spawn()
//!     .await?;
//! ```

mod builder;
mod handler;
mod query;
mod vote;

pub use builder::AgentBuilder;
pub use handler::{CapabilityDispatcher, FnHandler, Task, TaskHandler, TaskOutcome, handler_fn};
pub use query::AgentQuery;
pub use vote::{ApproveAll, FnVotePolicy, RejectAll, VotePolicy, vote_fn};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::any::Any;
use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{RwLock, mpsc};

use crate::bus::{Message, MessageBus, MessageKind};
use crate::consensus::{ConsensusCoordinator, ConsensusDecision, Proposal, Vote};
use crate::error::{AgoraError, Result};
use crate::knowledge::SharedKnowledgeGraph;
use crate::memory::MemoryStore;

/// Agent status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Waiting for work
    Idle,

    /// Running a task handler
    Processing,

    /// The last task failed; cleared by the next successful task
    Error,
}

/// Agent state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub status: AgentStatus,

    /// Last status change
    pub last_active: DateTime<Utc>,

    /// Error text of the last failed task
    pub last_error: Option<String>,
}

impl Default for AgentState {
    fn default() -> Self {
        Self {
            status: AgentStatus::Idle,
            last_active: Utc::now(),
            last_error: None,
        }
    }
}

/// Named bundle of capabilities an agent plays
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    pub capabilities: Vec<String>,
    pub description: String,
}

impl Role {
    pub fn new(
        name: impl Into<String>,
        capabilities: impl IntoIterator<Item = impl Into<String>>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            description: description.into(),
        }
    }

    /// Names accepted by [`Role::preset`]
    pub const PRESETS: [&'static str; 3] = ["researcher", "assistant", "executor"];

    /// Built-in role by name
    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "researcher" => Some(Self::researcher()),
            "assistant" => Some(Self::assistant()),
            "executor" => Some(Self::executor()),
            _ => None,
        }
    }

    pub fn researcher() -> Self {
        Self::new(
            "researcher",
            ["research", "analyze", "summarize"],
            "Research specialist agent",
        )
    }

    pub fn assistant() -> Self {
        Self::new(
            "assistant",
            ["chat", "help", "explain"],
            "General purpose assistant agent",
        )
    }

    pub fn executor() -> Self {
        Self::new(
            "executor",
            ["execute", "monitor", "report"],
            "Task execution specialist",
        )
    }
}

pub(crate) struct AgentInner {
    id: String,
    role: Option<Role>,
    capabilities: BTreeSet<String>,
    handler: Arc<dyn TaskHandler>,
    short_term: MemoryStore,
    long_term: MemoryStore,
    knowledge: Option<SharedKnowledgeGraph>,
    bus: MessageBus,
    coordinator: Option<Arc<ConsensusCoordinator>>,
    vote_policy: Option<Arc<dyn VotePolicy>>,
    state: RwLock<AgentState>,
    tasks_handled: AtomicU64,
    error_count: AtomicU64,
    /// Held by the inbox loop so a re-registration waits for the old loop to drain
    run_lock: tokio::sync::Mutex<()>,
}

/// Handle to an agent; clones share the same agent
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.inner.id)
            .field("capabilities", &self.inner.capabilities)
            .finish()
    }
}

impl Agent {
    /// Create a new agent builder
    pub fn builder() -> AgentBuilder {
        AgentBuilder::new()
    }

    pub(crate) fn from_inner(inner: Arc<AgentInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<AgentInner> {
        Arc::downgrade(&self.inner)
    }

    /// Get agent ID
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn role(&self) -> Option<&Role> {
        self.inner.role.as_ref()
    }

    /// Advertised capabilities
    pub fn capabilities(&self) -> &BTreeSet<String> {
        &self.inner.capabilities
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.inner.capabilities.contains(capability)
    }

    pub fn short_term(&self) -> &MemoryStore {
        &self.inner.short_term
    }

    pub fn long_term(&self) -> &MemoryStore {
        &self.inner.long_term
    }

    /// Shared knowledge graph, if the agent holds one
    pub fn knowledge(&self) -> Option<&SharedKnowledgeGraph> {
        self.inner.knowledge.as_ref()
    }

    pub fn bus(&self) -> &MessageBus {
        &self.inner.bus
    }

    /// Get current agent state
    pub async fn state(&self) -> AgentState {
        self.inner.state.read().await.clone()
    }

    /// Get current agent status
    pub async fn status(&self) -> AgentStatus {
        self.inner.state.read().await.status
    }

    /// Tasks run through the handler so far
    pub fn tasks_handled(&self) -> u64 {
        self.inner.tasks_handled.load(Ordering::SeqCst)
    }

    /// Failed tasks so far
    pub fn error_count(&self) -> u64 {
        self.inner.error_count.load(Ordering::SeqCst)
    }

    /// Look `key` up in short-term memory, then long-term memory
    pub fn recall(&self, key: &str) -> Option<serde_json::Value> {
        self.inner
            .short_term
            .retrieve(key)
            .or_else(|| self.inner.long_term.retrieve(key))
    }

    /// Answer a query without touching status
    pub fn answer(&self, query: &AgentQuery) -> serde_json::Value {
        query.answer(self)
    }

    /// Send a message from this agent to `recipient`
    pub async fn send(
        &self,
        recipient: impl Into<String>,
        kind: MessageKind,
        payload: serde_json::Value,
    ) -> Result<()> {
        self.inner
            .bus
            .send(Message::new(kind, self.id(), payload).to(recipient))
            .await
    }

    /// Broadcast a message from this agent to every other agent
    pub async fn broadcast(&self, kind: MessageKind, payload: serde_json::Value) -> Result<usize> {
        self.inner
            .bus
            .broadcast(Message::new(kind, self.id(), payload))
            .await
    }

    /// Broadcast a PROPOSAL of `solution` for `problem_id` from this agent
    pub async fn propose(
        &self,
        problem_id: impl Into<String>,
        solution: serde_json::Value,
    ) -> Result<Proposal> {
        let proposal = Proposal {
            problem_id: problem_id.into(),
            solution,
            proposer: self.id().to_string(),
            created_at: Utc::now(),
        };
        self.broadcast(MessageKind::Proposal, serde_json::to_value(&proposal)?)
            .await?;
        Ok(proposal)
    }

    /// Broadcast this agent's VOTE on `problem_id`
    pub async fn cast_vote(&self, problem_id: impl Into<String>, approve: bool) -> Result<Vote> {
        let vote = Vote {
            problem_id: problem_id.into(),
            voter: self.id().to_string(),
            approve,
            cast_at: Utc::now(),
        };
        self.broadcast(MessageKind::Vote, serde_json::to_value(&vote)?)
            .await?;
        Ok(vote)
    }

    async fn set_status(&self, status: AgentStatus, error: Option<String>) {
        let mut state = self.inner.state.write().await;
        state.status = status;
        state.last_active = Utc::now();
        if error.is_some() {
            state.last_error = error;
        }
    }

    /// Drain the inbound queue until the bus drops its sender
    pub(crate) async fn run(self, mut inbox: mpsc::UnboundedReceiver<Message>) {
        let _serial = self.inner.run_lock.lock().await;
        tracing::debug!("Agent loop started");
        while let Some(message) = inbox.recv().await {
            self.handle_message(message).await;
        }
        tracing::debug!("Agent loop stopped");
    }

    /// Process one message as the inbox loop would.
    ///
    /// Exposed so that callers driving an agent without a bus loop (or tests)
    /// get the same behavior.
    pub async fn handle_message(&self, message: Message) {
        match message.kind() {
            MessageKind::Task => self.handle_task(message).await,
            MessageKind::Query => self.handle_query(message).await,
            MessageKind::Proposal => self.handle_proposal(message).await,
            MessageKind::ConsensusReached => self.record_consensus(message).await,
            MessageKind::Response => {
                let key = format!("response_{}", message.correlation_key());
                self.inner
                    .short_term
                    .store(key, message.into_payload(), None)
                    .await;
            }
            // Tallied by the coordinator's bus listener
            MessageKind::Vote => {
                tracing::trace!(from = %message.sender(), "Observed vote");
            }
        }
    }

    async fn handle_task(&self, message: Message) {
        let task = Task::from_message(&message);
        tracing::debug!(task_id = %task.id, capability = %task.required_capability, "Handling task");

        self.set_status(AgentStatus::Processing, None).await;
        // A panicking handler fails its task instead of killing the inbox loop
        let result = AssertUnwindSafe(self.inner.handler.handle(&task, self))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(anyhow::anyhow!("handler panicked: {}", panic_message(&*panic)))
            });
        self.inner.tasks_handled.fetch_add(1, Ordering::SeqCst);

        let outcome = match result {
            Ok(value) => {
                self.inner
                    .short_term
                    .store(format!("task_{}", task.id), value.clone(), None)
                    .await;
                self.set_status(AgentStatus::Idle, None).await;
                TaskOutcome::success(task.id, self.id(), value)
            }
            Err(err) => {
                let error = AgoraError::TaskHandler {
                    agent_id: self.id().to_string(),
                    message: format!("{err:#}"),
                };
                self.inner.error_count.fetch_add(1, Ordering::SeqCst);
                tracing::warn!(task_id = %task.id, %error, "Task failed");

                self.inner
                    .short_term
                    .store(
                        format!("error_{}", task.id),
                        json!({
                            "task": &task,
                            "error": error.to_string(),
                            "at": Utc::now(),
                        }),
                        None,
                    )
                    .await;
                self.set_status(AgentStatus::Error, Some(error.to_string())).await;
                TaskOutcome::failure(task.id, self.id(), error.to_string())
            }
        };

        match serde_json::to_value(&outcome) {
            Ok(payload) => self.reply(&message, payload).await,
            Err(e) => tracing::error!(task_id = %task.id, error = %e, "Could not encode task outcome"),
        }
    }

    async fn handle_query(&self, message: Message) {
        let payload = match serde_json::from_value::<AgentQuery>(message.payload().clone()) {
            Ok(query) => query.answer(self),
            Err(e) => json!({ "error": format!("Unsupported query: {}", e) }),
        };
        self.reply(&message, payload).await;
    }

    async fn handle_proposal(&self, message: Message) {
        let proposal = match serde_json::from_value::<Proposal>(message.payload().clone()) {
            Ok(proposal) => proposal,
            Err(e) => {
                tracing::warn!(from = %message.sender(), error = %e, "Ignoring malformed proposal");
                return;
            }
        };

        self.inner
            .short_term
            .store(
                format!("proposal_{}", proposal.problem_id),
                message.payload().clone(),
                None,
            )
            .await;

        let Some(coordinator) = &self.inner.coordinator else {
            return;
        };
        // Proposals broadcast by peers reach the coordinator this way too
        coordinator.observe_proposal(proposal.clone()).await;
        let Some(policy) = &self.inner.vote_policy else {
            return;
        };

        let decision = policy.decide(&proposal, self).await;
        match coordinator.vote(self.id(), &proposal.problem_id, decision).await {
            Ok(outcome) => {
                tracing::debug!(problem_id = %proposal.problem_id, decision, ?outcome, "Voted")
            }
            Err(e) => {
                tracing::warn!(problem_id = %proposal.problem_id, error = %e, "Vote rejected")
            }
        }
    }

    async fn record_consensus(&self, message: Message) {
        match serde_json::from_value::<ConsensusDecision>(message.payload().clone()) {
            Ok(decision) => {
                tracing::info!(problem_id = %decision.problem_id, "Consensus reached");
                self.inner
                    .long_term
                    .store(
                        format!("consensus_{}", decision.problem_id),
                        message.into_payload(),
                        None,
                    )
                    .await;
            }
            Err(e) => {
                tracing::warn!(from = %message.sender(), error = %e, "Ignoring malformed consensus")
            }
        }
    }

    async fn reply(&self, request: &Message, payload: serde_json::Value) {
        let reply = request.reply(MessageKind::Response, self.id(), payload);
        if let Err(e) = self.inner.bus.send(reply).await {
            tracing::warn!(to = %request.sender(), error = %e, "Could not deliver response");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[cfg(test)]
mod tests;
