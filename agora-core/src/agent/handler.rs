//! Pluggable task handling
//!
//! An agent runs every TASK through one [`TaskHandler`]. Behavioral variants
//! are different handler implementations rather than agent subtypes:
//!
//! - [`FnHandler`] wraps an async closure
//! - [`CapabilityDispatcher`] picks a handler by the task's capability

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use super::Agent;
use crate::bus::Message;

/// Unit of work routed to an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,

    /// Capability an agent must advertise to receive the task
    pub required_capability: String,

    /// Task input
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Task {
    pub fn new(required_capability: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            required_capability: required_capability.into(),
            payload,
        }
    }

    /// Read the task carried by a TASK message.
    ///
    /// A payload that is not a serialized `Task` becomes the payload of a
    /// task without capability, identified by the message's correlation key.
    pub fn from_message(message: &Message) -> Self {
        serde_json::from_value(message.payload().clone()).unwrap_or_else(|_| Self {
            id: message.correlation_key(),
            required_capability: String::new(),
            payload: message.payload().clone(),
        })
    }
}

/// Result of a task, carried in the RESPONSE payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: Uuid,
    pub agent_id: String,
    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskOutcome {
    pub fn success(task_id: Uuid, agent_id: impl Into<String>, result: serde_json::Value) -> Self {
        Self {
            task_id,
            agent_id: agent_id.into(),
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(task_id: Uuid, agent_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            task_id,
            agent_id: agent_id.into(),
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }

    /// Parse the outcome carried by a RESPONSE message
    pub fn from_message(message: &Message) -> Option<Self> {
        serde_json::from_value(message.payload().clone()).ok()
    }
}

/// Domain logic invoked for each TASK an agent receives
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Execute `task` on behalf of `agent`.
    ///
    /// Errors are reported to the task's sender in a failed RESPONSE.
    async fn handle(&self, task: &Task, agent: &Agent) -> anyhow::Result<serde_json::Value>;
}

type HandlerFn = dyn Fn(Task) -> BoxFuture<'static, anyhow::Result<serde_json::Value>> + Send + Sync;

/// Handler backed by an async closure
pub struct FnHandler {
    f: Box<HandlerFn>,
}

impl FnHandler {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Task) -> BoxFuture<'static, anyhow::Result<serde_json::Value>> + Send + Sync + 'static,
    {
        Self { f: Box::new(f) }
    }
}

#[async_trait]
impl TaskHandler for FnHandler {
    async fn handle(&self, task: &Task, _agent: &Agent) -> anyhow::Result<serde_json::Value> {
        (self.f)(task.clone()).await
    }
}

/// Wrap an async closure as a shared handler
pub fn handler_fn<F>(f: F) -> Arc<dyn TaskHandler>
where
    F: Fn(Task) -> BoxFuture<'static, anyhow::Result<serde_json::Value>> + Send + Sync + 'static,
{
    Arc::new(FnHandler::new(f))
}

/// Routes each task to the handler registered for its capability
#[derive(Default, Clone)]
pub struct CapabilityDispatcher {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
    fallback: Option<Arc<dyn TaskHandler>>,
}

impl CapabilityDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle tasks requiring `capability` with `handler`
    pub fn on(mut self, capability: impl Into<String>, handler: Arc<dyn TaskHandler>) -> Self {
        self.handlers.insert(capability.into(), handler);
        self
    }

    /// Handle tasks no capability matched
    pub fn fallback(mut self, handler: Arc<dyn TaskHandler>) -> Self {
        self.fallback = Some(handler);
        self
    }

    /// Capabilities with a dedicated handler
    pub fn capabilities(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

#[async_trait]
impl TaskHandler for CapabilityDispatcher {
    async fn handle(&self, task: &Task, agent: &Agent) -> anyhow::Result<serde_json::Value> {
        match self
            .handlers
            .get(&task.required_capability)
            .or(self.fallback.as_ref())
        {
            Some(handler) => handler.handle(task, agent).await,
            None => anyhow::bail!("Unsupported task type: {}", task.required_capability),
        }
    }
}
