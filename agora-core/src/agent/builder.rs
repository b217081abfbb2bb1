//! Builder for agents

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Duration;
use tokio::sync::RwLock;

use super::{Agent, AgentInner, AgentState, CapabilityDispatcher, Role, TaskHandler, VotePolicy};
use crate::bus::MessageBus;
use crate::config::MemoryConfig;
use crate::consensus::ConsensusCoordinator;
use crate::error::{AgoraError, Result};
use crate::knowledge::SharedKnowledgeGraph;
use crate::memory::{MemoryStore, PersistenceSink};

/// Builder for [`Agent`]
pub struct AgentBuilder {
    id: Option<String>,
    role: Option<Role>,
    /// Preset name that matched no built-in role; reported by `build`
    unknown_preset: Option<String>,
    capabilities: BTreeSet<String>,
    handler: Option<Arc<dyn TaskHandler>>,
    memory: MemoryConfig,
    long_term_sink: Option<Arc<dyn PersistenceSink>>,
    knowledge: Option<SharedKnowledgeGraph>,
    bus: Option<MessageBus>,
    coordinator: Option<Arc<ConsensusCoordinator>>,
    vote_policy: Option<Arc<dyn VotePolicy>>,
}

impl AgentBuilder {
    pub fn new() -> Self {
        Self {
            id: None,
            role: None,
            unknown_preset: None,
            capabilities: BTreeSet::new(),
            handler: None,
            memory: MemoryConfig::default(),
            long_term_sink: None,
            knowledge: None,
            bus: None,
            coordinator: None,
            vote_policy: None,
        }
    }

    /// Set agent ID
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Play `role`; its capabilities join the agent's
    pub fn role(mut self, role: Role) -> Self {
        self.capabilities.extend(role.capabilities.iter().cloned());
        self.role = Some(role);
        self
    }

    /// Play the built-in role named `name` (see [`Role::preset`])
    pub fn preset(self, name: &str) -> Self {
        match Role::preset(name) {
            Some(role) => self.role(role),
            None => Self {
                unknown_preset: Some(name.to_string()),
                ..self
            },
        }
    }

    /// Advertise a capability
    pub fn capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    /// Advertise several capabilities
    pub fn capabilities(mut self, capabilities: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.capabilities
            .extend(capabilities.into_iter().map(Into::into));
        self
    }

    /// Set the task handler
    pub fn handler(mut self, handler: Arc<dyn TaskHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Use a dispatcher as handler and advertise every capability it handles
    pub fn dispatcher(mut self, dispatcher: CapabilityDispatcher) -> Self {
        self.capabilities
            .extend(dispatcher.capabilities().map(str::to_string));
        self.handler = Some(Arc::new(dispatcher));
        self
    }

    /// Apply memory configuration
    pub fn memory_config(mut self, config: MemoryConfig) -> Self {
        self.memory = config;
        self
    }

    /// Bound the short-term store
    pub fn short_term_capacity(mut self, max_size: usize) -> Self {
        self.memory.short_term_max_size = max_size;
        self
    }

    /// Default TTL of the short-term store
    pub fn short_term_ttl(mut self, ttl: Duration) -> Self {
        self.memory.default_ttl = Some(ttl);
        self
    }

    /// Mirror long-term memory to `sink`
    pub fn long_term_sink(mut self, sink: Arc<dyn PersistenceSink>) -> Self {
        self.long_term_sink = Some(sink);
        self
    }

    /// Share a knowledge graph with the agent
    pub fn knowledge(mut self, graph: SharedKnowledgeGraph) -> Self {
        self.knowledge = Some(graph);
        self
    }

    /// Bus the agent replies and sends on
    pub fn bus(mut self, bus: MessageBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Coordinator the agent votes through
    pub fn coordinator(mut self, coordinator: Arc<ConsensusCoordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    /// How the agent votes on proposals
    pub fn vote_policy(mut self, policy: Arc<dyn VotePolicy>) -> Self {
        self.vote_policy = Some(policy);
        self
    }

    /// Build the agent without registering it
    pub async fn build(self) -> Result<Agent> {
        let id = self
            .id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| AgoraError::Configuration("Agent ID is required".to_string()))?;
        let handler = self.handler.ok_or_else(|| {
            AgoraError::Configuration(format!("Agent {} needs a task handler", id))
        })?;
        let bus = self
            .bus
            .ok_or_else(|| AgoraError::Configuration(format!("Agent {} needs a bus", id)))?;
        if let Some(name) = self.unknown_preset {
            return Err(AgoraError::Configuration(format!(
                "Unknown role preset for agent {}: {}",
                id, name
            )));
        }
        if self.memory.short_term_max_size == 0 {
            return Err(AgoraError::Configuration(
                "short-term memory capacity must be at least 1".to_string(),
            ));
        }

        let short_term = MemoryStore::short_term_from_config(&self.memory);
        let long_term = match self.long_term_sink {
            Some(sink) => MemoryStore::long_term_with_sink(sink).await,
            None => MemoryStore::long_term(),
        };

        Ok(Agent::from_inner(Arc::new(AgentInner {
            id,
            role: self.role,
            capabilities: self.capabilities,
            handler,
            short_term,
            long_term,
            knowledge: self.knowledge,
            bus,
            coordinator: self.coordinator,
            vote_policy: self.vote_policy,
            state: RwLock::new(AgentState::default()),
            tasks_handled: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            run_lock: tokio::sync::Mutex::new(()),
        })))
    }

    /// Build the agent and register it on its bus
    pub async fn spawn(self) -> Result<Agent> {
        let agent = self.build().await?;
        agent.bus().register(&agent).await?;
        Ok(agent)
    }
}

impl Default for AgentBuilder {
    fn default() -> Self {
        Self::new()
    }
}
