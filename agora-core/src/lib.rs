//! # Agora - Coordination Core for Cooperating Agents
//!
//! Agora runs a set of in-process agents that share a message bus and
//! optionally a knowledge graph:
//! - Short-term (bounded, TTL) and long-term (optionally persisted) memory
//! - A typed knowledge graph with referential integrity
//! - Point-to-point and broadcast messaging with per-recipient FIFO
//! - A single agent runtime driven by pluggable task handlers
//! - Capability-based round-robin task routing
//! - Quorum consensus over proposals and votes
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use agora_core::prelude::*;
//! use serde_json::json;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let bus = MessageBus::new();
//!     let router = TaskRouter::start(bus.clone(), RouterConfig::default()).await?;
//!
//!     let agent = Agent::builder()
//!         .id("summarizer")
//!         .capability("summarize")
//!         .handler(handler_fn(|task| Box::pin(async move {
//!             Ok(json!({ "summary": task.payload }))
//!         })))
//!         .bus(bus.clone())
//!         .spawn()
//!         .await?;
//!     router.register_capabilities(agent.id(), ["summarize"]);
//!
//!     let assignment = router.submit(Task::new("summarize", json!("text"))).await?;
//!     let done = router
//!         .await_completion(assignment.task.id, Duration::from_secs(1))
//!         .await?;
//!     assert_eq!(done.status, AssignmentStatus::Completed);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **Bus** ([`bus`]): registry of agents and endpoints, one unbounded queue
//!   per recipient
//! - **Agents** ([`agent`]): one tokio task per registered agent draining its
//!   queue sequentially
//! - **Router** ([`router`]) and **Coordinator** ([`consensus`]): stateful
//!   services layered on the bus
//! - **Memory** ([`memory`]) and **Knowledge** ([`knowledge`]): shared state
//!   behind `Arc` handles with internal locking

pub mod agent;
pub mod bus;
pub mod config;
pub mod consensus;
pub mod error;
pub mod knowledge;
pub mod memory;
pub mod router;
pub mod telemetry;

/// Current library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::agent::{
        Agent, AgentBuilder, AgentQuery, AgentState, AgentStatus, ApproveAll,
        CapabilityDispatcher, RejectAll, Role, Task, TaskHandler, TaskOutcome, VotePolicy,
        handler_fn, vote_fn,
    };
    pub use crate::bus::{Endpoint, Message, MessageBus, MessageKind, Priority};
    pub use crate::config::{
        AgoraConfig, BusConfig, ConfigBuilder, ConsensusConfig, MemoryConfig, QuorumBasis, Ratio,
        RouterConfig,
    };
    pub use crate::consensus::{
        ConsensusCoordinator, ConsensusDecision, Proposal, ProposalOutcome, Tally, Vote,
        VoteOutcome,
    };
    pub use crate::error::{AgoraError, PersistenceWarning, Result};
    pub use crate::knowledge::{
        GraphSnapshot, KnowledgeEdge, KnowledgeGraph, KnowledgeNode, QueryPattern,
        SharedKnowledgeGraph,
    };
    pub use crate::memory::{
        InMemorySink, JsonFileSink, MemoryEntry, MemoryKind, MemoryStore, PersistenceSink,
    };
    pub use crate::router::{AssignmentStatus, TaskAssignment, TaskRouter};
}
