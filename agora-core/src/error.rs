//! Error types for Agora operations

use serde::{Deserialize, Serialize};

/// Result type for Agora operations
pub type Result<T> = std::result::Result<T, AgoraError>;

/// Error types for the coordination core
#[derive(Debug, thiserror::Error)]
pub enum AgoraError {
    /// An agent or endpoint with this id is already on the bus
    #[error("Already registered: {0}")]
    AlreadyRegistered(String),

    /// Point-to-point delivery to an id that is not on the bus
    #[error("Unknown recipient: {0}")]
    UnknownRecipient(String),

    /// No registered agent advertises the required capability
    #[error("No capable agent for capability: {0}")]
    NoCapableAgent(String),

    /// Knowledge graph already holds a node with this id
    #[error("Duplicate node: {0}")]
    DuplicateNode(String),

    /// Edge endpoint does not exist in the knowledge graph
    #[error("Dangling reference: edge {source_id} -> {target_id} references missing node {missing}")]
    DanglingReference {
        source_id: String,
        target_id: String,
        missing: String,
    },

    /// A task handler failed
    #[error("Task handler error in agent {agent_id}: {message}")]
    TaskHandler { agent_id: String, message: String },

    /// Vote cast for a problem nobody proposed
    #[error("Unknown problem: {0}")]
    UnknownProblem(String),

    /// Vote from an id outside the problem's electorate of registered agents
    #[error("Ineligible voter: {0}")]
    IneligibleVoter(String),

    /// Persistence sink failure (surfaced by sinks, recovered by stores)
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<String> for AgoraError {
    fn from(s: String) -> Self {
        AgoraError::Other(s)
    }
}

impl From<&str> for AgoraError {
    fn from(s: &str) -> Self {
        AgoraError::Other(s.to_string())
    }
}

impl From<anyhow::Error> for AgoraError {
    fn from(err: anyhow::Error) -> Self {
        AgoraError::Other(err.to_string())
    }
}

/// Which persistence operation produced a warning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceOp {
    Load,
    Save,
    Remove,
}

/// Non-fatal persistence failure.
///
/// Stores keep operating in memory when their sink fails; the condition is
/// reported through this value instead of an `Err`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistenceWarning {
    /// Operation that failed
    pub op: PersistenceOp,

    /// Key involved, if any
    pub key: Option<String>,

    /// Error text from the sink
    pub message: String,

    /// When the failure was observed
    pub at: chrono::DateTime<chrono::Utc>,
}

impl PersistenceWarning {
    pub(crate) fn new(op: PersistenceOp, key: Option<&str>, err: &AgoraError) -> Self {
        Self {
            op,
            key: key.map(str::to_string),
            message: err.to_string(),
            at: chrono::Utc::now(),
        }
    }
}

impl std::fmt::Display for PersistenceWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.key {
            Some(key) => write!(f, "persistence {:?} failed for {}: {}", self.op, key, self.message),
            None => write!(f, "persistence {:?} failed: {}", self.op, self.message),
        }
    }
}
