//! Bus message format

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a message asks of its recipient
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    /// Work for the recipient's task handler
    Task,
    /// Reply to a task or query
    Response,
    /// Read-only question answered from memory or the knowledge graph
    Query,
    /// Candidate solution for a problem id
    Proposal,
    /// Decision on a proposal
    Vote,
    /// Quorum and majority were reached for a problem id
    ConsensusReached,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MessageKind::Task => "TASK",
            MessageKind::Response => "RESPONSE",
            MessageKind::Query => "QUERY",
            MessageKind::Proposal => "PROPOSAL",
            MessageKind::Vote => "VOTE",
            MessageKind::ConsensusReached => "CONSENSUS_REACHED",
        };
        f.write_str(name)
    }
}

/// Message priority.
///
/// Informational only: delivery stays FIFO per recipient.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Message exchanged over the bus.
///
/// Fields are read-only; the builder methods consume the message, so it
/// cannot change once handed to the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    id: Uuid,
    kind: MessageKind,
    sender: String,
    #[serde(default)]
    recipient: Option<String>,
    payload: serde_json::Value,
    #[serde(default)]
    priority: Priority,
    created_at: DateTime<Utc>,
    #[serde(default)]
    correlation_id: Option<Uuid>,
}

impl Message {
    /// Create a message without a recipient (suitable for broadcast)
    pub fn new(kind: MessageKind, sender: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            sender: sender.into(),
            recipient: None,
            payload,
            priority: Priority::Normal,
            created_at: Utc::now(),
            correlation_id: None,
        }
    }

    /// Address the message to one recipient
    pub fn to(mut self, recipient: impl Into<String>) -> Self {
        self.recipient = Some(recipient.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Tie the message to an earlier request
    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Build a reply addressed to this message's sender.
    ///
    /// The reply carries this message's correlation id, or its id when it
    /// has none.
    pub fn reply(
        &self,
        kind: MessageKind,
        sender: impl Into<String>,
        payload: serde_json::Value,
    ) -> Message {
        Message::new(kind, sender, payload)
            .to(self.sender.clone())
            .with_priority(self.priority)
            .with_correlation_id(self.correlation_key())
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    /// Recipient id, `None` for broadcasts
    pub fn recipient(&self) -> Option<&str> {
        self.recipient.as_deref()
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn correlation_id(&self) -> Option<Uuid> {
        self.correlation_id
    }

    /// Correlation id if set, otherwise the message id
    pub fn correlation_key(&self) -> Uuid {
        self.correlation_id.unwrap_or(self.id)
    }

    /// Take the payload out of the message
    pub fn into_payload(self) -> serde_json::Value {
        self.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reply_is_addressed_to_sender() {
        let request = Message::new(MessageKind::Query, "caller", json!({"key": "k"}))
            .to("agent_a")
            .with_priority(Priority::High);

        let reply = request.reply(MessageKind::Response, "agent_a", json!({"found": false}));
        assert_eq!(reply.recipient(), Some("caller"));
        assert_eq!(reply.sender(), "agent_a");
        assert_eq!(reply.correlation_id(), Some(request.id()));
        assert_eq!(reply.priority(), Priority::High);
    }

    #[test]
    fn test_reply_keeps_existing_correlation() {
        let task_id = Uuid::new_v4();
        let request = Message::new(MessageKind::Task, "router", json!({}))
            .to("agent_a")
            .with_correlation_id(task_id);

        let reply = request.reply(MessageKind::Response, "agent_a", json!({}));
        assert_eq!(reply.correlation_id(), Some(task_id));
    }

    #[test]
    fn test_kind_wire_names() {
        let json = serde_json::to_value(MessageKind::ConsensusReached).unwrap();
        assert_eq!(json, json!("CONSENSUS_REACHED"));
        assert_eq!(MessageKind::ConsensusReached.to_string(), "CONSENSUS_REACHED");
        assert_eq!(Priority::default(), Priority::Normal);
    }
}
