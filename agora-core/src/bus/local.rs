//! In-process message bus
//!
//! Each registered participant gets an unbounded tokio channel as its
//! inbound queue. A single channel per recipient is what gives per-recipient
//! FIFO; registering an agent also spawns the task that drains its queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{RwLock, broadcast, mpsc};
use tracing::Instrument;

use super::{Endpoint, Message};
use crate::agent::{Agent, AgentInner};
use crate::config::BusConfig;
use crate::error::{AgoraError, Result};

enum Participant {
    /// Weak so that unregistering never keeps an agent alive
    Agent(Weak<AgentInner>),
    Endpoint,
}

struct Mailbox {
    participant: Participant,
    sender: mpsc::UnboundedSender<Message>,
}

#[derive(Default)]
struct Registry {
    mailboxes: HashMap<String, Mailbox>,
    /// Agent ids in registration order
    agent_order: Vec<String>,
}

impl Registry {
    fn remove(&mut self, id: &str) -> Option<Mailbox> {
        let mailbox = self.mailboxes.remove(id)?;
        if matches!(mailbox.participant, Participant::Agent(_)) {
            self.agent_order.retain(|existing| existing != id);
        }
        Some(mailbox)
    }
}

/// Delivery counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    /// Point-to-point messages queued
    pub sent: u64,
    /// Broadcasts issued
    pub broadcasts: u64,
    /// Copies queued by broadcasts
    pub broadcast_deliveries: u64,
    /// Sends rejected for an unknown or closed recipient
    pub undeliverable: u64,
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    broadcasts: AtomicU64,
    broadcast_deliveries: AtomicU64,
    undeliverable: AtomicU64,
}

struct BusInner {
    registry: RwLock<Registry>,
    tap: broadcast::Sender<Message>,
    counters: Counters,
}

/// Agent registry plus point-to-point and broadcast delivery.
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("stats", &self.stats())
            .finish()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus {
    /// Create a bus with default configuration
    pub fn new() -> Self {
        Self::with_config(&BusConfig::default())
    }

    pub fn with_config(config: &BusConfig) -> Self {
        let (tap, _) = broadcast::channel(config.tap_capacity.max(1));
        Self {
            inner: Arc::new(BusInner {
                registry: RwLock::new(Registry::default()),
                tap,
                counters: Counters::default(),
            }),
        }
    }

    /// Register an agent and start processing its inbound queue.
    ///
    /// Registering the same agent again is a no-op. Another participant
    /// already using the id yields `AlreadyRegistered`.
    pub async fn register(&self, agent: &Agent) -> Result<()> {
        let mut registry = self.inner.registry.write().await;

        if let Some(existing) = registry.mailboxes.get(agent.id()) {
            return match &existing.participant {
                Participant::Agent(weak) if weak.ptr_eq(&agent.downgrade()) => Ok(()),
                _ => Err(AgoraError::AlreadyRegistered(agent.id().to_string())),
            };
        }

        let (sender, inbox) = mpsc::unbounded_channel();
        registry.mailboxes.insert(
            agent.id().to_string(),
            Mailbox {
                participant: Participant::Agent(agent.downgrade()),
                sender,
            },
        );
        registry.agent_order.push(agent.id().to_string());
        drop(registry);

        let span = tracing::info_span!("agent", agent_id = %agent.id());
        tokio::spawn(agent.clone().run(inbox).instrument(span));

        tracing::info!(agent_id = %agent.id(), "Registered agent");
        Ok(())
    }

    /// Open a non-agent mailbox under `id`
    pub async fn open_endpoint(&self, id: impl Into<String>) -> Result<Endpoint> {
        let id = id.into();
        let mut registry = self.inner.registry.write().await;
        if registry.mailboxes.contains_key(&id) {
            return Err(AgoraError::AlreadyRegistered(id));
        }

        let (sender, inbox) = mpsc::unbounded_channel();
        registry.mailboxes.insert(
            id.clone(),
            Mailbox {
                participant: Participant::Endpoint,
                sender,
            },
        );
        tracing::debug!(endpoint_id = %id, "Opened endpoint");
        Ok(Endpoint::new(id, inbox))
    }

    /// Remove an agent or endpoint; returns false (and does nothing) if absent.
    ///
    /// An agent finishes the messages already queued before its loop stops.
    pub async fn unregister(&self, id: &str) -> bool {
        let removed = self.inner.registry.write().await.remove(id);
        match removed {
            Some(_) => {
                tracing::info!(participant_id = %id, "Unregistered participant");
                true
            }
            None => false,
        }
    }

    /// Remove `id` without awaiting, for callers that cannot await such as `Drop`.
    ///
    /// When the registry is busy the removal is handed to the runtime; outside
    /// a runtime it is skipped.
    pub(crate) fn release(&self, id: &str) {
        if let Ok(mut registry) = self.inner.registry.try_write() {
            if registry.remove(id).is_some() {
                tracing::info!(participant_id = %id, "Released participant");
            }
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let bus = self.clone();
                let id = id.to_string();
                runtime.spawn(async move {
                    bus.unregister(&id).await;
                });
            }
            Err(_) => tracing::warn!(participant_id = %id, "No runtime to release participant"),
        }
    }

    /// Queue `message` for its recipient
    pub async fn send(&self, message: Message) -> Result<()> {
        let Some(recipient) = message.recipient().map(str::to_string) else {
            self.inner.counters.undeliverable.fetch_add(1, Ordering::Relaxed);
            return Err(AgoraError::UnknownRecipient(
                "message has no recipient".to_string(),
            ));
        };

        let registry = self.inner.registry.read().await;
        let Some(mailbox) = registry.mailboxes.get(&recipient) else {
            self.inner.counters.undeliverable.fetch_add(1, Ordering::Relaxed);
            return Err(AgoraError::UnknownRecipient(recipient));
        };

        tracing::debug!(
            kind = %message.kind(),
            from = %message.sender(),
            to = %recipient,
            message_id = %message.id(),
            "Sending message"
        );
        if mailbox.sender.send(message).is_err() {
            self.inner.counters.undeliverable.fetch_add(1, Ordering::Relaxed);
            return Err(AgoraError::UnknownRecipient(recipient));
        }
        self.inner.counters.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Queue a copy of `message` for every registered agent except its sender.
    ///
    /// Subscribers see the message before any agent can react to it. Returns
    /// how many agents the message was queued for.
    pub async fn broadcast(&self, message: Message) -> Result<usize> {
        let registry = self.inner.registry.read().await;
        // No observers is fine
        let _ = self.inner.tap.send(message.clone());
        let mut delivered = 0usize;

        for id in registry.agent_order.iter().filter(|id| *id != message.sender()) {
            let Some(mailbox) = registry.mailboxes.get(id) else {
                continue;
            };
            if mailbox.sender.send(message.clone()).is_ok() {
                delivered += 1;
            } else {
                tracing::warn!(agent_id = %id, "Agent inbox closed, skipping broadcast copy");
            }
        }
        drop(registry);

        tracing::debug!(
            kind = %message.kind(),
            from = %message.sender(),
            delivered,
            "Broadcast message"
        );
        self.inner.counters.broadcasts.fetch_add(1, Ordering::Relaxed);
        self.inner
            .counters
            .broadcast_deliveries
            .fetch_add(delivered as u64, Ordering::Relaxed);
        Ok(delivered)
    }

    /// Observe every broadcast issued after this call
    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.inner.tap.subscribe()
    }

    /// Number of registered agents (endpoints excluded)
    pub async fn agent_count(&self) -> usize {
        self.inner.registry.read().await.agent_order.len()
    }

    /// Registered agent ids in registration order
    pub async fn agent_ids(&self) -> Vec<String> {
        self.inner.registry.read().await.agent_order.clone()
    }

    /// Whether an agent or endpoint is registered under `id`
    pub async fn is_registered(&self, id: &str) -> bool {
        self.inner.registry.read().await.mailboxes.contains_key(id)
    }

    /// Look up a registered agent
    pub async fn agent(&self, id: &str) -> Option<Agent> {
        let registry = self.inner.registry.read().await;
        match &registry.mailboxes.get(id)?.participant {
            Participant::Agent(weak) => weak.upgrade().map(Agent::from_inner),
            Participant::Endpoint => None,
        }
    }

    pub fn stats(&self) -> BusStats {
        let counters = &self.inner.counters;
        BusStats {
            sent: counters.sent.load(Ordering::Relaxed),
            broadcasts: counters.broadcasts.load(Ordering::Relaxed),
            broadcast_deliveries: counters.broadcast_deliveries.load(Ordering::Relaxed),
            undeliverable: counters.undeliverable.load(Ordering::Relaxed),
        }
    }
}
