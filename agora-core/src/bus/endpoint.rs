//! Non-agent mailboxes

use std::time::Duration;
use tokio::sync::mpsc;

use super::Message;

/// Mailbox for a participant that is not an agent (router, external caller).
///
/// Endpoints receive point-to-point messages only; they are skipped by
/// broadcasts and not counted as agents. Dropping an endpoint closes its
/// queue; `MessageBus::unregister` frees the id.
#[derive(Debug)]
pub struct Endpoint {
    id: String,
    inbox: mpsc::UnboundedReceiver<Message>,
}

impl Endpoint {
    pub(crate) fn new(id: String, inbox: mpsc::UnboundedReceiver<Message>) -> Self {
        Self { id, inbox }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the next message; `None` once the endpoint is unregistered
    pub async fn recv(&mut self) -> Option<Message> {
        self.inbox.recv().await
    }

    /// Wait at most `timeout` for the next message
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<Message> {
        tokio::time::timeout(timeout, self.inbox.recv())
            .await
            .ok()
            .flatten()
    }

    /// Take a queued message without waiting
    pub fn try_recv(&mut self) -> Option<Message> {
        self.inbox.try_recv().ok()
    }
}
