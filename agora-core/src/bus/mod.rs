//! Message bus for agent coordination
//!
//! The bus keeps the registry of agents and endpoints and delivers
//! [`Message`]s to their inbound queues:
//!
//! - `send`: exactly one recipient, FIFO per recipient
//! - `broadcast`: every registered agent except the sender
//!
//! Delivery is fire-and-forget. A call returns once the message is queued;
//! the recipient processes it later on its own task.

mod endpoint;
mod local;
mod message;

pub use endpoint::Endpoint;
pub use local::{BusStats, MessageBus};
pub use message::{Message, MessageKind, Priority};
