//! Persist-then-fan-out of messages produced by live connections.

use crate::registry::ConnectionRegistry;
use chatline_messages::{CreateMessageParams, MessageStore, MessageWithSender};
use chatline_types::{DeliveryEnvelope, MessageId, UserId};
use std::sync::Arc;

/// What happened to one envelope push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Queued on the recipient's live connection.
    Delivered,
    /// The recipient has no live connection.
    Offline,
    /// The recipient was online but the push failed.
    Failed,
}

/// Result of routing one message. Used for logging and tests only; nothing
/// here is reported back to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteReport {
    /// Persistence failed; nothing was pushed.
    NotPersisted,
    Routed {
        message_id: MessageId,
        receiver: Delivery,
        sender: Delivery,
    },
}

/// Persists each message and pushes it to the receiver and back to the
/// sender, best effort, with no retries and no queueing for offline users.
#[derive(Clone)]
pub struct MessageRouter {
    registry: ConnectionRegistry,
    store: Arc<dyn MessageStore>,
}

impl MessageRouter {
    pub fn new(registry: ConnectionRegistry, store: Arc<dyn MessageStore>) -> Self {
        Self { registry, store }
    }

    /// Persists `params`, then pushes the receiver's envelope followed by the
    /// sender's echo. Runs inline in the calling session's task.
    pub async fn route(&self, params: CreateMessageParams) -> RouteReport {
        let sender_id = params.sender_id;
        let receiver_id = params.receiver_id;

        let stored = match self.persist(params).await {
            Some(stored) => stored,
            None => return RouteReport::NotPersisted,
        };
        let message_id = stored.message.id;

        let receiver = self.deliver(receiver_id, &stored.envelope(false));
        let sender = self.deliver(sender_id, &stored.envelope(true));

        tracing::debug!(
            message_id,
            sender_id,
            receiver_id,
            receiver_delivery = ?receiver,
            sender_delivery = ?sender,
            "message routed"
        );

        RouteReport::Routed {
            message_id,
            receiver,
            sender,
        }
    }

    async fn persist(&self, params: CreateMessageParams) -> Option<MessageWithSender> {
        let store = self.store.clone();
        let sender_id = params.sender_id;
        let receiver_id = params.receiver_id;

        match tokio::task::spawn_blocking(move || store.create_message(&params)).await {
            Ok(Ok(stored)) => Some(stored),
            Ok(Err(e)) => {
                tracing::error!(sender_id, receiver_id, "failed to save message: {}", e);
                None
            }
            Err(e) => {
                tracing::error!(sender_id, receiver_id, "save message task join error: {}", e);
                None
            }
        }
    }

    fn deliver(&self, user_id: UserId, envelope: &DeliveryEnvelope) -> Delivery {
        let Some(handle) = self.registry.lookup(user_id) else {
            tracing::debug!(
                user_id,
                message_id = envelope.id,
                is_self = envelope.is_self,
                "recipient is not online"
            );
            return Delivery::Offline;
        };

        let frame = match serde_json::to_string(envelope) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(message_id = envelope.id, "failed to serialize envelope: {}", e);
                return Delivery::Failed;
            }
        };

        match handle.push(frame) {
            Ok(()) => Delivery::Delivered,
            Err(e) => {
                tracing::warn!(
                    user_id,
                    message_id = envelope.id,
                    is_self = envelope.is_self,
                    "failed to push message: {}",
                    e
                );
                Delivery::Failed
            }
        }
    }
}
