//! EventHub - lifecycle event fan-out
//!
//! ## Responsibilities
//!
//! - Subscriber registration for the websocket layer
//! - Non-blocking publish of add/remove/update events
//!
//! Each subscriber gets its own unbounded buffer, so a slow consumer never
//! blocks the reconciliation loop. Delivery order within one subscriber
//! matches publish order; subscribers whose receiver is gone are pruned on
//! the next publish.

use crate::models::Event;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// EventHub instance
pub struct EventHub {
    subscribers: RwLock<HashMap<Uuid, mpsc::UnboundedSender<Event>>>,
}

impl EventHub {
    /// Create new EventHub
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a subscriber; returns its id and the receiving end
    pub async fn subscribe(&self) -> (Uuid, mpsc::UnboundedReceiver<Event>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.write().await.insert(id, tx);
        tracing::debug!(subscriber = %id, "subscriber registered");
        (id, rx)
    }

    /// Remove a subscriber
    pub async fn unsubscribe(&self, id: &Uuid) {
        if self.subscribers.write().await.remove(id).is_some() {
            tracing::debug!(subscriber = %id, "subscriber removed");
        }
    }

    /// Deliver an event to every subscriber without blocking the caller
    pub async fn publish(&self, event: Event) {
        let mut dead = Vec::new();
        {
            let subscribers = self.subscribers.read().await;
            tracing::debug!(
                name = ?event.name,
                path = %event.data.path,
                subscribers = subscribers.len(),
                "publishing event"
            );
            for (id, tx) in subscribers.iter() {
                if tx.send(event.clone()).is_err() {
                    dead.push(*id);
                }
            }
        }

        if !dead.is_empty() {
            let mut subscribers = self.subscribers.write().await;
            for id in dead {
                subscribers.remove(&id);
            }
        }
    }

    /// Current subscriber count
    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}
