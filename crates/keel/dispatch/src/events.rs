//! Domain events. Publishing is fire-and-forget: a failed publish is logged
//! by the caller and never changes an invocation's outcome.

use chrono::{DateTime, Utc};
use keel_types::{ActionId, TenantId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub id: String,
    /// e.g. `action.completed`, `action.denied`, or a handler-chosen name.
    pub name: String,
    pub tenant_id: TenantId,
    pub action_id: ActionId,
    pub invocation_id: String,
    pub payload: Value,
    pub occurred_at: DateTime<Utc>,
}

impl DomainEvent {
    pub fn new(
        name: impl Into<String>,
        tenant_id: TenantId,
        action_id: ActionId,
        invocation_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            tenant_id,
            action_id,
            invocation_id: invocation_id.into(),
            payload,
            occurred_at: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum EventError {
    #[error("event sink closed")]
    Closed,
    #[error("event sink failed: {0}")]
    Sink(String),
}

pub trait EventSink: Send + Sync {
    fn publish(&self, event: DomainEvent) -> Result<(), EventError>;
}

/// In-process fan-out over a tokio broadcast channel.
pub struct BroadcastEventSink {
    sender: broadcast::Sender<DomainEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.sender.subscribe()
    }
}

impl EventSink for BroadcastEventSink {
    fn publish(&self, event: DomainEvent) -> Result<(), EventError> {
        // No subscribers is not a failure.
        if self.sender.receiver_count() == 0 {
            return Ok(());
        }
        self.sender
            .send(event)
            .map(|_| ())
            .map_err(|_| EventError::Closed)
    }
}

/// Writes each event as a structured log line.
#[derive(Debug, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn publish(&self, event: DomainEvent) -> Result<(), EventError> {
        tracing::info!(
            target: "keel::events",
            event_id = %event.id,
            name = %event.name,
            tenant_id = %event.tenant_id,
            action_id = %event.action_id,
            invocation_id = %event.invocation_id,
            payload = %event.payload,
            "domain event"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let sink = BroadcastEventSink::new(8);
        let mut rx = sink.subscribe();
        sink.publish(DomainEvent::new(
            "action.completed",
            TenantId::new("t-1"),
            ActionId::new("accounting.create_journal_entry"),
            "inv-1",
            json!({}),
        ))
        .unwrap();
        assert_eq!(rx.recv().await.unwrap().name, "action.completed");
    }

    #[test]
    fn publishing_without_subscribers_succeeds() {
        let sink = BroadcastEventSink::new(8);
        let event = DomainEvent::new("x", TenantId::new("t"), ActionId::new("a.b"), "i", json!(null));
        assert!(sink.publish(event).is_ok());
    }
}
