//! UI notifications
//!
//! The orchestrator publishes named events on a broadcast channel. Any number
//! of UI observers can subscribe; a slow observer only loses its own backlog.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::document::Document;
use crate::error::ErrorCode;
use crate::models::EntityType;
use crate::subscriptions::SubscriptionKey;

const EVENT_CAPACITY: usize = 256;

/// Something the UI may want to react to
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum SyncEvent {
    /// A mirror's view changed; `items` is the full updated slice
    #[serde(rename_all = "camelCase")]
    EntityUpdated {
        entity: EntityType,
        key: SubscriptionKey,
        items: Vec<Document>,
    },
    #[serde(rename_all = "camelCase")]
    SyncStatusChanged { is_online: bool, queue_length: usize },
    /// A mutation was rejected and rolled back
    #[serde(rename_all = "camelCase")]
    MutationFailed {
        mutation_id: Uuid,
        entity: EntityType,
        code: ErrorCode,
        message: String,
    },
    /// A mutation ran out of retries and was rolled back
    #[serde(rename_all = "camelCase")]
    MutationDeadLettered {
        mutation_id: Uuid,
        entity: EntityType,
        attempts: u32,
    },
    /// A queued mutation was dropped because the remote version won
    #[serde(rename_all = "camelCase")]
    MutationSuperseded {
        mutation_id: Uuid,
        entity: EntityType,
        entity_id: String,
    },
    #[serde(rename_all = "camelCase")]
    SubscriptionFailed {
        key: SubscriptionKey,
        code: ErrorCode,
        message: String,
    },
}

impl SyncEvent {
    /// Event name as seen by UI listeners (e.g. `appointmentUpdated`)
    pub fn name(&self) -> String {
        match self {
            SyncEvent::EntityUpdated { entity, .. } => entity.updated_event_name(),
            SyncEvent::SyncStatusChanged { .. } => "syncStatusChanged".to_string(),
            SyncEvent::MutationFailed { .. } => "mutationFailed".to_string(),
            SyncEvent::MutationDeadLettered { .. } => "mutationDeadLettered".to_string(),
            SyncEvent::MutationSuperseded { .. } => "mutationSuperseded".to_string(),
            SyncEvent::SubscriptionFailed { .. } => "subscriptionFailed".to_string(),
        }
    }
}

/// Broadcast bus for [`SyncEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    /// Publish an event; having no listeners is fine
    pub fn emit(&self, event: SyncEvent) {
        debug!("Event {}", event.name());
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
