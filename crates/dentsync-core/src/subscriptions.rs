//! Live query bookkeeping
//!
//! Exactly one live subscription exists per (entity type, scope). Watching a
//! key again cancels the previous handle before opening the new one, and
//! every handle gets a fresh generation number so deliveries still in flight
//! from a replaced handle can be recognized and dropped.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::RemoteError;
use crate::models::EntityType;
use crate::remote::{CancelHandle, Delivery, DeliverySink, QueryDescriptor, RemoteChannel, RemoteEvent};

/// The filter narrowing a subscription
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Scope {
    /// Every entity of the type
    All,
    /// Entities whose `field` equals `value`
    Equals { field: String, value: String },
}

impl Scope {
    pub fn equals(field: impl Into<String>, value: impl Into<String>) -> Self {
        Scope::Equals {
            field: field.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::All => f.write_str("all"),
            Scope::Equals { field, value } => write!(f, "{}={}", field, value),
        }
    }
}

/// Identity of a subscription
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionKey {
    pub entity: EntityType,
    pub scope: Scope,
}

impl SubscriptionKey {
    pub fn new(entity: EntityType, scope: Scope) -> Self {
        Self { entity, scope }
    }

    /// Persistence key of the mirror cache for this subscription
    pub fn storage_key(&self) -> String {
        format!("{}{}:{}", MIRROR_KEY_PREFIX, self.entity, self.scope)
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.entity, self.scope)
    }
}

/// Prefix shared by every persisted mirror cache
pub const MIRROR_KEY_PREFIX: &str = "mirror:";

/// Lifecycle of one subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Unsubscribed,
    /// Opened, waiting for the first delivery
    Subscribing,
    Active,
}

#[derive(Debug)]
struct SubscriptionHandle {
    state: SubscriptionState,
    cancel: CancelHandle,
    last_delivered_version: u64,
    generation: u64,
}

/// How a delivery should be treated
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryVerdict {
    /// Apply the change; `version` counts accepted deliveries for the key
    Apply { version: u64 },
    /// The subscription failed and has been torn down
    Failed(RemoteError),
    /// From a replaced or cancelled handle
    Stale,
}

/// One handle per subscription key
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    handles: HashMap<SubscriptionKey, SubscriptionHandle>,
    next_generation: u64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a live query for `key`, replacing any existing one
    ///
    /// Returns the generation of the new handle.
    pub async fn watch(
        &mut self,
        key: SubscriptionKey,
        query: &QueryDescriptor,
        remote: &dyn RemoteChannel,
        tx: &mpsc::UnboundedSender<Delivery>,
    ) -> Result<u64, RemoteError> {
        self.cancel(&key);

        self.next_generation += 1;
        let generation = self.next_generation;
        let sink = DeliverySink::new(tx.clone(), key.clone(), generation);

        match remote.watch(key.entity, query, sink).await {
            Ok(cancel) => {
                info!("Subscribed to {} (generation {})", key, generation);
                self.handles.insert(
                    key,
                    SubscriptionHandle {
                        state: SubscriptionState::Subscribing,
                        cancel,
                        last_delivered_version: 0,
                        generation,
                    },
                );
                Ok(generation)
            }
            Err(e) => {
                warn!("Failed to subscribe to {}: {}", key, e);
                Err(e)
            }
        }
    }

    /// Check a delivery against the live handle for its key
    pub fn accept(&mut self, delivery: &Delivery) -> DeliveryVerdict {
        let current = self
            .handles
            .get(&delivery.key)
            .map(|h| h.generation == delivery.generation)
            .unwrap_or(false);

        if !current {
            debug!(
                "Dropping stale delivery for {} (generation {})",
                delivery.key, delivery.generation
            );
            return DeliveryVerdict::Stale;
        }

        match &delivery.event {
            RemoteEvent::Error(e) => {
                warn!("Subscription {} failed: {}", delivery.key, e);
                if let Some(mut handle) = self.handles.remove(&delivery.key) {
                    handle.cancel.cancel();
                }
                DeliveryVerdict::Failed(e.clone())
            }
            RemoteEvent::Change { .. } => {
                let Some(handle) = self.handles.get_mut(&delivery.key) else {
                    return DeliveryVerdict::Stale;
                };
                if handle.state == SubscriptionState::Subscribing {
                    debug!("Subscription {} is active", delivery.key);
                }
                handle.state = SubscriptionState::Active;
                handle.last_delivered_version += 1;
                DeliveryVerdict::Apply {
                    version: handle.last_delivered_version,
                }
            }
        }
    }

    /// Cancel one subscription; returns false if none was live
    pub fn cancel(&mut self, key: &SubscriptionKey) -> bool {
        match self.handles.remove(key) {
            Some(mut handle) => {
                handle.cancel.cancel();
                debug!("Cancelled subscription {}", key);
                true
            }
            None => false,
        }
    }

    /// Cancel every subscription; returns how many were live
    pub fn cancel_all(&mut self) -> usize {
        let count = self.handles.len();
        for (_, mut handle) in self.handles.drain() {
            handle.cancel.cancel();
        }
        if count > 0 {
            info!("Cancelled {} subscription(s)", count);
        }
        count
    }

    pub fn state(&self, key: &SubscriptionKey) -> SubscriptionState {
        self.handles
            .get(key)
            .map(|h| h.state)
            .unwrap_or(SubscriptionState::Unsubscribed)
    }

    pub fn last_delivered_version(&self, key: &SubscriptionKey) -> u64 {
        self.handles
            .get(key)
            .map(|h| h.last_delivered_version)
            .unwrap_or(0)
    }

    /// Number of live handles (subscribing or active)
    pub fn active_count(&self) -> usize {
        self.handles.len()
    }

    /// Keys with a live handle
    pub fn keys(&self) -> Vec<SubscriptionKey> {
        let mut keys: Vec<_> = self.handles.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::remote::{ChangeKind, MemoryRemote};

    fn appointment_key(patient: &str) -> SubscriptionKey {
        SubscriptionKey::new(EntityType::Appointment, Scope::equals("patientId", patient))
    }

    #[test]
    fn test_key_display() {
        let key = appointment_key("p1");
        assert_eq!(key.to_string(), "appointment[patientId=p1]");
        assert_eq!(key.storage_key(), "mirror:appointment:patientId=p1");
        assert_eq!(
            SubscriptionKey::new(EntityType::Service, Scope::All).storage_key(),
            "mirror:service:all"
        );
    }

    #[tokio::test]
    async fn test_watch_twice_keeps_one_handle() {
        let remote = MemoryRemote::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut registry = SubscriptionRegistry::new();
        let key = appointment_key("p1");
        let query = QueryDescriptor::all().filter("patientId", "p1");

        let first = registry.watch(key.clone(), &query, &remote, &tx).await.unwrap();
        let second = registry.watch(key.clone(), &query, &remote, &tx).await.unwrap();

        assert_ne!(first, second);
        assert_eq!(registry.active_count(), 1);
        assert_eq!(remote.cancel_count(), 1);
        assert_eq!(registry.state(&key), SubscriptionState::Subscribing);
    }

    #[tokio::test]
    async fn test_stale_deliveries_are_dropped() {
        let remote = MemoryRemote::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut registry = SubscriptionRegistry::new();
        let key = appointment_key("p1");
        let query = QueryDescriptor::all();

        registry.watch(key.clone(), &query, &remote, &tx).await.unwrap();
        let old_sink = remote.watches()[0].sink.clone();
        registry.watch(key.clone(), &query, &remote, &tx).await.unwrap();
        let new_sink = remote.watches()[1].sink.clone();

        old_sink.change(ChangeKind::Snapshot, Vec::new());
        new_sink.change(ChangeKind::Snapshot, Vec::new());

        let stale = rx.recv().await.unwrap();
        assert_eq!(registry.accept(&stale), DeliveryVerdict::Stale);

        let fresh = rx.recv().await.unwrap();
        assert_eq!(registry.accept(&fresh), DeliveryVerdict::Apply { version: 1 });
        assert_eq!(registry.state(&key), SubscriptionState::Active);

        new_sink.change(ChangeKind::Added, Vec::new());
        let next = rx.recv().await.unwrap();
        assert_eq!(registry.accept(&next), DeliveryVerdict::Apply { version: 2 });
        assert_eq!(registry.last_delivered_version(&key), 2);
    }

    #[tokio::test]
    async fn test_error_unsubscribes() {
        let remote = MemoryRemote::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut registry = SubscriptionRegistry::new();
        let key = SubscriptionKey::new(EntityType::Service, Scope::All);

        registry
            .watch(key.clone(), &QueryDescriptor::all(), &remote, &tx)
            .await
            .unwrap();
        remote.watches()[0]
            .sink
            .error(RemoteError::new(ErrorCode::PermissionDenied, "rules"));

        let delivery = rx.recv().await.unwrap();
        assert!(matches!(
            registry.accept(&delivery),
            DeliveryVerdict::Failed(ref e) if e.code == ErrorCode::PermissionDenied
        ));
        assert_eq!(registry.state(&key), SubscriptionState::Unsubscribed);
        assert_eq!(remote.cancel_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_watch_leaves_key_unsubscribed() {
        let remote = MemoryRemote::new();
        remote.fail_next_watch(ErrorCode::Unauthenticated);
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut registry = SubscriptionRegistry::new();
        let key = appointment_key("p1");

        assert!(registry
            .watch(key.clone(), &QueryDescriptor::all(), &remote, &tx)
            .await
            .is_err());
        assert_eq!(registry.state(&key), SubscriptionState::Unsubscribed);
        assert_eq!(registry.active_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_all() {
        let remote = MemoryRemote::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut registry = SubscriptionRegistry::new();

        for patient in ["p1", "p2", "p3"] {
            registry
                .watch(appointment_key(patient), &QueryDescriptor::all(), &remote, &tx)
                .await
                .unwrap();
        }
        assert_eq!(registry.keys().len(), 3);
        assert_eq!(registry.cancel_all(), 3);
        assert_eq!(remote.cancel_count(), 3);
        assert_eq!(registry.active_count(), 0);
        assert!(!registry.cancel(&appointment_key("p1")));
    }
}
