//! Collaborator interfaces
//!
//! The hosted document store and identity provider live outside this crate.
//! The sync core talks to them only through the traits defined here:
//!
//! - [`RemoteChannel`]: point writes, point reads and live queries
//! - [`IdentityProvider`]: the signed-in user and its changes
//!
//! [`MemoryRemote`] and [`IdentityCell`] are in-process implementations of
//! both, used by the orchestrator and integration tests.
//!
//! Live query results arrive as [`Delivery`] values on a single channel owned
//! by the orchestrator, tagged with the subscription key and generation.

pub mod memory;

use std::fmt;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::document::Document;
use crate::error::RemoteError;
use crate::models::{EntityType, Identity, MutationAction};
use crate::subscriptions::SubscriptionKey;

pub use memory::MemoryRemote;

/// Sort direction of a live query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// Filter, ordering and limit of a live query
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryDescriptor {
    /// Equality filters, all of which must hold
    pub filters: Vec<(String, Value)>,
    pub order_by: Option<(String, SortDirection)>,
    pub limit: Option<usize>,
}

impl QueryDescriptor {
    /// Query matching every entity
    pub fn all() -> Self {
        Self::default()
    }

    pub fn filter(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push((field.into(), value.into()));
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.order_by = Some((field.into(), direction));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether a document satisfies every filter
    pub fn matches(&self, doc: &Document) -> bool {
        self.filters
            .iter()
            .all(|(field, value)| doc.get(field) == Some(value))
    }
}

/// Kind of change carried by a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Full result set, replaces everything known for the subscription
    Snapshot,
    Added,
    Modified,
    /// Items carry at least their id
    Removed,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChangeKind::Snapshot => "snapshot",
            ChangeKind::Added => "added",
            ChangeKind::Modified => "modified",
            ChangeKind::Removed => "removed",
        };
        f.write_str(name)
    }
}

/// What a live query reported
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteEvent {
    Change {
        kind: ChangeKind,
        items: Vec<Document>,
    },
    Error(RemoteError),
}

/// A remote event tagged with the subscription that produced it
#[derive(Debug, Clone)]
pub struct Delivery {
    pub key: SubscriptionKey,
    pub generation: u64,
    pub event: RemoteEvent,
}

/// Where a [`RemoteChannel`] sends the results of one live query
#[derive(Debug, Clone)]
pub struct DeliverySink {
    tx: mpsc::UnboundedSender<Delivery>,
    key: SubscriptionKey,
    generation: u64,
}

impl DeliverySink {
    pub fn new(tx: mpsc::UnboundedSender<Delivery>, key: SubscriptionKey, generation: u64) -> Self {
        Self {
            tx,
            key,
            generation,
        }
    }

    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Send an event; returns false once the receiver is gone
    pub fn send(&self, event: RemoteEvent) -> bool {
        self.tx
            .send(Delivery {
                key: self.key.clone(),
                generation: self.generation,
                event,
            })
            .is_ok()
    }

    pub fn change(&self, kind: ChangeKind, items: Vec<Document>) -> bool {
        self.send(RemoteEvent::Change { kind, items })
    }

    pub fn error(&self, error: RemoteError) -> bool {
        self.send(RemoteEvent::Error(error))
    }
}

/// Stops a live query
///
/// The cancel action runs at most once: on [`CancelHandle::cancel`] or when
/// the handle is dropped.
pub struct CancelHandle {
    action: Option<Box<dyn FnOnce() + Send>>,
}

impl CancelHandle {
    pub fn new(action: impl FnOnce() + Send + 'static) -> Self {
        Self {
            action: Some(Box::new(action)),
        }
    }

    /// A handle with nothing to cancel
    pub fn noop() -> Self {
        Self { action: None }
    }

    pub fn cancel(&mut self) {
        if let Some(action) = self.action.take() {
            action();
        }
    }
}

impl Drop for CancelHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("pending", &self.action.is_some())
            .finish()
    }
}

/// The hosted document store
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    /// Apply one mutation
    ///
    /// Returns the entity id assigned by the store for creates.
    async fn write(
        &self,
        entity: EntityType,
        action: MutationAction,
        payload: &Document,
    ) -> Result<Option<String>, RemoteError>;

    /// Read one entity
    async fn read(&self, entity: EntityType, id: &str) -> Result<Option<Document>, RemoteError>;

    /// Start a live query; results go to `sink` until the handle is cancelled
    async fn watch(
        &self,
        entity: EntityType,
        query: &QueryDescriptor,
        sink: DeliverySink,
    ) -> Result<CancelHandle, RemoteError>;
}

/// Source of the signed-in identity
pub trait IdentityProvider: Send + Sync {
    fn current(&self) -> Option<Identity>;

    /// Receiver notified on every sign-in and sign-out
    fn subscribe(&self) -> watch::Receiver<Option<Identity>>;
}

/// Identity provider backed by a `watch` channel
#[derive(Debug, Clone)]
pub struct IdentityCell {
    state: watch::Sender<Option<Identity>>,
}

impl IdentityCell {
    pub fn new(initial: Option<Identity>) -> Self {
        let (state, _) = watch::channel(initial);
        Self { state }
    }

    pub fn signed_out() -> Self {
        Self::new(None)
    }

    pub fn sign_in(&self, identity: Identity) {
        self.state.send_replace(Some(identity));
    }

    pub fn sign_out(&self) {
        self.state.send_replace(None);
    }
}

impl IdentityProvider for IdentityCell {
    fn current(&self) -> Option<Identity> {
        self.state.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<Option<Identity>> {
        self.state.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::from_value;
    use crate::subscriptions::Scope;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_query_matches() {
        let query = QueryDescriptor::all()
            .filter("patientId", "p1")
            .order_by("appointmentDate", SortDirection::Ascending);

        let mine = from_value(json!({"id": "a1", "patientId": "p1"})).unwrap();
        let theirs = from_value(json!({"id": "a2", "patientId": "p2"})).unwrap();
        assert!(query.matches(&mine));
        assert!(!query.matches(&theirs));
        assert!(QueryDescriptor::all().matches(&theirs));
    }

    #[test]
    fn test_cancel_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut handle = CancelHandle::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        handle.cancel();
        handle.cancel();
        drop(handle);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_cancels() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        {
            let _handle = CancelHandle::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_sink_tags_deliveries() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let key = SubscriptionKey::new(EntityType::Payment, Scope::All);
        let sink = DeliverySink::new(tx, key.clone(), 7);

        assert!(sink.change(ChangeKind::Snapshot, Vec::new()));
        let delivery = rx.try_recv().unwrap();
        assert_eq!(delivery.key, key);
        assert_eq!(delivery.generation, 7);

        drop(rx);
        assert!(!sink.error(RemoteError::unavailable("gone")));
    }

    #[tokio::test]
    async fn test_identity_cell() {
        let cell = IdentityCell::signed_out();
        let mut rx = cell.subscribe();
        assert!(cell.current().is_none());

        cell.sign_in(Identity::new("u1"));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().as_ref().map(|i| i.user_id.as_str()), Some("u1"));

        cell.sign_out();
        assert!(cell.current().is_none());
    }
}
