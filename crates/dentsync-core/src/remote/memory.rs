//! In-process remote store
//!
//! A [`RemoteChannel`] that keeps documents in memory. It records every
//! write, can be scripted to fail, and exposes the sinks of its live queries
//! so callers can push deliveries by hand. With [`MemoryRemote::live`] it
//! also behaves like the hosted store: new watches get an initial snapshot
//! and successful writes are echoed to matching watches.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::{CancelHandle, ChangeKind, DeliverySink, QueryDescriptor, RemoteChannel};
use crate::document::{document_id, is_provisional_id, overlay, Document, ID_FIELD};
use crate::error::{ErrorCode, RemoteError};
use crate::models::{EntityType, MutationAction};

/// One recorded call to [`RemoteChannel::write`]
#[derive(Debug, Clone, PartialEq)]
pub struct WriteCall {
    pub entity: EntityType,
    pub action: MutationAction,
    pub payload: Document,
}

/// One live query opened through [`RemoteChannel::watch`]
#[derive(Debug, Clone)]
pub struct WatchCall {
    pub entity: EntityType,
    pub query: QueryDescriptor,
    pub sink: DeliverySink,
    cancelled: Arc<AtomicBool>,
}

impl WatchCall {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct Inner {
    documents: HashMap<EntityType, BTreeMap<String, Document>>,
    writes: Vec<WriteCall>,
    reads: Vec<(EntityType, String)>,
    write_results: VecDeque<Result<Option<String>, RemoteError>>,
    read_failures: VecDeque<RemoteError>,
    watch_failures: VecDeque<RemoteError>,
    watches: Vec<WatchCall>,
    next_id: u64,
}

/// In-memory document store
#[derive(Clone, Default)]
pub struct MemoryRemote {
    inner: Arc<Mutex<Inner>>,
    cancels: Arc<AtomicUsize>,
    live: bool,
    write_delay: Option<Duration>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver initial snapshots and echo writes to matching watches
    pub fn live(mut self) -> Self {
        self.live = true;
        self
    }

    /// Delay every write (to exercise in-flight behavior)
    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = Some(delay);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store a document directly
    pub fn insert(&self, entity: EntityType, doc: Document) {
        if let Some(id) = document_id(&doc).map(str::to_string) {
            self.lock().documents.entry(entity).or_default().insert(id, doc);
        }
    }

    pub fn document(&self, entity: EntityType, id: &str) -> Option<Document> {
        self.lock()
            .documents
            .get(&entity)
            .and_then(|docs| docs.get(id))
            .cloned()
    }

    /// Script the outcome of the next write (queued, one per call)
    pub fn push_write_result(&self, result: Result<Option<String>, RemoteError>) {
        self.lock().write_results.push_back(result);
    }

    /// Make the next write fail with `code`
    pub fn fail_next_write(&self, code: ErrorCode) {
        self.push_write_result(Err(RemoteError::new(code, "scripted failure")));
    }

    pub fn fail_next_read(&self, code: ErrorCode) {
        self.lock()
            .read_failures
            .push_back(RemoteError::new(code, "scripted failure"));
    }

    pub fn fail_next_watch(&self, code: ErrorCode) {
        self.lock()
            .watch_failures
            .push_back(RemoteError::new(code, "scripted failure"));
    }

    /// Every write attempted so far, in call order
    pub fn writes(&self) -> Vec<WriteCall> {
        self.lock().writes.clone()
    }

    pub fn reads(&self) -> Vec<(EntityType, String)> {
        self.lock().reads.clone()
    }

    /// Every watch opened so far, including cancelled ones
    pub fn watches(&self) -> Vec<WatchCall> {
        self.lock().watches.clone()
    }

    /// Most recent uncancelled watch for an entity type
    pub fn active_watch(&self, entity: EntityType) -> Option<WatchCall> {
        self.lock()
            .watches
            .iter()
            .rev()
            .find(|w| w.entity == entity && !w.is_cancelled())
            .cloned()
    }

    /// Number of cancel actions run
    pub fn cancel_count(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    fn apply_write(
        &self,
        entity: EntityType,
        action: MutationAction,
        payload: &Document,
    ) -> Result<Option<String>, RemoteError> {
        let mut inner = self.lock();
        inner.writes.push(WriteCall {
            entity,
            action,
            payload: payload.clone(),
        });

        if let Some(scripted) = inner.write_results.pop_front() {
            return scripted;
        }

        let (id, before, after) = match action {
            MutationAction::Create => {
                let id = match document_id(payload) {
                    Some(id) if !is_provisional_id(id) => id.to_string(),
                    _ => {
                        inner.next_id += 1;
                        format!("{}-{}", entity.collection(), inner.next_id)
                    }
                };
                let mut doc = payload.clone();
                doc.insert(ID_FIELD.to_string(), id.clone().into());
                let before = inner
                    .documents
                    .entry(entity)
                    .or_default()
                    .insert(id.clone(), doc.clone());
                (id, before, Some(doc))
            }
            MutationAction::Update => {
                let id = document_id(payload)
                    .ok_or_else(|| RemoteError::new(ErrorCode::InvalidArgument, "missing id"))?
                    .to_string();
                let docs = inner.documents.entry(entity).or_default();
                let Some(existing) = docs.get(&id).cloned() else {
                    return Err(RemoteError::new(
                        ErrorCode::NotFound,
                        format!("no {} document {}", entity, id),
                    ));
                };
                let doc = overlay(&existing, payload);
                docs.insert(id.clone(), doc.clone());
                (id, Some(existing), Some(doc))
            }
            MutationAction::Delete => {
                let id = document_id(payload)
                    .ok_or_else(|| RemoteError::new(ErrorCode::InvalidArgument, "missing id"))?
                    .to_string();
                let before = inner.documents.entry(entity).or_default().remove(&id);
                (id, before, None)
            }
        };

        if self.live {
            echo(&inner.watches, entity, before.as_ref(), after.as_ref());
        }

        Ok(match action {
            MutationAction::Create => Some(id),
            _ => None,
        })
    }
}

fn echo(watches: &[WatchCall], entity: EntityType, before: Option<&Document>, after: Option<&Document>) {
    for watch in watches
        .iter()
        .filter(|w| w.entity == entity && !w.is_cancelled())
    {
        let was = before.map(|d| watch.query.matches(d)).unwrap_or(false);
        let is = after.map(|d| watch.query.matches(d)).unwrap_or(false);
        match (was, is, before, after) {
            (false, true, _, Some(doc)) => {
                watch.sink.change(ChangeKind::Added, vec![doc.clone()]);
            }
            (true, true, _, Some(doc)) => {
                watch.sink.change(ChangeKind::Modified, vec![doc.clone()]);
            }
            (true, false, Some(doc), _) => {
                watch.sink.change(ChangeKind::Removed, vec![doc.clone()]);
            }
            _ => {}
        }
    }
}

#[async_trait]
impl RemoteChannel for MemoryRemote {
    async fn write(
        &self,
        entity: EntityType,
        action: MutationAction,
        payload: &Document,
    ) -> Result<Option<String>, RemoteError> {
        if let Some(delay) = self.write_delay {
            tokio::time::sleep(delay).await;
        }
        self.apply_write(entity, action, payload)
    }

    async fn read(&self, entity: EntityType, id: &str) -> Result<Option<Document>, RemoteError> {
        let mut inner = self.lock();
        inner.reads.push((entity, id.to_string()));
        if let Some(err) = inner.read_failures.pop_front() {
            return Err(err);
        }
        Ok(inner
            .documents
            .get(&entity)
            .and_then(|docs| docs.get(id))
            .cloned())
    }

    async fn watch(
        &self,
        entity: EntityType,
        query: &QueryDescriptor,
        sink: DeliverySink,
    ) -> Result<CancelHandle, RemoteError> {
        let mut inner = self.lock();
        if let Some(err) = inner.watch_failures.pop_front() {
            return Err(err);
        }

        if self.live {
            let items: Vec<Document> = inner
                .documents
                .get(&entity)
                .map(|docs| docs.values().filter(|d| query.matches(d)).cloned().collect())
                .unwrap_or_default();
            sink.change(ChangeKind::Snapshot, items);
        }

        let cancelled = Arc::new(AtomicBool::new(false));
        inner.watches.push(WatchCall {
            entity,
            query: query.clone(),
            sink,
            cancelled: cancelled.clone(),
        });

        let cancels = self.cancels.clone();
        Ok(CancelHandle::new(move || {
            cancelled.store(true, Ordering::SeqCst);
            cancels.fetch_add(1, Ordering::SeqCst);
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::from_value;
    use crate::remote::{Delivery, RemoteEvent};
    use crate::subscriptions::{Scope, SubscriptionKey};
    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    fn doc(value: Value) -> Document {
        from_value(value).unwrap()
    }

    fn sink(entity: EntityType) -> (DeliverySink, mpsc::UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            DeliverySink::new(tx, SubscriptionKey::new(entity, Scope::All), 1),
            rx,
        )
    }

    #[tokio::test]
    async fn test_create_assigns_id_for_provisional() {
        let remote = MemoryRemote::new();
        let id = remote
            .write(
                EntityType::Appointment,
                MutationAction::Create,
                &doc(json!({"id": "local-xyz", "patientId": "p1"})),
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(id, "appointments-1");
        let stored = remote.document(EntityType::Appointment, &id).unwrap();
        assert_eq!(stored["patientId"], "p1");
        assert_eq!(remote.writes().len(), 1);
    }

    #[tokio::test]
    async fn test_update_missing_document_is_not_found() {
        let remote = MemoryRemote::new();
        let err = remote
            .write(
                EntityType::Payment,
                MutationAction::Update,
                &doc(json!({"id": "pay-1", "amount": 5})),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn test_scripted_results() {
        let remote = MemoryRemote::new();
        remote.fail_next_write(ErrorCode::Unavailable);
        let payload = doc(json!({"id": "a1"}));

        let err = remote
            .write(EntityType::Appointment, MutationAction::Delete, &payload)
            .await
            .unwrap_err();
        assert!(err.is_transient());

        // Next call falls back to the store
        assert!(remote
            .write(EntityType::Appointment, MutationAction::Delete, &payload)
            .await
            .is_ok());
        assert_eq!(remote.writes().len(), 2);
    }

    #[tokio::test]
    async fn test_live_watch_snapshot_and_echo() {
        let remote = MemoryRemote::new().live();
        remote.insert(EntityType::Appointment, doc(json!({"id": "a1", "patientId": "p1"})));
        remote.insert(EntityType::Appointment, doc(json!({"id": "a2", "patientId": "p2"})));

        let (sink, mut rx) = sink(EntityType::Appointment);
        let query = QueryDescriptor::all().filter("patientId", "p1");
        let mut handle = remote.watch(EntityType::Appointment, &query, sink).await.unwrap();

        match rx.recv().await.unwrap().event {
            RemoteEvent::Change { kind, items } => {
                assert_eq!(kind, ChangeKind::Snapshot);
                assert_eq!(items.len(), 1);
                assert_eq!(items[0]["id"], "a1");
            }
            other => panic!("unexpected event {:?}", other),
        }

        remote
            .write(
                EntityType::Appointment,
                MutationAction::Update,
                &doc(json!({"id": "a1", "status": "confirmed"})),
            )
            .await
            .unwrap();
        match rx.recv().await.unwrap().event {
            RemoteEvent::Change { kind, items } => {
                assert_eq!(kind, ChangeKind::Modified);
                assert_eq!(items[0]["status"], "confirmed");
            }
            other => panic!("unexpected event {:?}", other),
        }

        handle.cancel();
        assert_eq!(remote.cancel_count(), 1);
        assert!(remote.active_watch(EntityType::Appointment).is_none());
    }

    #[tokio::test]
    async fn test_watch_failure() {
        let remote = MemoryRemote::new();
        remote.fail_next_watch(ErrorCode::PermissionDenied);
        let (sink, _rx) = sink(EntityType::Service);
        let err = remote
            .watch(EntityType::Service, &QueryDescriptor::all(), sink)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::PermissionDenied);
    }
}
