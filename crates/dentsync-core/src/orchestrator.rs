//! Sync orchestrator
//!
//! Wires the mutation queue, the local mirrors and the live subscriptions to
//! the remote store. [`spawn_orchestrator`] moves a [`SyncOrchestrator`] into
//! a single task whose `tokio::select!` loop serializes:
//!
//! - commands from [`OrchestratorHandle`]s (local mutations, flushes, reads)
//! - identity changes (sign-in opens the role's subscriptions, sign-out
//!   cancels them)
//! - connectivity changes (coming online reopens failed subscriptions and
//!   flushes immediately)
//! - deliveries from live queries
//! - the periodic flush timer
//!
//! Because everything runs on one task, the ack path and the delivery path
//! never touch a mirror at the same time.
//!
//! ## Failure handling while flushing
//!
//! - transient: requeued with exponential backoff; the batch stops so later
//!   mutations never overtake an earlier one
//! - permanent: dropped, rolled back, reported as `mutationFailed`
//! - conflict: the remote version is read and resolved per entity policy;
//!   the queued payload is either revised or dropped as superseded

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::connectivity::ConnectivityMonitor;
use crate::document::{
    document_id, is_provisional_id, now_timestamp, overlay, provisional_id, Document, ID_FIELD,
};
use crate::error::{ErrorCode, ErrorKind, RemoteError, SyncError, SyncResult};
use crate::events::{EventBus, SyncEvent};
use crate::mirror::LocalMirror;
use crate::models::{EntityType, Identity, MutationAction, MutationRecord, Role};
use crate::queue::{RequeueOutcome, SyncQueue};
use crate::remote::{ChangeKind, Delivery, IdentityProvider, RemoteChannel, RemoteEvent};
use crate::resolver::ConflictResolver;
use crate::roles::{owner_field, subscriptions_for};
use crate::schema::validate;
use crate::storage::LocalPersistence;
use crate::subscriptions::{
    DeliveryVerdict, SubscriptionKey, SubscriptionRegistry, SubscriptionState,
};

const COMMAND_CAPACITY: usize = 32;

/// Fields ignored when checking a queued update against a newer remote version
const BOOKKEEPING_FIELDS: &[&str] = &[ID_FIELD, "createdAt", "updatedAt"];

/// Outcome of one flush
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlushReport {
    pub written: usize,
    pub retried: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    /// Conflicts routed through the resolver
    pub resolved: usize,
    /// Queued mutations dropped because the remote version won
    pub superseded: usize,
    /// Nothing attempted (offline or stopped)
    pub skipped: bool,
    /// Stopped while a write was in flight; its result was thrown away
    pub discarded: bool,
}

/// Point-in-time view of the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_online: bool,
    pub queue_length: usize,
    pub dead_letters: usize,
    pub subscriptions: usize,
    pub user_id: Option<String>,
    pub role: Option<Role>,
    pub stopped: bool,
}

#[derive(Debug, Clone)]
struct Session {
    identity: Identity,
    role: Role,
}

/// Exponential retry delay after transient failures
#[derive(Debug)]
struct Backoff {
    initial: Duration,
    max: Duration,
    delay: Option<Duration>,
    retry_at: Option<Instant>,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            delay: None,
            retry_at: None,
        }
    }

    /// Record a failure and return the delay before the next attempt
    fn fail(&mut self) -> Duration {
        let delay = match self.delay {
            None => self.initial,
            Some(delay) => (delay * 2).min(self.max),
        };
        self.delay = Some(delay);
        self.retry_at = Some(Instant::now() + delay);
        delay
    }

    fn reset(&mut self) {
        self.delay = None;
        self.retry_at = None;
    }

    fn ready(&self) -> bool {
        self.retry_at.map(|at| Instant::now() >= at).unwrap_or(true)
    }
}

/// How a flush continues after one record
enum Step {
    Continue,
    /// Stop the batch; the next tick picks it up
    Stop,
    /// Stop the batch and back off
    Backoff,
}

/// The sync core's context object
///
/// Every collaborator is passed in; there is no global state. Drive it
/// directly (tests, tools) or hand it to [`spawn_orchestrator`].
pub struct SyncOrchestrator {
    config: Config,
    remote: Arc<dyn RemoteChannel>,
    identity: Arc<dyn IdentityProvider>,
    connectivity: ConnectivityMonitor,
    queue: SyncQueue,
    mirror: LocalMirror,
    registry: SubscriptionRegistry,
    resolver: ConflictResolver,
    events: EventBus,
    delivery_tx: mpsc::UnboundedSender<Delivery>,
    delivery_rx: mpsc::UnboundedReceiver<Delivery>,
    stopped: Arc<AtomicBool>,
    session: Option<Session>,
    backoff: Backoff,
    was_online: bool,
}

impl SyncOrchestrator {
    /// Build an orchestrator, restoring the persisted queue
    pub fn new(
        config: Config,
        remote: Arc<dyn RemoteChannel>,
        identity: Arc<dyn IdentityProvider>,
        persistence: Arc<dyn LocalPersistence>,
        connectivity: ConnectivityMonitor,
    ) -> Self {
        let queue = SyncQueue::load(
            Arc::clone(&persistence),
            config.queue_capacity,
            config.max_retries,
        );
        let mirror = LocalMirror::new(persistence);
        let resolver = config.resolver();
        let backoff = Backoff::new(config.initial_retry_delay(), config.max_retry_delay());
        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();
        let was_online = connectivity.is_online();

        Self {
            config,
            remote,
            identity,
            connectivity,
            queue,
            mirror,
            registry: SubscriptionRegistry::new(),
            resolver,
            events: EventBus::new(),
            delivery_tx,
            delivery_rx,
            stopped: Arc::new(AtomicBool::new(false)),
            session: None,
            backoff,
            was_online,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn queue(&self) -> &SyncQueue {
        &self.queue
    }

    pub fn mirror(&self) -> &LocalMirror {
        &self.mirror
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    /// Role of the signed-in user
    pub fn role(&self) -> Option<Role> {
        self.session.as_ref().map(|s| s.role)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            is_online: self.connectivity.is_online(),
            queue_length: self.queue.len(),
            dead_letters: self.queue.dead_letters().len(),
            subscriptions: self.registry.active_count(),
            user_id: self.session.as_ref().map(|s| s.identity.user_id.clone()),
            role: self.role(),
            stopped: self.is_stopped(),
        }
    }

    /// Pick up the current identity and flush anything left from a previous run
    pub async fn start(&mut self) {
        if self.is_stopped() {
            warn!("Sync orchestrator already stopped, not starting");
            return;
        }
        info!(
            "Sync orchestrator starting ({} queued, {})",
            self.queue.len(),
            if self.connectivity.is_online() {
                "online"
            } else {
                "offline"
            }
        );

        self.was_online = self.connectivity.is_online();
        let identity = self.identity.current();
        self.handle_identity(identity).await;
        self.emit_status();

        if self.was_online && !self.queue.is_empty() {
            self.flush().await;
        }
    }

    /// Cancel every subscription and refuse further work
    ///
    /// Stopping is final. A remote call still in flight completes, but its
    /// result is discarded.
    pub fn stop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.registry.cancel_all();
        if self.queue.is_dirty() {
            if let Err(e) = self.queue.persist() {
                error!("Failed to persist sync queue on stop: {}", e);
            }
        }
        info!("Sync orchestrator stopped ({} queued)", self.queue.len());
    }

    fn ensure_running(&self) -> SyncResult<()> {
        if self.is_stopped() {
            Err(SyncError::Stopped)
        } else {
            Ok(())
        }
    }

    /// React to a sign-in or sign-out
    pub async fn handle_identity(&mut self, identity: Option<Identity>) {
        let Some(identity) = identity else {
            if let Some(session) = self.session.take() {
                info!("Signed out ({})", session.identity.user_id);
            }
            self.registry.cancel_all();
            self.mirror.clear();
            return;
        };

        let same_user = self
            .session
            .as_ref()
            .map(|s| s.identity.user_id == identity.user_id)
            .unwrap_or(false);
        if same_user {
            self.reopen_subscriptions().await;
            return;
        }
        if self.session.take().is_some() {
            self.registry.cancel_all();
            self.mirror.clear();
        }

        let role = match identity.role {
            Some(role) => role,
            None => lookup_role(self.remote.as_ref(), &identity.user_id).await,
        };
        if self.is_stopped() {
            return;
        }

        info!("Signed in as {} ({})", identity.user_id, role);
        let uid = identity.user_id.clone();
        self.session = Some(Session { identity, role });
        self.open_subscriptions(role, &uid).await;
    }

    /// Open every subscription of the role that has no live handle
    ///
    /// Live handles are left alone, so this also reopens watches that failed
    /// to open or were torn down by a remote error.
    async fn open_subscriptions(&mut self, role: Role, uid: &str) {
        let remote = Arc::clone(&self.remote);
        for plan in subscriptions_for(role, uid) {
            if self.mirror.ensure(&plan.key, &plan.query) {
                self.emit_slice(&plan.key);
            }
            if self.registry.state(&plan.key) != SubscriptionState::Unsubscribed {
                continue;
            }

            let result = self
                .registry
                .watch(plan.key.clone(), &plan.query, remote.as_ref(), &self.delivery_tx)
                .await;
            if self.is_stopped() {
                self.registry.cancel_all();
                return;
            }
            if let Err(e) = result {
                self.events.emit(SyncEvent::SubscriptionFailed {
                    key: plan.key,
                    code: e.code,
                    message: e.message,
                });
            }
        }
    }

    /// Retry the signed-in user's failed subscriptions
    async fn reopen_subscriptions(&mut self) {
        let Some(session) = &self.session else {
            return;
        };
        let role = session.role;
        let uid = session.identity.user_id.clone();

        let missing = subscriptions_for(role, &uid)
            .iter()
            .filter(|plan| self.registry.state(&plan.key) == SubscriptionState::Unsubscribed)
            .count();
        if missing > 0 {
            info!("Reopening {} subscription(s) for {}", missing, uid);
            self.open_subscriptions(role, &uid).await;
        }
    }

    /// Record a connectivity change and react to it
    pub async fn handle_connectivity(&mut self, online: bool) {
        self.connectivity.set_online(online);
        self.on_connectivity_changed().await;
    }

    async fn on_connectivity_changed(&mut self) {
        let online = self.connectivity.is_online();
        if online == self.was_online {
            return;
        }
        self.was_online = online;
        self.emit_status();

        if online && !self.is_stopped() {
            self.reopen_subscriptions().await;
            if self.is_stopped() {
                return;
            }
            self.backoff.reset();
            self.flush().await;
        }
    }

    /// Queue an optimistic create
    ///
    /// The owner field for the user's role, a provisional id and the
    /// timestamps are filled in when absent.
    pub fn create_local(&mut self, entity: EntityType, mut payload: Document) -> SyncResult<Uuid> {
        self.ensure_running()?;
        let session = self.session.as_ref().ok_or(SyncError::NotSignedIn)?;

        if let Some(field) = owner_field(session.role, entity) {
            if !payload.contains_key(field) {
                payload.insert(
                    field.to_string(),
                    Value::String(session.identity.user_id.clone()),
                );
            }
        }
        if document_id(&payload).is_none() {
            payload.insert(ID_FIELD.to_string(), Value::String(provisional_id()));
        }
        let now = now_timestamp();
        payload
            .entry("createdAt")
            .or_insert_with(|| now.clone());
        payload.insert("updatedAt".to_string(), now);

        validate(entity, MutationAction::Create, &payload)?;
        Ok(self.submit(MutationRecord::new(entity, MutationAction::Create, payload)))
    }

    /// Queue an optimistic update; `patch` carries the entity id
    pub fn update_local(&mut self, entity: EntityType, mut patch: Document) -> SyncResult<Uuid> {
        self.ensure_running()?;
        validate(entity, MutationAction::Update, &patch)?;

        let base = document_id(&patch).and_then(|id| self.mirror.find_confirmed(entity, id));
        patch.insert("updatedAt".to_string(), now_timestamp());
        let record = MutationRecord::new(entity, MutationAction::Update, patch).with_base(base);
        Ok(self.submit(record))
    }

    /// Queue an optimistic delete
    pub fn delete_local(&mut self, entity: EntityType, id: &str) -> SyncResult<Uuid> {
        self.ensure_running()?;
        let mut payload = Document::new();
        payload.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
        validate(entity, MutationAction::Delete, &payload)?;

        let base = self.mirror.find_confirmed(entity, id);
        let record = MutationRecord::new(entity, MutationAction::Delete, payload).with_base(base);
        Ok(self.submit(record))
    }

    fn submit(&mut self, record: MutationRecord) -> Uuid {
        let id = record.id;
        let touched = self.mirror.apply_optimistic(&record);

        if let Some(evicted) = self.queue.enqueue(record) {
            self.roll_back(&evicted, ErrorCode::ResourceExhausted);
            self.emit_failure(&evicted, ErrorCode::ResourceExhausted);
        }

        self.emit_slices(touched);
        self.emit_status();
        id
    }

    /// Write a batch of queued mutations to the remote store
    pub async fn flush(&mut self) -> FlushReport {
        let mut report = FlushReport::default();
        if self.is_stopped() || !self.connectivity.is_online() {
            debug!("Flush skipped (stopped or offline)");
            report.skipped = true;
            return report;
        }

        let batch: Vec<Uuid> = self
            .queue
            .drain_batch(self.config.flush_batch_size.max(1))
            .iter()
            .map(|r| r.id)
            .collect();
        if batch.is_empty() {
            return report;
        }
        debug!("Flushing {} mutation(s)", batch.len());

        let remote = Arc::clone(&self.remote);
        let mut backoff = false;
        for id in batch {
            // Earlier writes in this batch may have rewritten or dropped it
            let Some(record) = self.queue.get(id).cloned() else {
                continue;
            };

            let result = remote
                .write(record.entity_type, record.action, &record.payload)
                .await;
            if self.is_stopped() {
                debug!("Stopped mid-flush, discarding result for {}", record.id);
                report.discarded = true;
                return report;
            }

            let step = match result {
                Ok(assigned) => {
                    self.on_written(&record, assigned);
                    report.written += 1;
                    Step::Continue
                }
                Err(e) => match e.kind() {
                    ErrorKind::Transient => {
                        self.on_transient(&record, &e, &mut report);
                        Step::Backoff
                    }
                    ErrorKind::Permanent => {
                        self.on_rejected(&record, &e);
                        report.failed += 1;
                        Step::Continue
                    }
                    ErrorKind::Conflict => self.on_conflict(&record, &e, &mut report).await,
                },
            };

            match step {
                Step::Continue => {}
                Step::Stop => break,
                Step::Backoff => {
                    backoff = true;
                    break;
                }
            }
        }
        if report.discarded {
            return report;
        }

        if backoff {
            let delay = self.backoff.fail();
            info!("Flush paused, next attempt in {:?}", delay);
        } else {
            self.backoff.reset();
        }

        info!(
            "Flush: {} written, {} retried, {} failed, {} dead-lettered, {} left",
            report.written,
            report.retried,
            report.failed,
            report.dead_lettered,
            self.queue.len()
        );
        self.emit_status();
        report
    }

    /// Flush if online and the retry delay has passed
    pub async fn tick(&mut self) -> Option<FlushReport> {
        if self.queue.is_dirty() {
            if let Err(e) = self.queue.persist() {
                warn!("Sync queue still not persisted: {}", e);
            }
        }
        if self.is_stopped()
            || !self.connectivity.is_online()
            || self.queue.is_empty()
            || !self.backoff.ready()
        {
            return None;
        }
        Some(self.flush().await)
    }

    /// Move dead letters back into the queue and show them again
    ///
    /// Pending mutations pushed out of a full queue are rolled back and
    /// reported like any other overflow.
    pub fn retry_dead_letters(&mut self) -> usize {
        let retry = self.queue.retry_dead_letters();

        let mut touched = Vec::new();
        for record in &retry.requeued {
            touched.extend(self.mirror.apply_optimistic(record));
        }
        self.emit_slices(touched);

        for evicted in &retry.evicted {
            self.roll_back(evicted, ErrorCode::ResourceExhausted);
            self.emit_failure(evicted, ErrorCode::ResourceExhausted);
        }
        if retry.count() > 0 {
            self.emit_status();
        }
        retry.count()
    }

    fn on_written(&mut self, record: &MutationRecord, assigned: Option<String>) {
        self.queue.ack(record.id);

        let mut confirmed = record.clone();
        let mut touched = Vec::new();
        if record.action == MutationAction::Create {
            if let (Some(from), Some(to)) = (record.entity_id(), assigned.as_deref()) {
                if from != to {
                    debug!("{} {} is now {}", record.entity_type, from, to);
                    self.queue.rewrite_entity_id(record.entity_type, from, to);
                    touched.extend(self.mirror.rekey(record.entity_type, from, to));
                    confirmed
                        .payload
                        .insert(ID_FIELD.to_string(), Value::String(to.to_string()));
                }
            }
        }

        self.queue.rebase_pending(&confirmed);
        touched.extend(self.mirror.confirm(&confirmed));
        self.emit_slices(touched);
    }

    fn on_transient(&mut self, record: &MutationRecord, error: &RemoteError, report: &mut FlushReport) {
        match self.queue.requeue(record.id, &error.to_string()) {
            RequeueOutcome::Retry { .. } => report.retried += 1,
            RequeueOutcome::DeadLettered(dead) => {
                report.dead_lettered += 1;
                let attempts = self
                    .queue
                    .dead_letters()
                    .iter()
                    .rev()
                    .find(|d| d.record.id == dead.id)
                    .map(|d| d.attempts)
                    .unwrap_or(self.config.max_retries);
                self.roll_back(&dead, error.code);
                self.events.emit(SyncEvent::MutationDeadLettered {
                    mutation_id: dead.id,
                    entity: dead.entity_type,
                    attempts,
                });
            }
            RequeueOutcome::Missing => {}
        }
    }

    fn on_rejected(&mut self, record: &MutationRecord, error: &RemoteError) {
        warn!(
            "{} {} rejected: {}",
            record.action, record.entity_type, error
        );
        self.queue.ack(record.id);
        self.roll_back(record, error.code);
        self.emit_failure(record, error.code);
    }

    async fn on_conflict(
        &mut self,
        record: &MutationRecord,
        error: &RemoteError,
        report: &mut FlushReport,
    ) -> Step {
        let Some(id) = record.entity_id().map(str::to_string) else {
            self.on_rejected(record, error);
            report.failed += 1;
            return Step::Continue;
        };
        if record.action != MutationAction::Update {
            // Nothing to merge, count it as a failed attempt
            self.on_transient(record, error, report);
            return Step::Backoff;
        }

        let remote = Arc::clone(&self.remote);
        let read = remote.read(record.entity_type, &id).await;
        if self.is_stopped() {
            report.discarded = true;
            return Step::Stop;
        }

        let latest = match read {
            Ok(Some(doc)) => doc,
            Ok(None) => {
                let gone = RemoteError::new(
                    ErrorCode::NotFound,
                    format!("{} {} no longer exists", record.entity_type, id),
                );
                self.on_rejected(record, &gone);
                report.failed += 1;
                return Step::Continue;
            }
            Err(e) if e.is_transient() => {
                self.on_transient(record, &e, report);
                return Step::Backoff;
            }
            Err(e) => {
                self.on_rejected(record, &e);
                report.failed += 1;
                return Step::Continue;
            }
        };

        report.resolved += 1;
        let superseded = self.settle_conflict(record, &latest);

        let pending: Vec<MutationRecord> = self
            .queue
            .pending_for(record.entity_type, &id)
            .into_iter()
            .cloned()
            .collect();
        let refs: Vec<&MutationRecord> = pending.iter().collect();
        let touched = self.mirror.refresh(record.entity_type, &latest, &refs);
        self.emit_slices(touched);

        if superseded {
            report.superseded += 1;
            Step::Continue
        } else {
            // The revised payload still counts against the retry budget
            self.on_transient(record, error, report);
            Step::Stop
        }
    }

    /// Resolve a queued update against a newer remote version
    ///
    /// Returns true when the remote version won and the update was dropped;
    /// otherwise the queued payload becomes the resolved document.
    fn settle_conflict(&mut self, record: &MutationRecord, remote: &Document) -> bool {
        let local = overlay(remote, &record.payload);
        let winner = self.resolver.resolve(&local, remote, record.entity_type);
        let entity_id = document_id(remote).unwrap_or_default().to_string();

        if winner == *remote {
            info!(
                "Queued {} of {} {} superseded by the remote version",
                record.action, record.entity_type, entity_id
            );
            self.queue.ack(record.id);
            self.events.emit(SyncEvent::MutationSuperseded {
                mutation_id: record.id,
                entity: record.entity_type,
                entity_id,
            });
            true
        } else {
            debug!(
                "Revised queued {} of {} {} ({})",
                record.action,
                record.entity_type,
                entity_id,
                self.resolver.policy_for(record.entity_type)
            );
            self.queue.revise(record.id, winner, Some(remote.clone()));
            false
        }
    }

    /// Revert an entity after `record` was dropped, keeping what is still queued
    fn roll_back(&mut self, record: &MutationRecord, code: ErrorCode) {
        let Some(id) = record.entity_id().map(str::to_string) else {
            return;
        };

        // Nothing can follow a create that never reached the store
        if record.action == MutationAction::Create && is_provisional_id(&id) {
            for dependent in self.queue.remove_targeting(record.entity_type, &id) {
                warn!(
                    "Dropping {} of unsaved {} {}",
                    dependent.action, dependent.entity_type, id
                );
                self.emit_failure(&dependent, code);
            }
        }

        let pending: Vec<MutationRecord> = self
            .queue
            .pending_for(record.entity_type, &id)
            .into_iter()
            .cloned()
            .collect();
        let refs: Vec<&MutationRecord> = pending.iter().collect();
        let touched = self.mirror.rollback(record.entity_type, &id, &refs);
        self.emit_slices(touched);
    }

    /// Apply one delivery from a live query
    ///
    /// Emits exactly one `<entity>Updated` event for every accepted change.
    pub fn handle_delivery(&mut self, delivery: Delivery) {
        if self.is_stopped() {
            return;
        }

        let version = match self.registry.accept(&delivery) {
            DeliveryVerdict::Stale => return,
            DeliveryVerdict::Failed(e) => {
                self.events.emit(SyncEvent::SubscriptionFailed {
                    key: delivery.key,
                    code: e.code,
                    message: e.message,
                });
                return;
            }
            DeliveryVerdict::Apply { version } => version,
        };

        let Delivery { key, event, .. } = delivery;
        let RemoteEvent::Change { kind, items } = event else {
            return;
        };
        let entity = key.entity;
        debug!("{} {} item(s) for {} (#{})", kind, items.len(), key, version);

        match kind {
            ChangeKind::Snapshot => {
                let reconciled: Vec<(Document, Option<Document>)> = items
                    .into_iter()
                    .map(|item| {
                        let current = self.reconcile(entity, &item);
                        (item, current)
                    })
                    .collect();
                self.mirror.apply_snapshot(&key, reconciled);
            }
            ChangeKind::Added | ChangeKind::Modified => {
                for item in items {
                    let current = self.reconcile(entity, &item);
                    self.mirror.apply_upsert(&key, item, current);
                }
            }
            ChangeKind::Removed => {
                for item in items {
                    let Some(id) = document_id(&item).map(str::to_string) else {
                        continue;
                    };
                    for dropped in self.queue.remove_targeting(entity, &id) {
                        info!("Queued {} of removed {} {} dropped", dropped.action, entity, id);
                        self.events.emit(SyncEvent::MutationSuperseded {
                            mutation_id: dropped.id,
                            entity,
                            entity_id: id.clone(),
                        });
                    }
                    self.mirror.apply_removed(&key, &id);
                }
            }
        }

        self.emit_slice(&key);
    }

    /// Handle every delivery already received without waiting for more
    pub fn process_deliveries(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(delivery) = self.delivery_rx.try_recv() {
            self.handle_delivery(delivery);
            handled += 1;
        }
        handled
    }

    /// Version to show for a remote entity given the mutations still queued for it
    fn reconcile(&mut self, entity: EntityType, remote: &Document) -> Option<Document> {
        let Some(id) = document_id(remote).map(str::to_string) else {
            return Some(remote.clone());
        };
        let pending: Vec<MutationRecord> = self
            .queue
            .pending_for(entity, &id)
            .into_iter()
            .cloned()
            .collect();

        let mut current = Some(remote.clone());
        for record in pending {
            let record = if diverged(&record, remote) {
                if self.settle_conflict(&record, remote) {
                    continue;
                }
                match self.queue.get(record.id) {
                    Some(revised) => revised.clone(),
                    None => continue,
                }
            } else {
                record
            };
            current = replay(current, &record);
        }
        current
    }

    fn emit_slice(&self, key: &SubscriptionKey) {
        self.events.emit(SyncEvent::EntityUpdated {
            entity: key.entity,
            key: key.clone(),
            items: self.mirror.slice(key),
        });
    }

    fn emit_slices(&self, keys: Vec<SubscriptionKey>) {
        let keys: BTreeSet<SubscriptionKey> = keys.into_iter().collect();
        for key in &keys {
            self.emit_slice(key);
        }
    }

    fn emit_status(&self) {
        self.events.emit(SyncEvent::SyncStatusChanged {
            is_online: self.connectivity.is_online(),
            queue_length: self.queue.len(),
        });
    }

    fn emit_failure(&self, record: &MutationRecord, code: ErrorCode) {
        self.events.emit(SyncEvent::MutationFailed {
            mutation_id: record.id,
            entity: record.entity_type,
            code,
            message: code.user_message().to_string(),
        });
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut identity_rx = self.identity.subscribe();
        let mut online_rx = self.connectivity.subscribe();
        let mut identity_open = true;

        self.start().await;

        let mut ticker = tokio::time::interval(self.config.flush_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                Some(delivery) = self.delivery_rx.recv() => self.handle_delivery(delivery),
                changed = identity_rx.changed(), if identity_open => match changed {
                    Ok(()) => {
                        let identity = identity_rx.borrow_and_update().clone();
                        self.handle_identity(identity).await;
                    }
                    Err(_) => {
                        debug!("Identity provider closed");
                        identity_open = false;
                    }
                },
                Ok(()) = online_rx.changed() => self.on_connectivity_changed().await,
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }

        self.stop();
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Create {
                entity,
                payload,
                reply,
            } => {
                let _ = reply.send(self.create_local(entity, payload));
            }
            Command::Update {
                entity,
                payload,
                reply,
            } => {
                let _ = reply.send(self.update_local(entity, payload));
            }
            Command::Delete { entity, id, reply } => {
                let _ = reply.send(self.delete_local(entity, &id));
            }
            Command::Flush { reply } => {
                let report = self.flush().await;
                let _ = reply.send(report);
            }
            Command::Slice { key, reply } => {
                let _ = reply.send(self.mirror.slice(&key));
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Command::RetryDeadLetters { reply } => {
                let _ = reply.send(self.retry_dead_letters());
            }
            Command::Shutdown => {}
        }
    }
}

/// Role from the user's profile document, patient when unknown
async fn lookup_role(remote: &dyn RemoteChannel, uid: &str) -> Role {
    match remote.read(EntityType::Patient, uid).await {
        Ok(Some(profile)) => Role::from_profile(&profile),
        Ok(None) => {
            debug!("No profile for {}, assuming patient", uid);
            Role::Patient
        }
        Err(e) => {
            warn!("Could not read profile for {}: {}, assuming patient", uid, e);
            Role::Patient
        }
    }
}

/// Whether the remote changed a field that a queued update also changes
fn diverged(record: &MutationRecord, remote: &Document) -> bool {
    if record.action != MutationAction::Update {
        return false;
    }
    let Some(base) = &record.base else {
        return false;
    };
    record
        .payload
        .iter()
        .filter(|(field, _)| !BOOKKEEPING_FIELDS.contains(&field.as_str()))
        .any(|(field, value)| {
            let theirs = remote.get(field);
            theirs != base.get(field) && theirs != Some(value)
        })
}

fn replay(current: Option<Document>, record: &MutationRecord) -> Option<Document> {
    match record.action {
        MutationAction::Create => Some(record.payload.clone()),
        MutationAction::Update => current.map(|doc| overlay(&doc, &record.payload)),
        MutationAction::Delete => None,
    }
}

/// Requests sent to the orchestrator task
enum Command {
    Create {
        entity: EntityType,
        payload: Document,
        reply: oneshot::Sender<SyncResult<Uuid>>,
    },
    Update {
        entity: EntityType,
        payload: Document,
        reply: oneshot::Sender<SyncResult<Uuid>>,
    },
    Delete {
        entity: EntityType,
        id: String,
        reply: oneshot::Sender<SyncResult<Uuid>>,
    },
    Flush {
        reply: oneshot::Sender<FlushReport>,
    },
    Slice {
        key: SubscriptionKey,
        reply: oneshot::Sender<Vec<Document>>,
    },
    Status {
        reply: oneshot::Sender<SyncStatus>,
    },
    RetryDeadLetters {
        reply: oneshot::Sender<usize>,
    },
    Shutdown,
}

/// Handle to a spawned orchestrator task
pub struct OrchestratorHandle {
    commands: mpsc::Sender<Command>,
    events: EventBus,
    connectivity: ConnectivityMonitor,
    stopped: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl OrchestratorHandle {
    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// The monitor the orchestrator watches; flip it to report connectivity
    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    pub async fn create_local(&self, entity: EntityType, payload: Document) -> SyncResult<Uuid> {
        self.request(|reply| Command::Create {
            entity,
            payload,
            reply,
        })
        .await?
    }

    pub async fn update_local(&self, entity: EntityType, payload: Document) -> SyncResult<Uuid> {
        self.request(|reply| Command::Update {
            entity,
            payload,
            reply,
        })
        .await?
    }

    pub async fn delete_local(&self, entity: EntityType, id: &str) -> SyncResult<Uuid> {
        let id = id.to_string();
        self.request(|reply| Command::Delete { entity, id, reply })
            .await?
    }

    pub async fn flush(&self) -> SyncResult<FlushReport> {
        self.request(|reply| Command::Flush { reply }).await
    }

    /// Current view of one subscription
    pub async fn slice(&self, key: SubscriptionKey) -> SyncResult<Vec<Document>> {
        self.request(|reply| Command::Slice { key, reply }).await
    }

    pub async fn status(&self) -> SyncResult<SyncStatus> {
        self.request(|reply| Command::Status { reply }).await
    }

    pub async fn retry_dead_letters(&self) -> SyncResult<usize> {
        self.request(|reply| Command::RetryDeadLetters { reply })
            .await
    }

    /// Stop the task and wait for it to finish
    ///
    /// A write in flight completes but its result is discarded, so the
    /// mutation stays queued for the next run.
    pub async fn shutdown(self) {
        self.stopped.store(true, Ordering::SeqCst);
        let _ = self.commands.send(Command::Shutdown).await;
        if let Err(e) = self.task.await {
            error!("Sync task ended abnormally: {}", e);
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> SyncResult<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| SyncError::Stopped)?;
        response.await.map_err(|_| SyncError::Stopped)
    }
}

/// Run an orchestrator on its own task
///
/// The task starts the orchestrator (current identity, pending flush) and
/// then serves the returned handle until [`OrchestratorHandle::shutdown`].
pub fn spawn_orchestrator(orchestrator: SyncOrchestrator) -> OrchestratorHandle {
    let (commands, command_rx) = mpsc::channel(COMMAND_CAPACITY);
    let events = orchestrator.events.clone();
    let connectivity = orchestrator.connectivity.clone();
    let stopped = Arc::clone(&orchestrator.stopped);

    let task = tokio::spawn(orchestrator.run(command_rx));

    OrchestratorHandle {
        commands,
        events,
        connectivity,
        stopped,
        task,
    }
}
