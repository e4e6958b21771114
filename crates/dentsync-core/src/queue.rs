//! Durable mutation queue
//!
//! Local mutations wait here until the remote store confirms them. The queue
//! is FIFO, bounded, and written through to [`LocalPersistence`] after every
//! structural change so a restart picks up exactly where it left off.
//!
//! ## Failure handling
//!
//! - [`SyncQueue::ack`] removes a record (confirmed or permanently rejected)
//! - [`SyncQueue::requeue`] counts a transient failure; after `max_retries`
//!   the record moves to the dead-letter list
//!
//! A failed write to persistence never rejects the in-memory change. The error
//! is logged and the full state is written again on the next change.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::document::{overlay, Document, ID_FIELD};
use crate::models::{EntityType, MutationAction, MutationRecord};
use crate::storage::{load_json, save_json, LocalPersistence, StorageResult};

/// Persistence key for the pending queue
pub const QUEUE_KEY: &str = "syncQueue";

/// Persistence key for the dead-letter list
pub const DEAD_LETTER_KEY: &str = "syncDeadLetters";

/// A queued record with its retry counter
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMutation {
    pub record: MutationRecord,
    #[serde(default)]
    pub attempts: u32,
}

/// A record that exhausted its retries
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub record: MutationRecord,
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Result of [`SyncQueue::requeue`]
#[derive(Debug, Clone, PartialEq)]
pub enum RequeueOutcome {
    /// Still queued; `attempts` failures so far
    Retry { attempts: u32 },
    /// Moved to the dead-letter list
    DeadLettered(MutationRecord),
    /// No record with that id was queued
    Missing,
}

/// Result of [`SyncQueue::retry_dead_letters`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeadLetterRetry {
    /// Dead letters now queued again
    pub requeued: Vec<MutationRecord>,
    /// Queued records dropped to make room
    pub evicted: Vec<MutationRecord>,
}

impl DeadLetterRetry {
    pub fn count(&self) -> usize {
        self.requeued.len()
    }
}

/// FIFO of pending mutations
pub struct SyncQueue {
    entries: VecDeque<QueuedMutation>,
    dead_letters: Vec<DeadLetter>,
    persistence: Arc<dyn LocalPersistence>,
    capacity: usize,
    max_retries: u32,
    dirty: bool,
}

impl SyncQueue {
    /// Restore the queue from persistence
    ///
    /// Unreadable state is logged and replaced by an empty queue.
    pub fn load(persistence: Arc<dyn LocalPersistence>, capacity: usize, max_retries: u32) -> Self {
        let entries: VecDeque<QueuedMutation> =
            match load_json::<Vec<QueuedMutation>>(persistence.as_ref(), QUEUE_KEY) {
                Ok(Some(entries)) => entries.into(),
                Ok(None) => VecDeque::new(),
                Err(e) => {
                    error!("Failed to restore sync queue: {}", e);
                    VecDeque::new()
                }
            };

        let dead_letters = match load_json::<Vec<DeadLetter>>(persistence.as_ref(), DEAD_LETTER_KEY)
        {
            Ok(Some(dead)) => dead,
            Ok(None) => Vec::new(),
            Err(e) => {
                error!("Failed to restore dead letters: {}", e);
                Vec::new()
            }
        };

        if !entries.is_empty() || !dead_letters.is_empty() {
            info!(
                "Restored {} queued mutation(s), {} dead letter(s)",
                entries.len(),
                dead_letters.len()
            );
        }

        Self {
            entries,
            dead_letters,
            persistence,
            capacity: capacity.max(1),
            max_retries,
            dirty: false,
        }
    }

    /// Append a record at the tail
    ///
    /// Returns the record evicted from the head when the queue was full.
    /// A record whose id is already queued is ignored.
    pub fn enqueue(&mut self, record: MutationRecord) -> Option<MutationRecord> {
        if self.entries.iter().any(|e| e.record.id == record.id) {
            debug!("Mutation {} already queued", record.id);
            return None;
        }

        let evicted = if self.entries.len() >= self.capacity {
            let oldest = self.entries.pop_front().map(|e| e.record);
            if let Some(ref oldest) = oldest {
                warn!(
                    "Sync queue full ({} entries), dropping oldest mutation {} ({} {})",
                    self.capacity, oldest.id, oldest.action, oldest.entity_type
                );
            }
            oldest
        } else {
            None
        };

        debug!(
            "Queued {} {} as {}",
            record.action, record.entity_type, record.id
        );
        self.entries.push_back(QueuedMutation {
            record,
            attempts: 0,
        });
        self.save();
        evicted
    }

    /// Up to `max` records from the head, without removing them
    pub fn drain_batch(&self, max: usize) -> Vec<MutationRecord> {
        self.entries
            .iter()
            .take(max)
            .map(|e| e.record.clone())
            .collect()
    }

    /// Remove a record; returns false if it was not queued
    pub fn ack(&mut self, id: Uuid) -> bool {
        let Some(pos) = self.position(id) else {
            return false;
        };
        self.entries.remove(pos);
        debug!("Acked mutation {}", id);
        self.save();
        true
    }

    /// Count a transient failure for a record
    pub fn requeue(&mut self, id: Uuid, reason: &str) -> RequeueOutcome {
        let Some(pos) = self.position(id) else {
            return RequeueOutcome::Missing;
        };

        let entry = &mut self.entries[pos];
        entry.attempts += 1;
        let attempts = entry.attempts;

        if attempts < self.max_retries {
            debug!(
                "Mutation {} failed ({}), attempt {}/{}",
                id, reason, attempts, self.max_retries
            );
            self.save();
            return RequeueOutcome::Retry { attempts };
        }

        let Some(entry) = self.entries.remove(pos) else {
            return RequeueOutcome::Missing;
        };
        warn!(
            "Mutation {} ({} {}) dead-lettered after {} attempts: {}",
            id, entry.record.action, entry.record.entity_type, attempts, reason
        );
        let record = entry.record.clone();
        self.dead_letters.push(DeadLetter {
            record: entry.record,
            attempts,
            last_error: Some(reason.to_string()),
            dead_lettered_at: Utc::now(),
        });
        self.save();
        RequeueOutcome::DeadLettered(record)
    }

    /// Look up a queued record
    pub fn get(&self, id: Uuid) -> Option<&MutationRecord> {
        self.entries
            .iter()
            .map(|e| &e.record)
            .find(|r| r.id == id)
    }

    /// Replace a queued record's payload and the remote version it is based on
    pub fn revise(&mut self, id: Uuid, payload: Document, base: Option<Document>) -> bool {
        let Some(pos) = self.position(id) else {
            return false;
        };
        let record = &mut self.entries[pos].record;
        record.payload = payload;
        record.base = base;
        self.save();
        true
    }

    /// Fold a confirmed mutation into the base of the records still queued
    /// for the same entity
    pub fn rebase_pending(&mut self, confirmed: &MutationRecord) -> usize {
        let Some(id) = confirmed.entity_id().map(str::to_string) else {
            return 0;
        };
        let mut rebased = 0;
        for entry in self.entries.iter_mut() {
            if !entry.record.targets(confirmed.entity_type, &id) {
                continue;
            }
            entry.record.base = match confirmed.action {
                MutationAction::Delete => None,
                _ => {
                    let base = entry.record.base.take().unwrap_or_default();
                    Some(overlay(&base, &confirmed.payload))
                }
            };
            rebased += 1;
        }
        if rebased > 0 {
            self.save();
        }
        rebased
    }

    /// Point queued records at a server-assigned id
    ///
    /// Returns the number of records rewritten.
    pub fn rewrite_entity_id(&mut self, entity: EntityType, from: &str, to: &str) -> usize {
        let mut rewritten = 0;
        for entry in self.entries.iter_mut() {
            if entry.record.targets(entity, from) {
                entry
                    .record
                    .payload
                    .insert(ID_FIELD.to_string(), to.into());
                rewritten += 1;
            }
        }
        if rewritten > 0 {
            debug!("Rewrote {} queued {} mutation(s): {} -> {}", rewritten, entity, from, to);
            self.save();
        }
        rewritten
    }

    /// Queued records targeting one entity, oldest first
    pub fn pending_for(&self, entity: EntityType, id: &str) -> Vec<&MutationRecord> {
        self.entries
            .iter()
            .map(|e| &e.record)
            .filter(|r| r.targets(entity, id))
            .collect()
    }

    /// Remove every queued record targeting one entity
    pub fn remove_targeting(&mut self, entity: EntityType, id: &str) -> Vec<MutationRecord> {
        let (removed, kept): (Vec<_>, Vec<_>) = self
            .entries
            .drain(..)
            .partition(|e| e.record.targets(entity, id));
        self.entries = kept.into();
        if !removed.is_empty() {
            self.save();
        }
        removed.into_iter().map(|e| e.record).collect()
    }

    pub fn dead_letters(&self) -> &[DeadLetter] {
        &self.dead_letters
    }

    /// Move every dead letter back to the tail with a fresh retry budget
    ///
    /// A full queue drops from the head as [`SyncQueue::enqueue`] does; the
    /// dropped records are returned so their optimistic changes can be undone.
    pub fn retry_dead_letters(&mut self) -> DeadLetterRetry {
        let mut retry = DeadLetterRetry::default();
        if self.dead_letters.is_empty() {
            return retry;
        }
        for dead in std::mem::take(&mut self.dead_letters) {
            if self.entries.len() >= self.capacity {
                if let Some(oldest) = self.entries.pop_front() {
                    warn!(
                        "Sync queue full ({} entries), dropping oldest mutation {} ({} {})",
                        self.capacity,
                        oldest.record.id,
                        oldest.record.action,
                        oldest.record.entity_type
                    );
                    retry.requeued.retain(|r| r.id != oldest.record.id);
                    retry.evicted.push(oldest.record);
                }
            }
            retry.requeued.push(dead.record.clone());
            self.entries.push_back(QueuedMutation {
                record: dead.record,
                attempts: 0,
            });
        }
        info!(
            "Requeued {} dead letter(s), dropped {}",
            retry.requeued.len(),
            retry.evicted.len()
        );
        self.save();
        retry
    }

    /// Discard every dead letter
    pub fn purge_dead_letters(&mut self) -> usize {
        let count = self.dead_letters.len();
        if count > 0 {
            self.dead_letters.clear();
            info!("Purged {} dead letter(s)", count);
            self.save();
        }
        count
    }

    /// Queued records, oldest first
    pub fn entries(&self) -> impl Iterator<Item = &QueuedMutation> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the last write to persistence failed
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Write the full queue and dead-letter list
    pub fn persist(&mut self) -> StorageResult<()> {
        let entries: Vec<&QueuedMutation> = self.entries.iter().collect();
        save_json(self.persistence.as_ref(), QUEUE_KEY, &entries)?;
        save_json(self.persistence.as_ref(), DEAD_LETTER_KEY, &self.dead_letters)?;
        self.dirty = false;
        Ok(())
    }

    fn save(&mut self) {
        if let Err(e) = self.persist() {
            error!("Failed to persist sync queue: {}", e);
            if let Some(hint) = e.recovery_suggestion() {
                error!("{}", hint);
            }
            self.dirty = true;
        }
    }

    fn position(&self, id: Uuid) -> Option<usize> {
        self.entries.iter().position(|e| e.record.id == id)
    }
}
