//! Local entity mirrors
//!
//! One [`EntityMirror`] per subscription key holds the latest known version
//! of every entity the subscription covers. Each entry keeps the last
//! version the remote store confirmed next to the current, possibly
//! optimistic, version shown to the user, so a rejected local write can be
//! rolled back without a round trip.
//!
//! Every change is written through to persistence (`mirror:<entity>:<scope>`)
//! as the current view plus the confirmed versions behind it. The cache stays
//! readable offline and after sign-out (marked stale), and a restored mirror
//! can still roll back to what the store last confirmed.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::document::{document_id, overlay, timestamp_millis, Document, ID_FIELD};
use crate::models::{EntityType, MutationAction, MutationRecord};
use crate::remote::{QueryDescriptor, SortDirection};
use crate::storage::{load_json, save_json, LocalPersistence, StorageResult};
use crate::subscriptions::{Scope, SubscriptionKey, MIRROR_KEY_PREFIX};

/// Confirmed and current versions of one entity
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MirrorEntry {
    /// Last version confirmed by the remote store (`None` for a local create)
    pub confirmed: Option<Document>,
    /// Version shown to the user (`None` once deleted locally)
    pub current: Option<Document>,
}

/// Entities covered by one subscription
#[derive(Debug, Clone, Default)]
pub struct EntityMirror {
    entries: BTreeMap<String, MirrorEntry>,
    order_by: Option<(String, SortDirection)>,
    /// Restored from cache, no snapshot received yet
    stale: bool,
}

impl EntityMirror {
    pub fn entry(&self, id: &str) -> Option<&MirrorEntry> {
        self.entries.get(id)
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    /// Current versions, ordered like the subscription's query
    pub fn slice(&self) -> Vec<Document> {
        let mut items: Vec<Document> = self
            .entries
            .values()
            .filter_map(|e| e.current.clone())
            .collect();
        if let Some((field, direction)) = &self.order_by {
            items.sort_by(|a, b| {
                let ord = compare_values(a.get(field), b.get(field));
                match direction {
                    SortDirection::Ascending => ord,
                    SortDirection::Descending => ord.reverse(),
                }
            });
        }
        items
    }
}

/// Persisted view of one mirror
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CachedMirror {
    pub key: SubscriptionKey,
    /// Current view
    pub items: Vec<Document>,
    /// Confirmed versions; absent in caches that only stored the view
    #[serde(default)]
    pub confirmed: Option<Vec<Document>>,
    #[serde(default)]
    pub stale: bool,
    pub saved_at: DateTime<Utc>,
}

/// All mirrors of the signed-in user
pub struct LocalMirror {
    mirrors: BTreeMap<SubscriptionKey, EntityMirror>,
    persistence: Arc<dyn LocalPersistence>,
}

impl LocalMirror {
    pub fn new(persistence: Arc<dyn LocalPersistence>) -> Self {
        Self {
            mirrors: BTreeMap::new(),
            persistence,
        }
    }

    /// Register a mirror for a subscription, seeded from its cache
    ///
    /// A restored mirror is stale until its first snapshot arrives. Returns
    /// whether cached items were restored.
    pub fn ensure(&mut self, key: &SubscriptionKey, query: &QueryDescriptor) -> bool {
        if let Some(mirror) = self.mirrors.get_mut(key) {
            mirror.order_by = query.order_by.clone();
            return false;
        }

        let mut mirror = EntityMirror {
            order_by: query.order_by.clone(),
            ..EntityMirror::default()
        };

        let cached = match Self::load_cached(self.persistence.as_ref(), key) {
            Ok(cached) => cached,
            Err(e) => {
                warn!("Ignoring unreadable cache for {}: {}", key, e);
                None
            }
        };
        let mut restored = false;
        if let Some(cached) = cached {
            mirror.entries = restore_entries(cached);
            if !mirror.entries.is_empty() {
                restored = true;
                mirror.stale = true;
                debug!("Restored {} cached item(s) for {}", mirror.entries.len(), key);
            }
        }

        self.mirrors.insert(key.clone(), mirror);
        restored
    }

    pub fn get(&self, key: &SubscriptionKey) -> Option<&EntityMirror> {
        self.mirrors.get(key)
    }

    pub fn keys(&self) -> Vec<SubscriptionKey> {
        self.mirrors.keys().cloned().collect()
    }

    /// Current view of one subscription
    pub fn slice(&self, key: &SubscriptionKey) -> Vec<Document> {
        self.mirrors.get(key).map(EntityMirror::slice).unwrap_or_default()
    }

    /// Current version of an entity in any mirror
    pub fn find_current(&self, entity: EntityType, id: &str) -> Option<Document> {
        self.entries_of(entity, id)
            .find_map(|e| e.current.clone())
    }

    /// Confirmed version of an entity in any mirror
    pub fn find_confirmed(&self, entity: EntityType, id: &str) -> Option<Document> {
        self.entries_of(entity, id)
            .find_map(|e| e.confirmed.clone())
    }

    fn entries_of<'a>(
        &'a self,
        entity: EntityType,
        id: &'a str,
    ) -> impl Iterator<Item = &'a MirrorEntry> + 'a {
        self.mirrors
            .iter()
            .filter(move |(key, _)| key.entity == entity)
            .filter_map(move |(_, mirror)| mirror.entries.get(id))
    }

    /// Replace a mirror's content with a full snapshot
    ///
    /// `items` pairs each confirmed remote version with the version to show
    /// (`None` while a local delete is pending). Local creates the store has
    /// not confirmed yet are kept.
    pub fn apply_snapshot(
        &mut self,
        key: &SubscriptionKey,
        items: Vec<(Document, Option<Document>)>,
    ) {
        let mirror = self.mirrors.entry(key.clone()).or_default();
        mirror.entries.retain(|_, e| e.confirmed.is_none() && e.current.is_some());
        for (confirmed, current) in items {
            if let Some(id) = document_id(&confirmed).map(str::to_string) {
                mirror.entries.insert(
                    id,
                    MirrorEntry {
                        confirmed: Some(confirmed),
                        current,
                    },
                );
            }
        }
        mirror.stale = false;
        self.save(key);
    }

    /// Apply an added or modified remote entity
    pub fn apply_upsert(
        &mut self,
        key: &SubscriptionKey,
        confirmed: Document,
        current: Option<Document>,
    ) {
        let Some(id) = document_id(&confirmed).map(str::to_string) else {
            warn!("Ignoring {} item without an id", key);
            return;
        };
        let mirror = self.mirrors.entry(key.clone()).or_default();
        mirror.entries.insert(
            id,
            MirrorEntry {
                confirmed: Some(confirmed),
                current,
            },
        );
        self.save(key);
    }

    /// Apply a remote removal
    pub fn apply_removed(&mut self, key: &SubscriptionKey, id: &str) {
        if let Some(mirror) = self.mirrors.get_mut(key) {
            mirror.entries.remove(id);
        }
        self.save(key);
    }

    /// Show a local mutation before the remote store confirms it
    ///
    /// Creates land in every mirror of the entity type whose scope covers
    /// the payload; updates and deletes touch the mirrors holding the entity.
    /// Returns the keys whose view changed.
    pub fn apply_optimistic(&mut self, record: &MutationRecord) -> Vec<SubscriptionKey> {
        let Some(id) = record.entity_id().map(str::to_string) else {
            return Vec::new();
        };
        let mut touched = Vec::new();

        for (key, mirror) in self.mirrors.iter_mut() {
            if key.entity != record.entity_type {
                continue;
            }
            let changed = match record.action {
                MutationAction::Create => {
                    if scope_covers(&key.scope, &record.payload) {
                        let entry = mirror.entries.entry(id.clone()).or_default();
                        entry.current = Some(record.payload.clone());
                        true
                    } else {
                        false
                    }
                }
                MutationAction::Update => match mirror.entries.get_mut(&id) {
                    Some(entry) => apply_to_entry(entry, record),
                    None => false,
                },
                MutationAction::Delete => match mirror.entries.get_mut(&id) {
                    Some(entry) => {
                        entry.current = None;
                        true
                    }
                    None => false,
                },
            };
            if changed {
                touched.push(key.clone());
            }
        }

        self.save_all(&touched);
        touched
    }

    /// Record that the remote store applied a mutation
    ///
    /// Only the confirmed side moves, so the returned keys are those where
    /// a confirmed create was not mirrored yet and now shows up. Every
    /// mirror holding the entity is saved.
    pub fn confirm(&mut self, record: &MutationRecord) -> Vec<SubscriptionKey> {
        let Some(id) = record.entity_id().map(str::to_string) else {
            return Vec::new();
        };
        let mut touched = Vec::new();
        let mut changed = Vec::new();

        for (key, mirror) in self.mirrors.iter_mut() {
            if key.entity != record.entity_type {
                continue;
            }
            if mirror.entries.contains_key(&id) {
                changed.push(key.clone());
            }
            match record.action {
                MutationAction::Create => {
                    if let Some(entry) = mirror.entries.get_mut(&id) {
                        entry.confirmed = Some(record.payload.clone());
                    } else if scope_covers(&key.scope, &record.payload) {
                        mirror.entries.insert(
                            id.clone(),
                            MirrorEntry {
                                confirmed: Some(record.payload.clone()),
                                current: Some(record.payload.clone()),
                            },
                        );
                        touched.push(key.clone());
                        changed.push(key.clone());
                    }
                }
                MutationAction::Update => {
                    if let Some(entry) = mirror.entries.get_mut(&id) {
                        let base = entry.confirmed.clone().unwrap_or_default();
                        entry.confirmed = Some(overlay(&base, &record.payload));
                    }
                }
                MutationAction::Delete => {
                    if let Some(entry) = mirror.entries.get_mut(&id) {
                        entry.confirmed = None;
                        if entry.current.is_none() {
                            mirror.entries.remove(&id);
                        }
                    }
                }
            }
        }

        self.save_all(&changed);
        touched
    }

    /// Revert an entity to its confirmed version, then replay `pending`
    ///
    /// An entity that was only ever created locally disappears unless a
    /// pending create brings it back.
    pub fn rollback(
        &mut self,
        entity: EntityType,
        id: &str,
        pending: &[&MutationRecord],
    ) -> Vec<SubscriptionKey> {
        let mut touched = Vec::new();

        for (key, mirror) in self.mirrors.iter_mut() {
            if key.entity != entity {
                continue;
            }
            let Some(entry) = mirror.entries.get_mut(id) else {
                continue;
            };
            entry.current = entry.confirmed.clone();
            for record in pending {
                apply_to_entry(entry, record);
            }
            if entry.current.is_none() && entry.confirmed.is_none() {
                mirror.entries.remove(id);
            }
            touched.push(key.clone());
        }

        if !touched.is_empty() {
            debug!("Rolled back {} {} in {} mirror(s)", entity, id, touched.len());
        }
        self.save_all(&touched);
        touched
    }

    /// Move an entity from a provisional id to the id the store assigned
    pub fn rekey(&mut self, entity: EntityType, from: &str, to: &str) -> Vec<SubscriptionKey> {
        let mut touched = Vec::new();
        for (key, mirror) in self.mirrors.iter_mut() {
            if key.entity != entity {
                continue;
            }
            let Some(mut entry) = mirror.entries.remove(from) else {
                continue;
            };
            for doc in [entry.confirmed.as_mut(), entry.current.as_mut()]
                .into_iter()
                .flatten()
            {
                doc.insert(ID_FIELD.to_string(), Value::String(to.to_string()));
            }
            mirror.entries.insert(to.to_string(), entry);
            touched.push(key.clone());
        }
        self.save_all(&touched);
        touched
    }

    /// Adopt a newer remote version of an entity everywhere it is mirrored,
    /// then replay `pending` on top of it
    pub fn refresh(
        &mut self,
        entity: EntityType,
        confirmed: &Document,
        pending: &[&MutationRecord],
    ) -> Vec<SubscriptionKey> {
        let Some(id) = document_id(confirmed).map(str::to_string) else {
            return Vec::new();
        };
        let mut touched = Vec::new();
        for (key, mirror) in self.mirrors.iter_mut() {
            if key.entity != entity {
                continue;
            }
            if let Some(entry) = mirror.entries.get_mut(&id) {
                entry.confirmed = Some(confirmed.clone());
                entry.current = Some(confirmed.clone());
                for record in pending {
                    apply_to_entry(entry, record);
                }
                touched.push(key.clone());
            }
        }
        self.save_all(&touched);
        touched
    }

    /// Drop a mirror (its cache stays, marked stale)
    pub fn remove(&mut self, key: &SubscriptionKey) {
        if self.mirrors.remove(key).is_some() {
            self.mark_stale(key);
        }
    }

    /// Drop every in-memory mirror; persisted caches are kept but marked stale
    pub fn clear(&mut self) {
        let keys: Vec<_> = self.mirrors.keys().cloned().collect();
        self.mirrors.clear();
        for key in &keys {
            self.mark_stale(key);
        }
    }

    /// Read one persisted cache
    pub fn load_cached(
        persistence: &dyn LocalPersistence,
        key: &SubscriptionKey,
    ) -> StorageResult<Option<CachedMirror>> {
        load_json(persistence, &key.storage_key())
    }

    /// Read every persisted cache, skipping unreadable ones
    pub fn cached_mirrors(persistence: &dyn LocalPersistence) -> StorageResult<Vec<CachedMirror>> {
        let mut caches = Vec::new();
        for storage_key in persistence.keys_with_prefix(MIRROR_KEY_PREFIX)? {
            match load_json::<CachedMirror>(persistence, &storage_key) {
                Ok(Some(cache)) => caches.push(cache),
                Ok(None) => {}
                Err(e) => warn!("Skipping unreadable mirror cache {}: {}", storage_key, e),
            }
        }
        Ok(caches)
    }

    fn mark_stale(&self, key: &SubscriptionKey) {
        match Self::load_cached(self.persistence.as_ref(), key) {
            Ok(Some(mut cache)) => {
                cache.stale = true;
                if let Err(e) = save_json(self.persistence.as_ref(), &key.storage_key(), &cache) {
                    error!("Failed to mark mirror cache {} stale: {}", key, e);
                }
            }
            Ok(None) => {}
            Err(e) => warn!("Unreadable mirror cache {}: {}", key, e),
        }
    }

    fn save_all(&self, keys: &[SubscriptionKey]) {
        for key in keys {
            self.save(key);
        }
    }

    fn save(&self, key: &SubscriptionKey) {
        let Some(mirror) = self.mirrors.get(key) else {
            return;
        };
        let cache = CachedMirror {
            key: key.clone(),
            items: mirror.slice(),
            confirmed: Some(
                mirror
                    .entries
                    .values()
                    .filter_map(|e| e.confirmed.clone())
                    .collect(),
            ),
            stale: mirror.stale,
            saved_at: Utc::now(),
        };
        if let Err(e) = save_json(self.persistence.as_ref(), &key.storage_key(), &cache) {
            error!("Failed to persist mirror {}: {}", key, e);
        }
    }
}

/// Rebuild entries from a cache, pairing each id's confirmed and current
/// versions
///
/// An id with only a current version is an unconfirmed local create; one
/// with only a confirmed version has a local delete pending. Caches without
/// confirmed versions treat the view as confirmed.
fn restore_entries(cached: CachedMirror) -> BTreeMap<String, MirrorEntry> {
    let mut entries: BTreeMap<String, MirrorEntry> = BTreeMap::new();
    let confirmed = match cached.confirmed {
        Some(confirmed) => confirmed,
        None => cached.items.clone(),
    };
    for doc in confirmed {
        if let Some(id) = document_id(&doc).map(str::to_string) {
            entries.entry(id).or_default().confirmed = Some(doc);
        }
    }
    for doc in cached.items {
        if let Some(id) = document_id(&doc).map(str::to_string) {
            entries.entry(id).or_default().current = Some(doc);
        }
    }
    entries
}

/// Apply a queued mutation to an entry's current version
fn apply_to_entry(entry: &mut MirrorEntry, record: &MutationRecord) -> bool {
    match record.action {
        MutationAction::Create => {
            entry.current = Some(record.payload.clone());
            true
        }
        MutationAction::Update => match entry.current.as_ref() {
            Some(current) => {
                entry.current = Some(overlay(current, &record.payload));
                true
            }
            None => false,
        },
        MutationAction::Delete => {
            entry.current = None;
            true
        }
    }
}

/// Whether a document falls inside a subscription scope
pub fn scope_covers(scope: &Scope, doc: &Document) -> bool {
    match scope {
        Scope::All => true,
        Scope::Equals { field, value } => doc.get(field).and_then(Value::as_str) == Some(value),
    }
}

/// Order two field values: numbers and timestamps chronologically, other
/// strings lexically, missing values first
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => match (timestamp_millis(a), timestamp_millis(b)) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => match (a.as_str(), b.as_str()) {
                (Some(x), Some(y)) => x.to_lowercase().cmp(&y.to_lowercase()),
                _ => Ordering::Equal,
            },
        },
    }
}
