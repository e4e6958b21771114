//! Queue command handlers
//!
//! Inspect and repair the persisted mutation queue while the app is closed.

use std::sync::Arc;

use anyhow::{Context, Result};

use dentsync_core::queue::QueuedMutation;
use dentsync_core::{Config, LocalPersistence, SyncQueue};

use crate::output::Output;

fn load(store: Arc<dyn LocalPersistence>, config: &Config) -> SyncQueue {
    SyncQueue::load(store, config.queue_capacity, config.max_retries)
}

/// List pending mutations, oldest first
pub fn list(store: Arc<dyn LocalPersistence>, config: &Config, output: &Output) -> Result<()> {
    let queue = load(store, config);
    let entries: Vec<&QueuedMutation> = queue.entries().collect();
    output.print_queue(&entries);
    Ok(())
}

/// List mutations that exhausted their retries
pub fn dead_letters(
    store: Arc<dyn LocalPersistence>,
    config: &Config,
    output: &Output,
) -> Result<()> {
    let queue = load(store, config);
    output.print_dead_letters(queue.dead_letters());
    Ok(())
}

/// Move every dead letter back into the queue
pub fn retry_dead(
    store: Arc<dyn LocalPersistence>,
    config: &Config,
    output: &Output,
) -> Result<()> {
    let mut queue = load(store, config);
    let retry = queue.retry_dead_letters();
    if retry.count() == 0 {
        output.message("No dead letters to retry.");
        return Ok(());
    }
    queue.persist().context("Failed to save sync queue")?;
    output.success(&format!(
        "Requeued {} dead letter(s); they are written on the next flush",
        retry.count()
    ));
    if !retry.evicted.is_empty() {
        output.message(&format!(
            "Queue full: dropped {} older pending mutation(s)",
            retry.evicted.len()
        ));
    }
    Ok(())
}

/// Discard every dead letter
pub fn purge_dead(
    store: Arc<dyn LocalPersistence>,
    config: &Config,
    output: &Output,
) -> Result<()> {
    let mut queue = load(store, config);
    let count = queue.purge_dead_letters();
    if count == 0 {
        output.message("No dead letters to purge.");
        return Ok(());
    }
    queue.persist().context("Failed to save sync queue")?;
    output.success(&format!("Purged {} dead letter(s)", count));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputFormat;
    use dentsync_core::document::from_value;
    use dentsync_core::{EntityType, MemoryPersistence, MutationAction, MutationRecord};
    use serde_json::json;

    fn record(id: &str) -> MutationRecord {
        let payload = from_value(json!({"id": id, "status": "confirmed"})).unwrap();
        MutationRecord::new(EntityType::Appointment, MutationAction::Update, payload)
    }

    /// A store holding one pending and one dead-lettered mutation
    fn seeded(config: &Config) -> MemoryPersistence {
        let store = MemoryPersistence::new();
        let mut queue = SyncQueue::load(Arc::new(store.clone()), config.queue_capacity, 1);
        let doomed = record("a1");
        let doomed_id = doomed.id;
        queue.enqueue(doomed);
        queue.requeue(doomed_id, "unavailable");
        queue.enqueue(record("a2"));
        store
    }

    fn quiet() -> Output {
        Output::new(OutputFormat::Quiet)
    }

    #[test]
    fn test_retry_dead_requeues_at_tail() {
        let config = Config::default();
        let store = seeded(&config);

        retry_dead(Arc::new(store.clone()), &config, &quiet()).unwrap();

        let queue = SyncQueue::load(Arc::new(store), config.queue_capacity, config.max_retries);
        assert!(queue.dead_letters().is_empty());
        let ids: Vec<_> = queue
            .entries()
            .map(|e| e.record.entity_id().unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["a2", "a1"]);
        assert!(queue.entries().all(|e| e.attempts == 0));
    }

    #[test]
    fn test_purge_dead_keeps_pending() {
        let config = Config::default();
        let store = seeded(&config);

        purge_dead(Arc::new(store.clone()), &config, &quiet()).unwrap();

        let queue = SyncQueue::load(Arc::new(store), config.queue_capacity, config.max_retries);
        assert!(queue.dead_letters().is_empty());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_empty_store() {
        let config = Config::default();
        let store: Arc<dyn LocalPersistence> = Arc::new(MemoryPersistence::new());
        list(store.clone(), &config, &quiet()).unwrap();
        dead_letters(store.clone(), &config, &quiet()).unwrap();
        retry_dead(store.clone(), &config, &quiet()).unwrap();
        purge_dead(store, &config, &quiet()).unwrap();
    }
}
