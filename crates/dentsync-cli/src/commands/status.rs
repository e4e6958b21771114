//! Status command handler

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use dentsync_core::{Config, LocalMirror, LocalPersistence, SyncQueue};

use crate::output::{Output, OutputFormat};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MirrorStatus {
    key: String,
    items: usize,
    stale: bool,
    saved_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusReport {
    data_dir: String,
    database: String,
    queue_length: usize,
    dead_letters: usize,
    oldest_pending: Option<DateTime<Utc>>,
    mirrors: Vec<MirrorStatus>,
}

fn collect(store: Arc<dyn LocalPersistence>, config: &Config) -> Result<StatusReport> {
    let caches =
        LocalMirror::cached_mirrors(store.as_ref()).context("Failed to read mirror caches")?;
    let queue = SyncQueue::load(store, config.queue_capacity, config.max_retries);

    let report = StatusReport {
        data_dir: config.data_dir.display().to_string(),
        database: config.sqlite_path().display().to_string(),
        queue_length: queue.len(),
        dead_letters: queue.dead_letters().len(),
        oldest_pending: queue.entries().next().map(|e| e.record.enqueued_at),
        mirrors: caches
            .into_iter()
            .map(|c| MirrorStatus {
                key: c.key.to_string(),
                items: c.items.len(),
                stale: c.stale,
                saved_at: c.saved_at,
            })
            .collect(),
    };
    Ok(report)
}

/// Show status information
pub fn show(store: Arc<dyn LocalPersistence>, config: &Config, output: &Output) -> Result<()> {
    let report = collect(store, config)?;

    match output.format {
        OutputFormat::Json => output.print_json(&report),
        OutputFormat::Quiet => {
            println!("{} {}", report.queue_length, report.dead_letters);
        }
        OutputFormat::Human => {
            println!("dentsync Status");
            println!("===============");
            println!();
            println!("Storage:");
            println!("  Location: {}", report.data_dir);
            println!("  Database: {}", report.database);
            println!();
            println!("Queue:");
            println!("  Pending:      {}", report.queue_length);
            println!("  Dead letters: {}", report.dead_letters);
            if let Some(oldest) = report.oldest_pending {
                println!("  Oldest:       {}", oldest.format("%Y-%m-%d %H:%M:%S"));
            }
            println!();
            println!("Mirrors:");
            if report.mirrors.is_empty() {
                println!("  (none cached)");
            }
            for mirror in &report.mirrors {
                println!(
                    "  {:<32} {:>4} item(s){}",
                    mirror.key,
                    mirror.items,
                    if mirror.stale { "  stale" } else { "" }
                );
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dentsync_core::document::from_value;
    use dentsync_core::remote::QueryDescriptor;
    use dentsync_core::subscriptions::Scope;
    use dentsync_core::{
        EntityType, MemoryPersistence, MutationAction, MutationRecord, SubscriptionKey,
    };
    use serde_json::json;

    #[test]
    fn test_collect_empty() {
        let config = Config::default();
        let report = collect(Arc::new(MemoryPersistence::new()), &config).unwrap();
        assert_eq!(report.queue_length, 0);
        assert_eq!(report.dead_letters, 0);
        assert!(report.oldest_pending.is_none());
        assert!(report.mirrors.is_empty());
    }

    #[test]
    fn test_collect_queue_and_mirrors() {
        let config = Config::default();
        let store = MemoryPersistence::new();
        let shared: Arc<dyn LocalPersistence> = Arc::new(store.clone());

        let mut queue = SyncQueue::load(shared.clone(), 10, 5);
        let payload = from_value(json!({"id": "a1", "status": "cancelled"})).unwrap();
        let record = MutationRecord::new(EntityType::Appointment, MutationAction::Update, payload);
        let enqueued_at = record.enqueued_at;
        queue.enqueue(record);

        let key = SubscriptionKey::new(EntityType::Service, Scope::All);
        let mut mirror = LocalMirror::new(shared.clone());
        mirror.ensure(&key, &QueryDescriptor::all());
        let doc = from_value(json!({"id": "s1", "name": "Cleaning"})).unwrap();
        mirror.apply_snapshot(&key, vec![(doc.clone(), Some(doc))]);

        let report = collect(shared, &config).unwrap();
        assert_eq!(report.queue_length, 1);
        assert_eq!(report.oldest_pending, Some(enqueued_at));
        assert_eq!(report.mirrors.len(), 1);
        assert_eq!(report.mirrors[0].key, "service[all]");
        assert_eq!(report.mirrors[0].items, 1);
        assert!(!report.mirrors[0].stale);
    }
}
