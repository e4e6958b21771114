//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use serde::Serialize;

use dentsync_core::document::{document_id, Document};
use dentsync_core::mirror::CachedMirror;
use dentsync_core::queue::{DeadLetter, QueuedMutation};
use dentsync_core::MutationRecord;

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Print any serializable value as pretty JSON
    pub fn print_json<T: Serialize + ?Sized>(&self, value: &T) {
        match serde_json::to_string_pretty(value) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("Failed to encode output: {}", e),
        }
    }

    /// Print the pending mutations
    pub fn print_queue(&self, entries: &[&QueuedMutation]) {
        match self.format {
            OutputFormat::Human => {
                if entries.is_empty() {
                    println!("No pending mutations.");
                    return;
                }
                for entry in entries {
                    let attempts = if entry.attempts > 0 {
                        format!(" (attempts: {})", entry.attempts)
                    } else {
                        String::new()
                    };
                    println!("{}{}", record_line(&entry.record), attempts);
                }
                println!("\n{} pending mutation(s)", entries.len());
            }
            OutputFormat::Json => self.print_json(entries),
            OutputFormat::Quiet => {
                for entry in entries {
                    println!("{}", entry.record.id);
                }
            }
        }
    }

    /// Print the dead-letter list
    pub fn print_dead_letters(&self, dead: &[DeadLetter]) {
        match self.format {
            OutputFormat::Human => {
                if dead.is_empty() {
                    println!("No dead letters.");
                    return;
                }
                for letter in dead {
                    println!(
                        "{} | {} attempt(s) | {}",
                        record_line(&letter.record),
                        letter.attempts,
                        letter.dead_lettered_at.format("%Y-%m-%d %H:%M")
                    );
                    if let Some(ref error) = letter.last_error {
                        println!("    last error: {}", truncate(error, 70));
                    }
                }
                println!("\n{} dead letter(s)", dead.len());
            }
            OutputFormat::Json => self.print_json(dead),
            OutputFormat::Quiet => {
                for letter in dead {
                    println!("{}", letter.record.id);
                }
            }
        }
    }

    /// Print a summary line per cached mirror
    pub fn print_mirrors(&self, caches: &[CachedMirror]) {
        match self.format {
            OutputFormat::Human => {
                if caches.is_empty() {
                    println!("No cached mirrors.");
                    return;
                }
                for cache in caches {
                    println!(
                        "{} | {} item(s) | saved {}{}",
                        cache.key,
                        cache.items.len(),
                        cache.saved_at.format("%Y-%m-%d %H:%M"),
                        if cache.stale { " | stale" } else { "" }
                    );
                }
                println!("\n{} mirror(s)", caches.len());
            }
            OutputFormat::Json => {
                let summary: Vec<_> = caches
                    .iter()
                    .map(|c| {
                        serde_json::json!({
                            "key": c.key.to_string(),
                            "items": c.items.len(),
                            "stale": c.stale,
                            "savedAt": c.saved_at,
                        })
                    })
                    .collect();
                self.print_json(&summary);
            }
            OutputFormat::Quiet => {
                for cache in caches {
                    println!("{}", cache.key);
                }
            }
        }
    }

    /// Print the documents of one cached mirror
    pub fn print_mirror(&self, cache: &CachedMirror) {
        match self.format {
            OutputFormat::Human => {
                println!("Mirror:  {}", cache.key);
                println!("Saved:   {}", cache.saved_at.format("%Y-%m-%d %H:%M:%S"));
                println!("Stale:   {}", cache.stale);
                println!();
                if cache.items.is_empty() {
                    println!("No documents.");
                    return;
                }
                for doc in &cache.items {
                    println!("{}", document_line(doc));
                }
                println!("\n{} document(s)", cache.items.len());
            }
            OutputFormat::Json => self.print_json(&cache.items),
            OutputFormat::Quiet => {
                for doc in &cache.items {
                    println!("{}", document_id(doc).unwrap_or("-"));
                }
            }
        }
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"status": "success", "message": message})
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print an informational message
    pub fn message(&self, msg: &str) {
        match self.format {
            OutputFormat::Human => println!("{}", msg),
            OutputFormat::Json => {
                println!("{}", serde_json::json!({"message": msg}));
            }
            OutputFormat::Quiet => {}
        }
    }
}

/// One-line summary of a queued record
fn record_line(record: &MutationRecord) -> String {
    format!(
        "{} | {:<6} {:<12} {} | {}",
        short_id(&record.id.to_string()),
        record.action,
        record.entity_type,
        record.entity_id().unwrap_or("-"),
        record.enqueued_at.format("%Y-%m-%d %H:%M")
    )
}

/// One-line summary of a mirrored document
fn document_line(doc: &Document) -> String {
    let id = document_id(doc).unwrap_or("-");
    let fields: Vec<String> = doc
        .iter()
        .filter(|(k, _)| k.as_str() != "id")
        .map(|(k, v)| match v.as_str() {
            Some(s) => format!("{}={}", k, s),
            None => format!("{}={}", k, v),
        })
        .collect();
    format!("{} | {}", id, truncate(&fields.join(", "), 90))
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

/// Truncate a string to max length, adding "..." if truncated
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dentsync_core::document::from_value;
    use dentsync_core::{EntityType, MutationAction};
    use serde_json::json;

    #[test]
    fn test_format_from_flags() {
        assert_eq!(OutputFormat::from_flags(false, false), OutputFormat::Human);
        assert_eq!(OutputFormat::from_flags(true, false), OutputFormat::Json);
        assert_eq!(OutputFormat::from_flags(false, true), OutputFormat::Quiet);
        // Quiet takes precedence
        assert_eq!(OutputFormat::from_flags(true, true), OutputFormat::Quiet);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("this is a long string", 10), "this is...");
        assert_eq!(truncate("ñandú ñandú ñandú", 8), "ñandú...");
    }

    #[test]
    fn test_record_line() {
        let payload = from_value(json!({"id": "a1", "status": "confirmed"})).unwrap();
        let record = MutationRecord::new(EntityType::Appointment, MutationAction::Update, payload);
        let line = record_line(&record);
        assert!(line.starts_with(short_id(&record.id.to_string())));
        assert!(line.contains("update"));
        assert!(line.contains("appointment"));
        assert!(line.contains("a1"));
    }

    #[test]
    fn test_document_line() {
        let doc = from_value(json!({"id": "s1", "name": "Cleaning", "price": 1500})).unwrap();
        assert_eq!(document_line(&doc), "s1 | name=Cleaning, price=1500");
    }
}
