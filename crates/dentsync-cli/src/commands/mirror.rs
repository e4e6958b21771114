//! Mirror command handlers

use anyhow::{bail, Context, Result};

use dentsync_core::mirror::CachedMirror;
use dentsync_core::{LocalMirror, LocalPersistence};

use crate::output::Output;

/// List persisted mirror caches
pub fn list(store: &dyn LocalPersistence, output: &Output) -> Result<()> {
    let caches = LocalMirror::cached_mirrors(store).context("Failed to read mirror caches")?;
    output.print_mirrors(&caches);
    Ok(())
}

/// Show the documents of one mirror cache
///
/// `key` is either the full subscription key (`appointment[patientId=p1]`)
/// or an entity name when only one cache of that entity exists.
pub fn show(store: &dyn LocalPersistence, key: &str, output: &Output) -> Result<()> {
    let caches = LocalMirror::cached_mirrors(store).context("Failed to read mirror caches")?;
    let cache = find_cache(caches, key)?;
    output.print_mirror(&cache);
    Ok(())
}

fn find_cache(caches: Vec<CachedMirror>, key: &str) -> Result<CachedMirror> {
    let mut matches: Vec<CachedMirror> = caches
        .into_iter()
        .filter(|c| {
            c.key.to_string() == key
                || c.key.storage_key() == key
                || c.key.entity.as_str().eq_ignore_ascii_case(key)
        })
        .collect();

    match matches.len() {
        0 => bail!(
            "No cached mirror matches '{}'. Run `dentsync mirror list` to see the cached keys.",
            key
        ),
        1 => Ok(matches.remove(0)),
        _ => {
            // An exact key beats an entity-name match
            if let Some(pos) = matches.iter().position(|c| c.key.to_string() == key) {
                return Ok(matches.remove(pos));
            }
            let keys: Vec<String> = matches.iter().map(|c| c.key.to_string()).collect();
            bail!("'{}' is ambiguous: {}", key, keys.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use dentsync_core::subscriptions::Scope;
    use dentsync_core::{EntityType, SubscriptionKey};

    fn cache(entity: EntityType, scope: Scope) -> CachedMirror {
        CachedMirror {
            key: SubscriptionKey::new(entity, scope),
            items: Vec::new(),
            confirmed: Some(Vec::new()),
            stale: false,
            saved_at: Utc::now(),
        }
    }

    fn caches() -> Vec<CachedMirror> {
        vec![
            cache(EntityType::Appointment, Scope::equals("patientId", "p1")),
            cache(EntityType::Appointment, Scope::equals("patientId", "p2")),
            cache(EntityType::Service, Scope::All),
        ]
    }

    #[test]
    fn test_find_by_full_key() {
        let found = find_cache(caches(), "appointment[patientId=p2]").unwrap();
        assert_eq!(found.key.scope, Scope::equals("patientId", "p2"));
    }

    #[test]
    fn test_find_by_entity_name() {
        let found = find_cache(caches(), "service").unwrap();
        assert_eq!(found.key.entity, EntityType::Service);
    }

    #[test]
    fn test_ambiguous_entity_name() {
        let err = find_cache(caches(), "appointment").unwrap_err();
        assert!(err.to_string().contains("ambiguous"));
    }

    #[test]
    fn test_missing_key() {
        let err = find_cache(caches(), "payment").unwrap_err();
        assert!(err.to_string().contains("No cached mirror"));
    }
}
