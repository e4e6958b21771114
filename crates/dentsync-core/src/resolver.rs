//! Conflict resolution
//!
//! Picks the winning field set when a local, not yet confirmed version of an
//! entity meets a different remote version. Resolution is a pure function of
//! its inputs and the configured per-entity policy.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::document::{is_empty_value, timestamp_millis, Document};
use crate::models::EntityType;

/// Strategy used to settle a local/remote divergence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// The remote version wins
    #[default]
    ServerWins,
    /// The local version wins
    ClientWins,
    /// Non-empty local fields are written over the remote version
    Merge,
    /// The version with the newer `updatedAt` (or `createdAt`) wins
    LatestTimestamp,
}

impl ConflictPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictPolicy::ServerWins => "server-wins",
            ConflictPolicy::ClientWins => "client-wins",
            ConflictPolicy::Merge => "merge",
            ConflictPolicy::LatestTimestamp => "latest-timestamp",
        }
    }
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "server-wins" | "server" => Ok(ConflictPolicy::ServerWins),
            "client-wins" | "client" => Ok(ConflictPolicy::ClientWins),
            "merge" => Ok(ConflictPolicy::Merge),
            "latest-timestamp" | "timestamp" => Ok(ConflictPolicy::LatestTimestamp),
            other => Err(format!(
                "Unknown conflict policy '{}'. Valid policies: server-wins, client-wins, merge, latest-timestamp",
                other
            )),
        }
    }
}

/// Per-entity policy table
#[derive(Debug, Clone, Default)]
pub struct ConflictResolver {
    policies: HashMap<EntityType, ConflictPolicy>,
}

impl ConflictResolver {
    /// Resolver using server-wins for every entity type
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the policy for one entity type
    pub fn with_policy(mut self, entity: EntityType, policy: ConflictPolicy) -> Self {
        self.policies.insert(entity, policy);
        self
    }

    pub fn set_policy(&mut self, entity: EntityType, policy: ConflictPolicy) {
        self.policies.insert(entity, policy);
    }

    pub fn policy_for(&self, entity: EntityType) -> ConflictPolicy {
        self.policies.get(&entity).copied().unwrap_or_default()
    }

    /// Select the winning version
    pub fn resolve(&self, local: &Document, remote: &Document, entity: EntityType) -> Document {
        match self.policy_for(entity) {
            ConflictPolicy::ServerWins => remote.clone(),
            ConflictPolicy::ClientWins => local.clone(),
            ConflictPolicy::Merge => merge(local, remote),
            ConflictPolicy::LatestTimestamp => {
                if version_millis(local) > version_millis(remote) {
                    local.clone()
                } else {
                    remote.clone()
                }
            }
        }
    }
}

fn merge(local: &Document, remote: &Document) -> Document {
    let mut merged = remote.clone();
    for (key, value) in local {
        if !is_empty_value(value) {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

fn version_millis(doc: &Document) -> i64 {
    doc.get("updatedAt")
        .and_then(timestamp_millis)
        .or_else(|| doc.get("createdAt").and_then(timestamp_millis))
        .unwrap_or(0)
}
