//! Data models for dentsync
//!
//! Defines the entity types the clinic syncs, the mutation records the queue
//! stores, and the signed-in identity.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::document::{document_id, Document};

/// The unit of subscription and mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Appointment,
    Patient,
    Service,
    Treatment,
    Payment,
    Notification,
}

impl EntityType {
    /// Every entity type, in declaration order
    pub const ALL: [EntityType; 6] = [
        EntityType::Appointment,
        EntityType::Patient,
        EntityType::Service,
        EntityType::Treatment,
        EntityType::Payment,
        EntityType::Notification,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Appointment => "appointment",
            EntityType::Patient => "patient",
            EntityType::Service => "service",
            EntityType::Treatment => "treatment",
            EntityType::Payment => "payment",
            EntityType::Notification => "notification",
        }
    }

    /// Name of the remote collection backing this entity type
    ///
    /// Patients live in the shared `users` collection alongside dentists.
    pub fn collection(&self) -> &'static str {
        match self {
            EntityType::Appointment => "appointments",
            EntityType::Patient => "users",
            EntityType::Service => "services",
            EntityType::Treatment => "treatments",
            EntityType::Payment => "payments",
            EntityType::Notification => "notifications",
        }
    }

    /// Name of the UI event emitted when this entity's mirror changes
    pub fn updated_event_name(&self) -> String {
        format!("{}Updated", self.as_str())
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown entity type name
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unknown entity type '{0}'. Valid types: appointment, patient, service, treatment, payment, notification")]
pub struct UnknownEntityType(pub String);

impl FromStr for EntityType {
    type Err = UnknownEntityType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityType::ALL
            .into_iter()
            .find(|entity| entity.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownEntityType(s.to_string()))
    }
}

/// Kind of mutation applied to an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationAction {
    Create,
    Update,
    Delete,
}

impl MutationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationAction::Create => "create",
            MutationAction::Update => "update",
            MutationAction::Delete => "delete",
        }
    }
}

impl fmt::Display for MutationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pending local mutation waiting to be applied remotely
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MutationRecord {
    /// Unique identifier within the queue
    pub id: Uuid,
    /// Entity type the mutation targets
    pub entity_type: EntityType,
    /// Create, update or delete
    pub action: MutationAction,
    /// Field set to write (for delete, at least the entity id)
    pub payload: Document,
    /// When the mutation was enqueued
    pub enqueued_at: DateTime<Utc>,
    /// Last confirmed field set the mutation was made against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<Document>,
}

impl MutationRecord {
    /// Create a new record stamped with a fresh id and the current time
    pub fn new(entity_type: EntityType, action: MutationAction, payload: Document) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_type,
            action,
            payload,
            enqueued_at: Utc::now(),
            base: None,
        }
    }

    /// Attach the confirmed state the mutation was based on
    pub fn with_base(mut self, base: Option<Document>) -> Self {
        self.base = base;
        self
    }

    /// Id of the entity this record mutates
    pub fn entity_id(&self) -> Option<&str> {
        document_id(&self.payload)
    }

    /// Whether this record targets the given entity
    pub fn targets(&self, entity_type: EntityType, entity_id: &str) -> bool {
        self.entity_type == entity_type && self.entity_id() == Some(entity_id)
    }
}

/// Role of the signed-in user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Patient,
    Dentist,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Patient => "patient",
            Role::Dentist => "dentist",
        }
    }

    /// Read the role from a user profile document
    ///
    /// Profiles without a recognizable role are treated as patients.
    pub fn from_profile(profile: &Document) -> Self {
        match profile.get("role").and_then(|v| v.as_str()) {
            Some(role) if role.eq_ignore_ascii_case("dentist") => Role::Dentist,
            _ => Role::Patient,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The signed-in user as reported by the identity provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// Stable user id
    pub user_id: String,
    /// Email address, if known
    #[serde(default)]
    pub email: Option<String>,
    /// Role, when the provider already knows it
    #[serde(default)]
    pub role: Option<Role>,
}

impl Identity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            email: None,
            role: None,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entity_type_names() {
        assert_eq!(EntityType::Appointment.as_str(), "appointment");
        assert_eq!(EntityType::Patient.collection(), "users");
        assert_eq!(
            EntityType::Appointment.updated_event_name(),
            "appointmentUpdated"
        );
        assert_eq!(EntityType::Notification.to_string(), "notification");
    }

    #[test]
    fn test_entity_type_from_str() {
        assert_eq!("payment".parse::<EntityType>(), Ok(EntityType::Payment));
        assert_eq!("Service".parse::<EntityType>(), Ok(EntityType::Service));
        assert!("invoice".parse::<EntityType>().is_err());
    }

    #[test]
    fn test_mutation_record_serialization() {
        let payload = json!({"id": "apt-1", "status": "confirmed"})
            .as_object()
            .cloned()
            .unwrap();
        let record = MutationRecord::new(EntityType::Appointment, MutationAction::Update, payload);

        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"entityType\":\"appointment\""));
        assert!(json.contains("\"action\":\"update\""));
        assert!(json.contains("\"enqueuedAt\""));
        assert!(!json.contains("\"base\""));

        let parsed: MutationRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, record);
        assert_eq!(parsed.entity_id(), Some("apt-1"));
        assert!(parsed.targets(EntityType::Appointment, "apt-1"));
        assert!(!parsed.targets(EntityType::Payment, "apt-1"));
    }

    #[test]
    fn test_role_from_profile() {
        let dentist = json!({"role": "dentist"}).as_object().cloned().unwrap();
        let patient = json!({"role": "patient"}).as_object().cloned().unwrap();
        let unknown = json!({"name": "x"}).as_object().cloned().unwrap();

        assert_eq!(Role::from_profile(&dentist), Role::Dentist);
        assert_eq!(Role::from_profile(&patient), Role::Patient);
        assert_eq!(Role::from_profile(&unknown), Role::Patient);
    }

    #[test]
    fn test_identity_builder() {
        let identity = Identity::new("u1")
            .with_email("a@b.c")
            .with_role(Role::Dentist);
        assert_eq!(identity.user_id, "u1");
        assert_eq!(identity.email.as_deref(), Some("a@b.c"));
        assert_eq!(identity.role, Some(Role::Dentist));
    }
}
