//! Per-entity payload schemas
//!
//! Local mutations are validated here before they reach the queue, so the
//! remote store only ever sees payloads with the fields it expects. Unknown
//! fields pass through; known fields are type-checked.

use serde_json::Value;

use crate::document::{document_id, is_empty_value, timestamp_millis, Document, ID_FIELD};
use crate::error::ValidationError;
use crate::models::{EntityType, MutationAction};

/// JSON shape a field must have
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Number,
    Bool,
    /// RFC 3339 string, epoch millis, or `{seconds, nanoseconds}`
    Timestamp,
    /// Text restricted to a fixed set of values
    OneOf(&'static [&'static str]),
}

impl FieldKind {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldKind::Text => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Bool => value.is_boolean(),
            FieldKind::Timestamp => timestamp_millis(value).is_some(),
            FieldKind::OneOf(allowed) => value
                .as_str()
                .map(|s| allowed.iter().any(|a| a.eq_ignore_ascii_case(s)))
                .unwrap_or(false),
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            FieldKind::Text => "a string",
            FieldKind::Number => "a number",
            FieldKind::Bool => "a boolean",
            FieldKind::Timestamp => "a timestamp",
            FieldKind::OneOf(_) => "one of the allowed values",
        }
    }
}

/// A known field of an entity
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required_on_create: bool,
}

const fn required(name: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec {
        name,
        kind,
        required_on_create: true,
    }
}

const fn optional(name: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec {
        name,
        kind,
        required_on_create: false,
    }
}

pub const APPOINTMENT_STATUSES: &[&str] =
    &["pending", "confirmed", "completed", "cancelled", "rescheduled"];

const APPOINTMENT_FIELDS: &[FieldSpec] = &[
    required("patientId", FieldKind::Text),
    required("appointmentDate", FieldKind::Timestamp),
    required("service", FieldKind::Text),
    optional("dentistId", FieldKind::Text),
    optional("appointmentTime", FieldKind::Text),
    optional("status", FieldKind::OneOf(APPOINTMENT_STATUSES)),
    optional("amount", FieldKind::Number),
    optional("notes", FieldKind::Text),
];

const PATIENT_FIELDS: &[FieldSpec] = &[
    required("name", FieldKind::Text),
    required("email", FieldKind::Text),
    optional("phone", FieldKind::Text),
    optional("dateOfBirth", FieldKind::Timestamp),
    optional("gender", FieldKind::Text),
    optional("address", FieldKind::Text),
    optional("role", FieldKind::OneOf(&["patient", "dentist"])),
    optional("isActive", FieldKind::Bool),
    optional("status", FieldKind::Text),
];

const SERVICE_FIELDS: &[FieldSpec] = &[
    required("name", FieldKind::Text),
    required("price", FieldKind::Number),
    optional("description", FieldKind::Text),
    optional("duration", FieldKind::Number),
    optional("status", FieldKind::OneOf(&["active", "inactive"])),
];

const TREATMENT_FIELDS: &[FieldSpec] = &[
    required("patientId", FieldKind::Text),
    required("treatmentDate", FieldKind::Timestamp),
    required("name", FieldKind::Text),
    optional("dentistId", FieldKind::Text),
    optional("status", FieldKind::Text),
    optional("cost", FieldKind::Number),
    optional("notes", FieldKind::Text),
];

const PAYMENT_FIELDS: &[FieldSpec] = &[
    required("patientId", FieldKind::Text),
    required("amount", FieldKind::Number),
    optional("paymentDate", FieldKind::Timestamp),
    optional("service", FieldKind::Text),
    optional("method", FieldKind::Text),
    optional("status", FieldKind::OneOf(&["pending", "paid", "refunded"])),
];

const NOTIFICATION_FIELDS: &[FieldSpec] = &[
    required("userId", FieldKind::Text),
    required("title", FieldKind::Text),
    required("message", FieldKind::Text),
    optional("type", FieldKind::OneOf(&["info", "success", "warning", "error"])),
    optional("read", FieldKind::Bool),
];

/// Schema for one entity type
#[derive(Debug, Clone, Copy)]
pub struct EntitySchema {
    pub entity: EntityType,
    pub fields: &'static [FieldSpec],
}

/// Look up the schema for an entity type
pub fn schema_for(entity: EntityType) -> EntitySchema {
    let fields = match entity {
        EntityType::Appointment => APPOINTMENT_FIELDS,
        EntityType::Patient => PATIENT_FIELDS,
        EntityType::Service => SERVICE_FIELDS,
        EntityType::Treatment => TREATMENT_FIELDS,
        EntityType::Payment => PAYMENT_FIELDS,
        EntityType::Notification => NOTIFICATION_FIELDS,
    };
    EntitySchema { entity, fields }
}

impl EntitySchema {
    /// Validate a payload for the given action
    ///
    /// - create: every required field present and non-empty
    /// - update: an id plus at least one other field
    /// - delete: an id
    ///
    /// Known fields present in the payload must have the right shape.
    pub fn validate(&self, action: MutationAction, payload: &Document) -> Result<(), ValidationError> {
        match action {
            MutationAction::Create => {
                for spec in self.fields.iter().filter(|s| s.required_on_create) {
                    let present = payload
                        .get(spec.name)
                        .map(|v| !is_empty_value(v))
                        .unwrap_or(false);
                    if !present {
                        return Err(ValidationError::MissingField {
                            entity: self.entity,
                            action,
                            field: spec.name,
                        });
                    }
                }
            }
            MutationAction::Update | MutationAction::Delete => {
                if document_id(payload).is_none() {
                    return Err(ValidationError::MissingField {
                        entity: self.entity,
                        action,
                        field: ID_FIELD,
                    });
                }
                if action == MutationAction::Update && payload.len() < 2 {
                    return Err(ValidationError::EmptyUpdate {
                        entity: self.entity,
                    });
                }
            }
        }

        if action != MutationAction::Delete {
            self.check_kinds(payload)?;
        }
        Ok(())
    }

    fn check_kinds(&self, payload: &Document) -> Result<(), ValidationError> {
        for spec in self.fields {
            let Some(value) = payload.get(spec.name) else {
                continue;
            };
            if value.is_null() && !spec.required_on_create {
                continue;
            }
            if !spec.kind.accepts(value) {
                return Err(ValidationError::InvalidField {
                    entity: self.entity,
                    field: spec.name.to_string(),
                    expected: spec.kind.describe(),
                });
            }
        }
        Ok(())
    }
}

/// Validate a payload against its entity's schema
pub fn validate(
    entity: EntityType,
    action: MutationAction,
    payload: &Document,
) -> Result<(), ValidationError> {
    schema_for(entity).validate(action, payload)
}
