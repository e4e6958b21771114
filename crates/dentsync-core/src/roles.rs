//! Role-based subscription table
//!
//! Which live queries a signed-in user gets depends on their role. Patients
//! see their own appointments, treatments, payments and notifications;
//! dentists see their schedule, the patient list and the service catalogue.

use crate::models::{EntityType, Role};
use crate::remote::{QueryDescriptor, SortDirection};
use crate::subscriptions::{Scope, SubscriptionKey};

/// Notifications are capped at the most recent ones
pub const NOTIFICATION_LIMIT: usize = 20;

/// One live query to open for a user
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionPlan {
    pub key: SubscriptionKey,
    pub query: QueryDescriptor,
}

impl SubscriptionPlan {
    fn owned(entity: EntityType, field: &str, uid: &str) -> Self {
        Self {
            key: SubscriptionKey::new(entity, Scope::equals(field, uid)),
            query: QueryDescriptor::all().filter(field, uid),
        }
    }

    fn sorted(mut self, field: &str, direction: SortDirection) -> Self {
        self.query = self.query.order_by(field, direction);
        self
    }

    fn limited(mut self, limit: usize) -> Self {
        self.query = self.query.limit(limit);
        self
    }
}

/// Live queries for a user with the given role
pub fn subscriptions_for(role: Role, uid: &str) -> Vec<SubscriptionPlan> {
    use SortDirection::{Ascending, Descending};

    let notifications = SubscriptionPlan::owned(EntityType::Notification, "userId", uid)
        .sorted("createdAt", Descending)
        .limited(NOTIFICATION_LIMIT);

    match role {
        Role::Patient => vec![
            SubscriptionPlan::owned(EntityType::Appointment, "patientId", uid)
                .sorted("appointmentDate", Ascending),
            SubscriptionPlan::owned(EntityType::Treatment, "patientId", uid)
                .sorted("treatmentDate", Descending),
            SubscriptionPlan::owned(EntityType::Payment, "patientId", uid)
                .sorted("paymentDate", Descending),
            notifications,
        ],
        Role::Dentist => vec![
            SubscriptionPlan::owned(EntityType::Appointment, "dentistId", uid)
                .sorted("appointmentDate", Ascending),
            SubscriptionPlan {
                key: SubscriptionKey::new(EntityType::Patient, Scope::equals("role", "patient")),
                query: QueryDescriptor::all().filter("role", "patient"),
            }
            .sorted("name", Ascending),
            SubscriptionPlan {
                key: SubscriptionKey::new(EntityType::Service, Scope::All),
                query: QueryDescriptor::all(),
            }
            .sorted("name", Ascending),
            notifications,
        ],
    }
}

/// Field stamped with the signed-in user's id on local creates
///
/// Only entities a user owns outright get stamped; a dentist's appointment
/// still needs an explicit `patientId`.
pub fn owner_field(role: Role, entity: EntityType) -> Option<&'static str> {
    match (role, entity) {
        (Role::Patient, EntityType::Appointment)
        | (Role::Patient, EntityType::Treatment)
        | (Role::Patient, EntityType::Payment) => Some("patientId"),
        (Role::Dentist, EntityType::Appointment) | (Role::Dentist, EntityType::Treatment) => {
            Some("dentistId")
        }
        (_, EntityType::Notification) => Some("userId"),
        _ => None,
    }
}
