//! Dashboard derivations over mirror contents
//!
//! Pure functions; callers pass the current time so results are reproducible.

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use serde::Serialize;

use crate::document::{field_datetime, field_number, field_str, Document};

/// Window in which a notification counts as new
pub const NEW_NOTIFICATION_WINDOW_MINUTES: i64 = 5;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientStats {
    pub total_appointments: usize,
    pub treatments_done: usize,
    pub total_payments: f64,
    pub medical_records: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DentistStats {
    pub total_appointments: usize,
    pub pending_appointments: usize,
    pub completed_appointments: usize,
    pub total_patients: usize,
    pub total_services: usize,
    pub today_appointments: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthlyReport {
    pub monthly_revenue: f64,
    pub total_appointments: usize,
    pub completed_appointments: usize,
    pub pending_appointments: usize,
    pub average_appointment_value: f64,
}

fn has_status(doc: &Document, status: &str) -> bool {
    field_str(doc, "status")
        .map(|s| s.eq_ignore_ascii_case(status))
        .unwrap_or(false)
}

pub fn patient_stats(
    appointments: &[Document],
    treatments: &[Document],
    payments: &[Document],
) -> PatientStats {
    PatientStats {
        total_appointments: appointments.len(),
        treatments_done: treatments.len(),
        total_payments: payments.iter().map(|p| field_number(p, "amount")).sum(),
        medical_records: treatments.len(),
    }
}

pub fn dentist_stats(
    appointments: &[Document],
    patients: &[Document],
    services: &[Document],
    now: DateTime<Utc>,
) -> DentistStats {
    let today = now.date_naive();
    DentistStats {
        total_appointments: appointments.len(),
        pending_appointments: appointments.iter().filter(|a| has_status(a, "pending")).count(),
        completed_appointments: appointments
            .iter()
            .filter(|a| has_status(a, "completed"))
            .count(),
        total_patients: patients.len(),
        total_services: services.len(),
        today_appointments: appointments
            .iter()
            .filter_map(|a| field_datetime(a, "appointmentDate"))
            .filter(|d| d.date_naive() == today)
            .count(),
    }
}

/// Report over appointments dated from the start of `now`'s month
pub fn monthly_report(appointments: &[Document], now: DateTime<Utc>) -> MonthlyReport {
    let Some(month_start) = Utc
        .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
    else {
        return MonthlyReport::default();
    };

    let monthly: Vec<&Document> = appointments
        .iter()
        .filter(|a| {
            field_datetime(a, "appointmentDate")
                .map(|d| d >= month_start)
                .unwrap_or(false)
        })
        .collect();

    let completed: Vec<&Document> = monthly
        .iter()
        .copied()
        .filter(|a| has_status(a, "completed"))
        .collect();
    let revenue: f64 = completed.iter().map(|a| field_number(a, "amount")).sum();

    MonthlyReport {
        monthly_revenue: revenue,
        total_appointments: monthly.len(),
        completed_appointments: completed.len(),
        pending_appointments: monthly.iter().filter(|a| has_status(a, "pending")).count(),
        average_appointment_value: if completed.is_empty() {
            0.0
        } else {
            revenue / completed.len() as f64
        },
    }
}

/// Notifications not yet marked read
pub fn unread_count(notifications: &[Document]) -> usize {
    notifications
        .iter()
        .filter(|n| n.get("read").and_then(|v| v.as_bool()) != Some(true))
        .count()
}

/// Notifications created within the last few minutes
pub fn recent_notifications(notifications: &[Document], now: DateTime<Utc>) -> Vec<&Document> {
    let cutoff = now - Duration::minutes(NEW_NOTIFICATION_WINDOW_MINUTES);
    notifications
        .iter()
        .filter(|n| {
            field_datetime(n, "createdAt")
                .map(|created| created > cutoff)
                .unwrap_or(false)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::from_value;
    use serde_json::{json, Value};

    fn docs(values: Vec<Value>) -> Vec<Document> {
        values.into_iter().map(|v| from_value(v).unwrap()).collect()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 15, 10, 0, 0).unwrap()
    }

    #[test]
    fn test_patient_stats() {
        let appointments = docs(vec![json!({"id": "a1"}), json!({"id": "a2"})]);
        let treatments = docs(vec![json!({"id": "t1"})]);
        let payments = docs(vec![
            json!({"id": "pay1", "amount": 1500}),
            json!({"id": "pay2", "amount": 250.5}),
            json!({"id": "pay3"}),
        ]);

        let stats = patient_stats(&appointments, &treatments, &payments);
        assert_eq!(stats.total_appointments, 2);
        assert_eq!(stats.treatments_done, 1);
        assert_eq!(stats.medical_records, 1);
        assert_eq!(stats.total_payments, 1750.5);
    }

    #[test]
    fn test_dentist_stats() {
        let appointments = docs(vec![
            json!({"status": "pending", "appointmentDate": "2024-05-15T14:00:00Z"}),
            json!({"status": "completed", "appointmentDate": "2024-05-14T09:00:00Z"}),
            json!({"status": "pending", "appointmentDate": {"seconds": 1715767200}}),
            json!({"status": "cancelled"}),
        ]);
        let patients = docs(vec![json!({"id": "p1"})]);
        let services = docs(vec![json!({"id": "s1"}), json!({"id": "s2"})]);

        let stats = dentist_stats(&appointments, &patients, &services, now());
        assert_eq!(stats.total_appointments, 4);
        assert_eq!(stats.pending_appointments, 2);
        assert_eq!(stats.completed_appointments, 1);
        assert_eq!(stats.total_patients, 1);
        assert_eq!(stats.total_services, 2);
        assert_eq!(stats.today_appointments, 2);
    }

    #[test]
    fn test_monthly_report() {
        let appointments = docs(vec![
            json!({"status": "completed", "amount": 3000, "appointmentDate": "2024-05-02T09:00:00Z"}),
            json!({"status": "completed", "amount": 1000, "appointmentDate": "2024-05-10T09:00:00Z"}),
            json!({"status": "pending", "appointmentDate": "2024-05-20T09:00:00Z"}),
            json!({"status": "completed", "amount": 9999, "appointmentDate": "2024-04-30T09:00:00Z"}),
        ]);

        let report = monthly_report(&appointments, now());
        assert_eq!(report.total_appointments, 3);
        assert_eq!(report.completed_appointments, 2);
        assert_eq!(report.pending_appointments, 1);
        assert_eq!(report.monthly_revenue, 4000.0);
        assert_eq!(report.average_appointment_value, 2000.0);
    }

    #[test]
    fn test_monthly_report_without_completed() {
        let report = monthly_report(&[], now());
        assert_eq!(report.average_appointment_value, 0.0);
    }

    #[test]
    fn test_notifications() {
        let notifications = docs(vec![
            json!({"id": "n1", "read": true, "createdAt": "2024-05-15T09:58:00Z"}),
            json!({"id": "n2", "read": false, "createdAt": "2024-05-15T09:00:00Z"}),
            json!({"id": "n3", "createdAt": "2024-05-15T09:59:30Z"}),
        ]);

        assert_eq!(unread_count(&notifications), 2);
        let recent: Vec<_> = recent_notifications(&notifications, now())
            .iter()
            .map(|n| n["id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(recent, vec!["n1", "n3"]);
    }
}
