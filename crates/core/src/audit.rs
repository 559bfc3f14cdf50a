//! Best-effort activity audit.
//!
//! State-changing operations emit an [`AuditEvent`] after their own work has succeeded.
//! Emission never blocks and never fails the caller: events travel over an unbounded
//! channel to a background writer ([`spawn_writer`]) which inserts them into `audit_log`.
//! Failures on either side are only logged.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    PatientCreated,
    PatientUpdated,
    VitalsRecorded,
    IntakeHistoryCreated,
    IntakeHistoryUpdated,
    AppointmentCreated,
    AppointmentUpdated,
    AppointmentCancelled,
    ConsultationStarted,
    NarrativeRecorded,
    PhysicalExamRecorded,
    WorkPlanRecorded,
    DiagnosisAdded,
    DiagnosisRemoved,
    DiagnosesImported,
    PrescriptionCreated,
    ConsultationFinalized,
    ConsultationCancelled,
    SessionOpened,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::PatientCreated => "patient.created",
            AuditAction::PatientUpdated => "patient.updated",
            AuditAction::VitalsRecorded => "vitals.recorded",
            AuditAction::IntakeHistoryCreated => "intake_history.created",
            AuditAction::IntakeHistoryUpdated => "intake_history.updated",
            AuditAction::AppointmentCreated => "appointment.created",
            AuditAction::AppointmentUpdated => "appointment.updated",
            AuditAction::AppointmentCancelled => "appointment.cancelled",
            AuditAction::ConsultationStarted => "consultation.started",
            AuditAction::NarrativeRecorded => "consultation.narrative_recorded",
            AuditAction::PhysicalExamRecorded => "consultation.physical_exam_recorded",
            AuditAction::WorkPlanRecorded => "consultation.work_plan_recorded",
            AuditAction::DiagnosisAdded => "consultation.diagnosis_added",
            AuditAction::DiagnosisRemoved => "consultation.diagnosis_removed",
            AuditAction::DiagnosesImported => "consultation.diagnoses_imported",
            AuditAction::PrescriptionCreated => "consultation.prescription_created",
            AuditAction::ConsultationFinalized => "consultation.finalized",
            AuditAction::ConsultationCancelled => "consultation.cancelled",
            AuditAction::SessionOpened => "session.opened",
        }
    }
}

/// One audit record.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEvent {
    pub actor_id: Option<i64>,
    pub action: AuditAction,
    pub entity: &'static str,
    pub entity_id: Option<i64>,
    pub detail: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(actor_id: i64, action: AuditAction, entity: &'static str, entity_id: i64) -> Self {
        Self {
            actor_id: Some(actor_id),
            action,
            entity,
            entity_id: Some(entity_id),
            detail: None,
            occurred_at: Utc::now(),
        }
    }

    pub fn with_detail(mut self, detail: Option<String>) -> Self {
        self.detail = detail;
        self
    }
}

/// Sending half of the audit channel. Cheap to clone.
#[derive(Clone, Debug)]
pub struct AuditLog {
    tx: mpsc::UnboundedSender<AuditEvent>,
}

/// Receiving half of the audit channel, consumed by [`spawn_writer`].
#[derive(Debug)]
pub struct AuditReceiver {
    rx: mpsc::UnboundedReceiver<AuditEvent>,
}

impl AuditReceiver {
    /// Takes the next queued event without waiting.
    pub fn try_next(&mut self) -> Option<AuditEvent> {
        self.rx.try_recv().ok()
    }
}

impl AuditLog {
    pub fn channel() -> (AuditLog, AuditReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (AuditLog { tx }, AuditReceiver { rx })
    }

    /// Queues an event. A closed channel is logged and otherwise ignored.
    pub fn emit(&self, event: AuditEvent) {
        if let Err(e) = self.tx.send(event) {
            tracing::warn!(
                action = e.0.action.as_str(),
                entity_id = ?e.0.entity_id,
                "audit channel closed, event dropped"
            );
        }
    }
}

/// Outcome of a writer task once the channel has closed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AuditWriterStats {
    pub written: u64,
    pub failed: u64,
}

/// Spawns the background task that persists audit events.
///
/// The task ends when every [`AuditLog`] sender has been dropped.
pub fn spawn_writer(pool: SqlitePool, mut receiver: AuditReceiver) -> JoinHandle<AuditWriterStats> {
    tokio::spawn(async move {
        let mut stats = AuditWriterStats::default();
        while let Some(event) = receiver.rx.recv().await {
            match write_event(&pool, &event).await {
                Ok(()) => stats.written += 1,
                Err(e) => {
                    stats.failed += 1;
                    tracing::error!(
                        action = event.action.as_str(),
                        entity_id = ?event.entity_id,
                        "failed to write audit event: {e}"
                    );
                }
            }
        }
        stats
    })
}

async fn write_event(pool: &SqlitePool, event: &AuditEvent) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO audit_log (actor_id, action, entity, entity_id, detail, occurred_at)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(event.actor_id)
    .bind(event.action.as_str())
    .bind(event.entity)
    .bind(event.entity_id)
    .bind(&event.detail)
    .bind(event.occurred_at)
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_pool;

    #[tokio::test]
    async fn emit_after_receiver_dropped_does_not_panic() {
        let (log, receiver) = AuditLog::channel();
        drop(receiver);
        log.emit(AuditEvent::new(1, AuditAction::PatientCreated, "patient", 1));
    }

    #[tokio::test]
    async fn writer_persists_events_until_channel_closes() {
        let (_dir, pool) = test_pool().await;
        let (log, receiver) = AuditLog::channel();
        let handle = spawn_writer(pool.clone(), receiver);

        log.emit(
            AuditEvent::new(7, AuditAction::ConsultationCancelled, "consultation", 3)
                .with_detail(Some("patient left".into())),
        );
        drop(log);

        let stats = handle.await.expect("writer task should not panic");
        assert_eq!(stats, AuditWriterStats { written: 1, failed: 0 });

        let (action, detail): (String, Option<String>) =
            sqlx::query_as("SELECT action, detail FROM audit_log WHERE entity_id = 3")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(action, "consultation.cancelled");
        assert_eq!(detail.as_deref(), Some("patient left"));
    }
}
