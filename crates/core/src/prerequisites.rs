//! Prerequisite checks for the consultation workflow.
//!
//! Every function here is read-only and recomputed on each call.

use crate::db::Store;
use crate::repositories::patient_exists;
use crate::repositories::vitals::{latest_between, Vitals};
use crate::EmrResult;
use chrono::{Days, Utc};
use serde::Serialize;

/// Most recent vitals recorded for the patient on the current UTC calendar day.
pub async fn has_vitals_today(store: &Store, patient_id: i64) -> EmrResult<Option<Vitals>> {
    let today = Utc::now().date_naive();
    let start = today.and_hms_opt(0, 0, 0).map(|t| t.and_utc());
    let end = today
        .checked_add_days(Days::new(1))
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|t| t.and_utc());
    let (Some(start), Some(end)) = (start, end) else {
        return Ok(None);
    };
    latest_between(store.pool(), patient_id, start, end).await
}

/// True when the patient has no consultation that is pending or completed.
///
/// Cancelled consultations do not count.
pub async fn is_first_visit(store: &Store, patient_id: i64) -> EmrResult<bool> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM consultations
         WHERE patient_id = ? AND status IN ('pending', 'completed')",
    )
    .bind(patient_id)
    .fetch_one(store.pool())
    .await?;
    Ok(count == 0)
}

pub async fn has_intake_history(store: &Store, patient_id: i64) -> EmrResult<bool> {
    let found: Option<i64> =
        sqlx::query_scalar("SELECT 1 FROM intake_histories WHERE patient_id = ?")
            .bind(patient_id)
            .fetch_optional(store.pool())
            .await?;
    Ok(found.is_some())
}

/// Readiness of a patient to open a consultation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Requirements {
    #[serde(rename = "pacienteExiste")]
    pub patient_exists: bool,
    #[serde(rename = "tieneSignosVitalesHoy")]
    pub has_vitals_today: bool,
    #[serde(rename = "idSignosVitales")]
    pub vitals_id: Option<i64>,
    #[serde(rename = "esPrimeraConsulta")]
    pub is_first_visit: bool,
    #[serde(rename = "tieneAntecedentes")]
    pub has_intake_history: bool,
    #[serde(rename = "requiereAntecedentes")]
    pub intake_history_required: bool,
    #[serde(rename = "puedeContinuar")]
    pub can_continue: bool,
}

/// Builds the readiness report for a patient.
///
/// An unknown patient yields a report with every flag false rather than an error.
pub async fn requirements(store: &Store, patient_id: i64) -> EmrResult<Requirements> {
    if !patient_exists(store.pool(), patient_id).await? {
        return Ok(Requirements {
            patient_exists: false,
            has_vitals_today: false,
            vitals_id: None,
            is_first_visit: false,
            has_intake_history: false,
            intake_history_required: false,
            can_continue: false,
        });
    }

    let (vitals, first_visit, history) = tokio::try_join!(
        has_vitals_today(store, patient_id),
        is_first_visit(store, patient_id),
        has_intake_history(store, patient_id),
    )?;

    Ok(Requirements {
        patient_exists: true,
        has_vitals_today: vitals.is_some(),
        vitals_id: vitals.as_ref().map(|v| v.id),
        is_first_visit: first_visit,
        has_intake_history: history,
        intake_history_required: first_visit,
        can_continue: vitals.is_some(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{seed_patient, seed_user, seed_vitals_at, test_store};
    use chrono::Duration;

    #[tokio::test]
    async fn only_todays_vitals_count() {
        let (_dir, store, _audit) = test_store().await;
        let nurse = seed_user(store.pool(), "enfermera", "nurse").await;
        let patient_id = seed_patient(store.pool(), "12345678").await;

        seed_vitals_at(store.pool(), patient_id, nurse, Utc::now() - Duration::days(2)).await;
        assert!(has_vitals_today(&store, patient_id).await.unwrap().is_none());

        let today = seed_vitals_at(store.pool(), patient_id, nurse, Utc::now()).await;
        let found = has_vitals_today(&store, patient_id).await.unwrap();
        assert_eq!(found.map(|v| v.id), Some(today));
    }

    #[tokio::test]
    async fn first_visit_ignores_cancelled_consultations() {
        let (_dir, store, _audit) = test_store().await;
        let physician = seed_user(store.pool(), "medico", "physician").await;
        let patient_id = seed_patient(store.pool(), "12345678").await;
        let vitals_id = seed_vitals_at(store.pool(), patient_id, physician, Utc::now()).await;

        assert!(is_first_visit(&store, patient_id).await.unwrap());
        assert!(is_first_visit(&store, patient_id).await.unwrap());

        let insert = |status: &'static str| {
            let pool = store.pool().clone();
            async move {
                sqlx::query(
                    "INSERT INTO consultations (patient_id, clinician_id, vitals_id,
                     is_first_visit, status, created_at, updated_at)
                     VALUES (?, ?, ?, 1, ?, ?, ?)",
                )
                .bind(patient_id)
                .bind(physician)
                .bind(vitals_id)
                .bind(status)
                .bind(Utc::now())
                .bind(Utc::now())
                .execute(&pool)
                .await
                .unwrap();
            }
        };

        insert("cancelled").await;
        assert!(is_first_visit(&store, patient_id).await.unwrap());

        insert("completed").await;
        assert!(!is_first_visit(&store, patient_id).await.unwrap());
    }

    #[tokio::test]
    async fn requirements_report_for_unknown_and_ready_patient() {
        let (_dir, store, _audit) = test_store().await;
        let report = requirements(&store, 99).await.unwrap();
        assert!(!report.patient_exists);
        assert!(!report.can_continue);

        let nurse = seed_user(store.pool(), "enfermera", "nurse").await;
        let patient_id = seed_patient(store.pool(), "12345678").await;
        let report = requirements(&store, patient_id).await.unwrap();
        assert!(report.patient_exists);
        assert!(report.is_first_visit);
        assert!(report.intake_history_required);
        assert!(!report.can_continue);

        seed_vitals_at(store.pool(), patient_id, nurse, Utc::now()).await;
        let report = requirements(&store, patient_id).await.unwrap();
        assert!(report.can_continue);
        assert!(!report.has_intake_history);
    }
}
