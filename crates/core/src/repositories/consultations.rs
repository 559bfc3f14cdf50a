//! Consultation workflow engine.
//!
//! A consultation is opened for a patient who has vitals recorded today, moves through its
//! clinical steps while `pending`, and ends either `completed` (finalized) or `cancelled`.
//! Both end states are terminal.
//!
//! ## Lifecycle
//!
//! ```text
//!            start                finalize
//!   (none) ───────► pending ──────────────► completed
//!                      │
//!                      │ cancel
//!                      ▼
//!                  cancelled
//! ```
//!
//! Whether a consultation is a first visit is decided once, at start, and selects the
//! physical-exam variant ([`ExamKind::expected_for`]) and whether an intake history is
//! required.
//!
//! ## Guarding
//!
//! Every step loads the consultation scoped to the calling clinician, so a consultation
//! belonging to someone else is indistinguishable from a missing one
//! ([`EmrError::NotFoundOrForbidden`]). All checks run before any write. Status changes
//! are issued as `UPDATE … WHERE status = 'pending'` and confirmed through the affected
//! row count, so two concurrent finalizations cannot both succeed. Writes to the
//! sub-records (diagnoses, prescription, intake history) run in a transaction opened by
//! that same guarded update, so they cannot land on a consultation that was closed in
//! the meantime.

use super::appointments::{self, AppointmentStatus};
use super::diagnoses::{self, Diagnosis, ImportFailure, ImportReport, NewDiagnosis};
use super::history::{self, NewIntakeHistory};
use super::patients::{Patient, PatientService};
use super::prescriptions::{self, NewPrescription, Prescription};
use super::vitals;
use crate::audit::{AuditAction, AuditEvent};
use crate::constants::CLINICAL_TEXT_MAX_LEN;
use crate::db::Store;
use crate::error::{EmrError, EmrResult, Prerequisite};
use crate::exam::{ExamKind, PhysicalExam};
use crate::prerequisites::{has_intake_history, has_vitals_today, is_first_visit};
use crate::validation::check_len;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Sqlite, Transaction};

// ============================================================================
// STATUS AND REQUIREMENTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsultationStatus {
    Pending,
    Completed,
    Cancelled,
}

impl ConsultationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsultationStatus::Pending => "pending",
            ConsultationStatus::Completed => "completed",
            ConsultationStatus::Cancelled => "cancelled",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(ConsultationStatus::Pending),
            "completed" => Some(ConsultationStatus::Completed),
            "cancelled" => Some(ConsultationStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for ConsultationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something a consultation must have before it can be finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Requirement {
    #[serde(rename = "relato")]
    Narrative,
    #[serde(rename = "examen_fisico")]
    PhysicalExam,
    #[serde(rename = "plan_trabajo")]
    WorkPlan,
    #[serde(rename = "diagnosticos")]
    Diagnosis,
}

impl Requirement {
    pub fn as_str(&self) -> &'static str {
        match self {
            Requirement::Narrative => "relato",
            Requirement::PhysicalExam => "examen_fisico",
            Requirement::WorkPlan => "plan_trabajo",
            Requirement::Diagnosis => "diagnosticos",
        }
    }
}

// ============================================================================
// RECORDS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Consultation {
    #[serde(rename = "idConsulta")]
    pub id: i64,
    #[serde(rename = "idFichaClinica")]
    pub patient_id: i64,
    #[serde(rename = "idMedico")]
    pub clinician_id: i64,
    #[serde(rename = "idCita")]
    pub appointment_id: Option<i64>,
    #[serde(rename = "idSignosVitales")]
    pub vitals_id: i64,
    #[serde(rename = "esPrimeraConsulta")]
    pub is_first_visit: bool,
    #[serde(rename = "estado")]
    pub status: ConsultationStatus,
    #[serde(rename = "relato")]
    pub narrative: Option<String>,
    #[serde(rename = "examenFisico")]
    pub physical_exam: Option<PhysicalExam>,
    #[serde(rename = "planTrabajo")]
    pub work_plan: Option<String>,
    #[serde(rename = "fechaInicio")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "fechaActualizacion")]
    pub updated_at: DateTime<Utc>,
    #[serde(rename = "fechaFinalizacion")]
    pub finalized_at: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow)]
struct ConsultationRow {
    id: i64,
    patient_id: i64,
    clinician_id: i64,
    appointment_id: Option<i64>,
    vitals_id: i64,
    is_first_visit: bool,
    status: String,
    narrative: Option<String>,
    detailed_exam: Option<String>,
    simplified_exam: Option<String>,
    work_plan: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    finalized_at: Option<DateTime<Utc>>,
}

impl TryFrom<ConsultationRow> for Consultation {
    type Error = EmrError;

    fn try_from(row: ConsultationRow) -> Result<Self, Self::Error> {
        let status = ConsultationStatus::parse(&row.status).ok_or_else(|| {
            EmrError::CorruptRecord(format!("consultation {} status '{}'", row.id, row.status))
        })?;
        let physical_exam = PhysicalExam::from_columns(
            row.detailed_exam.as_deref(),
            row.simplified_exam.as_deref(),
        )?;
        Ok(Consultation {
            id: row.id,
            patient_id: row.patient_id,
            clinician_id: row.clinician_id,
            appointment_id: row.appointment_id,
            vitals_id: row.vitals_id,
            is_first_visit: row.is_first_visit,
            status,
            narrative: row.narrative,
            physical_exam,
            work_plan: row.work_plan,
            created_at: row.created_at,
            updated_at: row.updated_at,
            finalized_at: row.finalized_at,
        })
    }
}

const CONSULTATION_COLUMNS: &str = "id, patient_id, clinician_id, appointment_id, vitals_id,
    is_first_visit, status, narrative, detailed_exam, simplified_exam, work_plan, created_at,
    updated_at, finalized_at";

/// A consultation together with its patient and sub-records.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsultationDetail {
    #[serde(rename = "consulta")]
    pub consultation: Consultation,
    #[serde(rename = "paciente")]
    pub patient: Patient,
    #[serde(rename = "diagnosticos")]
    pub diagnoses: Vec<Diagnosis>,
    #[serde(rename = "receta")]
    pub prescription: Option<Prescription>,
}

// ============================================================================
// PROGRESS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Step {
    #[serde(rename = "signos_vitales")]
    Vitals,
    #[serde(rename = "relato")]
    Narrative,
    #[serde(rename = "antecedentes")]
    IntakeHistory,
    #[serde(rename = "examen_fisico")]
    PhysicalExam,
    #[serde(rename = "diagnosticos")]
    Diagnosis,
    #[serde(rename = "plan_trabajo")]
    Plan,
    #[serde(rename = "receta")]
    Prescription,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StepProgress {
    #[serde(rename = "paso")]
    pub step: Step,
    #[serde(rename = "completado")]
    pub completed: bool,
    #[serde(rename = "requerido")]
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Progress {
    #[serde(rename = "pasos")]
    pub steps: Vec<StepProgress>,
    #[serde(rename = "porcentaje")]
    pub percentage: u8,
    #[serde(rename = "faltantes")]
    pub missing: Vec<Step>,
}

/// Observed facts about a consultation, from which [`Progress`] is derived.
#[derive(Debug, Clone, Copy, Default)]
pub struct StepFacts {
    pub is_first_visit: bool,
    pub has_vitals: bool,
    pub has_narrative: bool,
    pub has_intake_history: bool,
    pub has_physical_exam: bool,
    pub has_diagnosis: bool,
    pub has_plan: bool,
    pub has_prescription: bool,
}

impl Progress {
    pub fn from_facts(facts: StepFacts) -> Self {
        let steps = vec![
            StepProgress {
                step: Step::Vitals,
                completed: facts.has_vitals,
                required: true,
            },
            StepProgress {
                step: Step::Narrative,
                completed: facts.has_narrative,
                required: true,
            },
            StepProgress {
                step: Step::IntakeHistory,
                completed: facts.has_intake_history,
                required: facts.is_first_visit,
            },
            StepProgress {
                step: Step::PhysicalExam,
                completed: facts.has_physical_exam,
                required: true,
            },
            StepProgress {
                step: Step::Diagnosis,
                completed: facts.has_diagnosis,
                required: true,
            },
            StepProgress {
                step: Step::Plan,
                completed: facts.has_plan,
                required: true,
            },
            StepProgress {
                step: Step::Prescription,
                completed: facts.has_prescription,
                required: false,
            },
        ];

        let required = steps.iter().filter(|s| s.required).count();
        let done = steps.iter().filter(|s| s.required && s.completed).count();
        let percentage = if required == 0 {
            100
        } else {
            ((done as f64 / required as f64) * 100.0).round() as u8
        };
        let missing = steps
            .iter()
            .filter(|s| s.required && !s.completed)
            .map(|s| s.step)
            .collect();

        Progress {
            steps,
            percentage,
            missing,
        }
    }
}

/// Compact view of where a consultation stands.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSummary {
    #[serde(rename = "idConsulta")]
    pub consultation_id: i64,
    #[serde(rename = "estado")]
    pub status: ConsultationStatus,
    #[serde(rename = "esPrimeraConsulta")]
    pub is_first_visit: bool,
    #[serde(rename = "totalDiagnosticos")]
    pub diagnosis_count: usize,
    #[serde(rename = "tieneReceta")]
    pub has_prescription: bool,
    #[serde(rename = "tieneAntecedentes")]
    pub has_intake_history: bool,
    #[serde(rename = "progreso")]
    pub progress: Progress,
}

// ============================================================================
// TYPE-STATE MARKERS
// ============================================================================

/// Marker type: no consultation selected yet. Only [`ConsultationService::start`] is
/// available.
#[derive(Clone, Copy, Debug)]
pub struct Uninitialised;

/// Marker type: the service is bound to one consultation.
#[derive(Clone, Copy, Debug)]
pub struct Initialised {
    consultation_id: i64,
}

// ============================================================================
// CONSULTATION SERVICE
// ============================================================================

/// Workflow operations on behalf of one clinician.
///
/// Generic parameter `S` is either [`Uninitialised`] or [`Initialised`].
#[derive(Clone, Debug)]
pub struct ConsultationService<S> {
    store: Store,
    clinician_id: i64,
    state: S,
}

impl ConsultationService<Uninitialised> {
    pub fn new(store: Store, clinician_id: i64) -> Self {
        Self {
            store,
            clinician_id,
            state: Uninitialised,
        }
    }

    /// Opens a consultation for a patient.
    ///
    /// **This method consumes `self`** and returns a service bound to the new consultation.
    ///
    /// # Errors
    ///
    /// - [`EmrError::PatientNotFound`] if the patient does not exist.
    /// - [`EmrError::Prerequisite`] with [`Prerequisite::MissingVitals`] when no vitals were
    ///   recorded today.
    /// - [`EmrError::InvalidInput`] when the appointment is unknown, belongs to another
    ///   patient or is already closed.
    ///
    /// Nothing is written when any check fails.
    pub async fn start(
        self,
        patient_id: i64,
        appointment_id: Option<i64>,
    ) -> EmrResult<ConsultationService<Initialised>> {
        let pool = self.store.pool();
        if !super::patient_exists(pool, patient_id).await? {
            return Err(EmrError::PatientNotFound);
        }
        let vitals = has_vitals_today(&self.store, patient_id)
            .await?
            .ok_or(EmrError::Prerequisite(Prerequisite::MissingVitals))?;

        if let Some(appointment_id) = appointment_id {
            let appointment = appointments::find(pool, appointment_id)
                .await?
                .ok_or_else(|| EmrError::InvalidInput("idCita does not exist".into()))?;
            if appointment.patient_id != patient_id {
                return Err(EmrError::InvalidInput(
                    "idCita belongs to a different patient".into(),
                ));
            }
            if appointment.status.is_terminal() {
                return Err(EmrError::InvalidInput(format!(
                    "idCita is already {}",
                    appointment.status.as_str()
                )));
            }
        }

        let first_visit = is_first_visit(&self.store, patient_id).await?;
        let now = Utc::now();

        let mut tx = pool.begin().await?;
        let consultation_id = sqlx::query(
            "INSERT INTO consultations (patient_id, clinician_id, appointment_id, vitals_id,
             is_first_visit, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, 'pending', ?, ?)",
        )
        .bind(patient_id)
        .bind(self.clinician_id)
        .bind(appointment_id)
        .bind(vitals.id)
        .bind(first_visit)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        sqlx::query("UPDATE vitals SET consultation_id = ? WHERE id = ?")
            .bind(consultation_id)
            .bind(vitals.id)
            .execute(&mut *tx)
            .await?;

        if let Some(appointment_id) = appointment_id {
            let moved =
                appointments::set_status(&mut *tx, appointment_id, AppointmentStatus::InProgress)
                    .await?;
            if moved == 0 {
                return Err(EmrError::InvalidInput("idCita was closed meanwhile".into()));
            }
        }
        tx.commit().await?;

        tracing::info!(
            consultation_id,
            patient_id,
            first_visit,
            "consultation started"
        );
        self.store.audit().emit(AuditEvent::new(
            self.clinician_id,
            AuditAction::ConsultationStarted,
            "consultation",
            consultation_id,
        ));

        Ok(ConsultationService {
            store: self.store,
            clinician_id: self.clinician_id,
            state: Initialised { consultation_id },
        })
    }
}

impl ConsultationService<Initialised> {
    /// Binds the service to an existing consultation.
    ///
    /// Does not touch the database; ownership is checked by each operation.
    pub fn with_id(store: Store, clinician_id: i64, consultation_id: i64) -> Self {
        Self {
            store,
            clinician_id,
            state: Initialised { consultation_id },
        }
    }

    pub fn consultation_id(&self) -> i64 {
        self.state.consultation_id
    }

    /// Loads the consultation, scoped to the calling clinician.
    pub async fn get(&self) -> EmrResult<Consultation> {
        let row: Option<ConsultationRow> = sqlx::query_as(&format!(
            "SELECT {CONSULTATION_COLUMNS} FROM consultations WHERE id = ? AND clinician_id = ?"
        ))
        .bind(self.state.consultation_id)
        .bind(self.clinician_id)
        .fetch_optional(self.store.pool())
        .await?;
        row.map(Consultation::try_from)
            .transpose()?
            .ok_or(EmrError::NotFoundOrForbidden)
    }

    /// Loads the consultation and requires it to be pending.
    async fn pending(&self) -> EmrResult<Consultation> {
        let consultation = self.get().await?;
        if consultation.status != ConsultationStatus::Pending {
            return Err(EmrError::AlreadyFinalizedOrCancelled(consultation.status));
        }
        Ok(consultation)
    }

    /// Reports the terminal status after a guarded update matched no row.
    async fn lost_race(&self) -> EmrError {
        match self.get().await {
            Ok(c) => EmrError::AlreadyFinalizedOrCancelled(c.status),
            Err(e) => e,
        }
    }

    /// Opens a transaction whose first statement touches the consultation under the
    /// pending guard. Sub-record writes made on it commit only while the consultation is
    /// still pending.
    async fn claim(&self) -> EmrResult<Transaction<'static, Sqlite>> {
        let mut tx = self.store.pool().begin().await?;
        let result = sqlx::query(
            "UPDATE consultations SET updated_at = ?
             WHERE id = ? AND clinician_id = ? AND status = 'pending'",
        )
        .bind(Utc::now())
        .bind(self.state.consultation_id)
        .bind(self.clinician_id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            drop(tx);
            return Err(self.lost_race().await);
        }
        Ok(tx)
    }

    fn emit(&self, action: AuditAction, detail: Option<String>) {
        self.store.audit().emit(
            AuditEvent::new(
                self.clinician_id,
                action,
                "consultation",
                self.state.consultation_id,
            )
            .with_detail(detail),
        );
    }

    async fn write_text_step(
        &self,
        column: &'static str,
        field: &str,
        text: &str,
        action: AuditAction,
    ) -> EmrResult<Consultation> {
        let text = text.trim();
        if text.is_empty() {
            return Err(EmrError::InvalidInput(format!("{field} cannot be empty")));
        }
        let mut errors = Vec::new();
        check_len(&mut errors, field, text, CLINICAL_TEXT_MAX_LEN);
        crate::validation::finish(errors)?;

        self.pending().await?;
        let result = sqlx::query(&format!(
            "UPDATE consultations SET {column} = ?, updated_at = ?
             WHERE id = ? AND status = 'pending'"
        ))
        .bind(text)
        .bind(Utc::now())
        .bind(self.state.consultation_id)
        .execute(self.store.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(self.lost_race().await);
        }

        self.emit(action, None);
        self.get().await
    }

    /// Records the narrative of the current illness (`relato`).
    pub async fn record_narrative(&self, narrative: &str) -> EmrResult<Consultation> {
        self.write_text_step("narrative", "relato", narrative, AuditAction::NarrativeRecorded)
            .await
    }

    /// Records the work plan (`planTrabajo`).
    pub async fn record_work_plan(&self, plan: &str) -> EmrResult<Consultation> {
        self.write_text_step("work_plan", "planTrabajo", plan, AuditAction::WorkPlanRecorded)
            .await
    }

    /// Records the physical exam.
    ///
    /// The kind must match the visit type: detailed for first visits, simplified for
    /// follow-ups. A first visit must have its intake history recorded first. The payload
    /// is then decoded strictly. Writing one variant clears the column of the other.
    ///
    /// # Errors
    ///
    /// - [`EmrError::WrongExamKind`] when `kind` does not match the visit type.
    /// - [`EmrError::Prerequisite`] with [`Prerequisite::MissingIntakeHistory`] on a first
    ///   visit whose patient has no intake history yet.
    /// - [`EmrError::Validation`] when `datos` does not match the variant's schema.
    pub async fn record_physical_exam(
        &self,
        kind: ExamKind,
        datos: serde_json::Value,
    ) -> EmrResult<Consultation> {
        let consultation = self.pending().await?;
        let expected = ExamKind::expected_for(consultation.is_first_visit);
        if kind != expected {
            return Err(EmrError::WrongExamKind {
                expected,
                supplied: kind,
            });
        }
        if consultation.is_first_visit
            && !has_intake_history(&self.store, consultation.patient_id).await?
        {
            return Err(EmrError::Prerequisite(Prerequisite::MissingIntakeHistory));
        }
        let exam = PhysicalExam::from_parts(kind, datos)?;
        let (detailed, simplified) = exam.to_columns()?;

        let result = sqlx::query(
            "UPDATE consultations SET detailed_exam = ?, simplified_exam = ?, updated_at = ?
             WHERE id = ? AND status = 'pending'",
        )
        .bind(detailed)
        .bind(simplified)
        .bind(Utc::now())
        .bind(self.state.consultation_id)
        .execute(self.store.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(self.lost_race().await);
        }

        self.emit(AuditAction::PhysicalExamRecorded, Some(kind.as_str().to_string()));
        self.get().await
    }

    /// Records the patient's intake history during a first visit.
    ///
    /// # Errors
    ///
    /// - [`EmrError::InvalidInput`] when the consultation is a follow-up.
    /// - [`EmrError::IntakeHistoryExists`] when the patient already has one.
    pub async fn record_intake_history(
        &self,
        input: NewIntakeHistory,
    ) -> EmrResult<history::IntakeHistory> {
        let consultation = self.pending().await?;
        if !consultation.is_first_visit {
            return Err(EmrError::InvalidInput(
                "intake history is only recorded during a first visit".into(),
            ));
        }
        if has_intake_history(&self.store, consultation.patient_id).await? {
            return Err(EmrError::IntakeHistoryExists);
        }

        let mut tx = self.claim().await?;
        let id = history::insert(
            &mut *tx,
            consultation.patient_id,
            consultation.id,
            self.clinician_id,
            input,
        )
        .await?;
        tx.commit().await?;
        self.store.audit().emit(AuditEvent::new(
            self.clinician_id,
            AuditAction::IntakeHistoryCreated,
            "intake_history",
            id,
        ));

        history::find(self.store.pool(), consultation.patient_id)
            .await?
            .ok_or(EmrError::NotFound("intake history"))
    }

    /// Attaches a CIE-10 diagnosis.
    ///
    /// # Errors
    ///
    /// - [`EmrError::NotFound`] when the code is not in the catalog.
    /// - [`EmrError::DuplicateDiagnosis`] when the code is already attached.
    pub async fn add_diagnosis(&self, input: NewDiagnosis) -> EmrResult<Diagnosis> {
        let mut tx = self.claim().await?;
        let id = diagnoses::attach(&mut tx, self.state.consultation_id, &input).await?;
        tx.commit().await?;

        self.emit(AuditAction::DiagnosisAdded, Some(input.cie10_id.to_string()));
        self.list_diagnoses()
            .await?
            .into_iter()
            .find(|d| d.id == id)
            .ok_or(EmrError::NotFound("diagnosis"))
    }

    /// Attaches several diagnoses in one transaction.
    ///
    /// Items that fail their checks are reported individually; the rest are committed.
    pub async fn import_diagnoses(&self, items: Vec<NewDiagnosis>) -> EmrResult<ImportReport> {
        if items.is_empty() {
            return Err(EmrError::InvalidInput("diagnosticos cannot be empty".into()));
        }
        let mut tx = self.claim().await?;
        let mut report = ImportReport {
            imported: Vec::new(),
            failed: Vec::new(),
        };
        for (index, item) in items.iter().enumerate() {
            match diagnoses::attach(&mut tx, self.state.consultation_id, item).await {
                Ok(id) => report.imported.push(id),
                Err(EmrError::Database(e)) => return Err(EmrError::Database(e)),
                Err(e) => report.failed.push(ImportFailure {
                    index,
                    cie10_id: item.cie10_id,
                    error: e.to_string(),
                }),
            }
        }
        tx.commit().await?;

        tracing::debug!(
            consultation_id = self.state.consultation_id,
            imported = report.imported.len(),
            failed = report.failed.len(),
            "bulk diagnosis import"
        );
        if !report.imported.is_empty() {
            self.emit(
                AuditAction::DiagnosesImported,
                Some(format!("{} imported", report.imported.len())),
            );
        }
        Ok(report)
    }

    /// Removes a diagnosis attachment from this consultation.
    pub async fn remove_diagnosis(&self, diagnosis_id: i64) -> EmrResult<()> {
        let mut tx = self.claim().await?;
        diagnoses::detach(&mut *tx, self.state.consultation_id, diagnosis_id).await?;
        tx.commit().await?;
        self.emit(AuditAction::DiagnosisRemoved, Some(diagnosis_id.to_string()));
        Ok(())
    }

    pub async fn list_diagnoses(&self) -> EmrResult<Vec<Diagnosis>> {
        self.get().await?;
        diagnoses::list(self.store.pool(), self.state.consultation_id).await
    }

    /// Creates the consultation's prescription.
    pub async fn create_prescription(&self, input: NewPrescription) -> EmrResult<Prescription> {
        self.pending().await?;
        prescriptions::check(self.store.pool(), &input).await?;
        let mut tx = self.claim().await?;
        prescriptions::insert(&mut tx, self.state.consultation_id, input).await?;
        tx.commit().await?;

        let prescription = prescriptions::find(self.store.pool(), self.state.consultation_id)
            .await?
            .ok_or(EmrError::NotFound("prescription"))?;
        self.emit(
            AuditAction::PrescriptionCreated,
            Some(format!("{} lines", prescription.items.len())),
        );
        Ok(prescription)
    }

    pub async fn prescription(&self) -> EmrResult<Option<Prescription>> {
        self.get().await?;
        prescriptions::find(self.store.pool(), self.state.consultation_id).await
    }

    /// Closes the consultation as `completed`.
    ///
    /// # Errors
    ///
    /// - [`EmrError::IncompleteForFinalization`] listing every missing requirement.
    /// - [`EmrError::AlreadyFinalizedOrCancelled`] when not pending.
    /// - [`EmrError::AppointmentClosed`] when the linked appointment can no longer be marked
    ///   attended; nothing is written.
    pub async fn finalize(&self) -> EmrResult<Consultation> {
        let consultation = self.pending().await?;
        let diagnosis_count =
            diagnoses::count(self.store.pool(), self.state.consultation_id).await?;

        let mut missing = Vec::new();
        if consultation.narrative.is_none() {
            missing.push(Requirement::Narrative);
        }
        if consultation.physical_exam.is_none() {
            missing.push(Requirement::PhysicalExam);
        }
        if consultation.work_plan.is_none() {
            missing.push(Requirement::WorkPlan);
        }
        if diagnosis_count == 0 {
            missing.push(Requirement::Diagnosis);
        }
        if !missing.is_empty() {
            return Err(EmrError::IncompleteForFinalization(missing));
        }

        let now = Utc::now();
        let mut tx = self.store.pool().begin().await?;
        let result = sqlx::query(
            "UPDATE consultations SET status = 'completed', finalized_at = ?, updated_at = ?
             WHERE id = ? AND status = 'pending'",
        )
        .bind(now)
        .bind(now)
        .bind(self.state.consultation_id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            drop(tx);
            return Err(self.lost_race().await);
        }
        // Diagnoses may have been detached since the first count.
        if diagnoses::count(&mut *tx, self.state.consultation_id).await? == 0 {
            return Err(EmrError::IncompleteForFinalization(vec![Requirement::Diagnosis]));
        }
        if let Some(appointment_id) = consultation.appointment_id {
            let moved =
                appointments::set_status(&mut *tx, appointment_id, AppointmentStatus::Attended)
                    .await?;
            if moved == 0 {
                let closed = appointments::find(&mut *tx, appointment_id)
                    .await?
                    .map_or("missing", |a| a.status.as_str());
                return Err(EmrError::AppointmentClosed(closed));
            }
        }
        tx.commit().await?;

        tracing::info!(
            consultation_id = self.state.consultation_id,
            "consultation finalized"
        );
        self.emit(AuditAction::ConsultationFinalized, None);
        self.get().await
    }

    /// Cancels a pending consultation. The linked appointment is left as it is.
    pub async fn cancel(&self, reason: Option<String>) -> EmrResult<Consultation> {
        self.pending().await?;
        let result = sqlx::query(
            "UPDATE consultations SET status = 'cancelled', updated_at = ?
             WHERE id = ? AND status = 'pending'",
        )
        .bind(Utc::now())
        .bind(self.state.consultation_id)
        .execute(self.store.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(self.lost_race().await);
        }

        tracing::info!(
            consultation_id = self.state.consultation_id,
            "consultation cancelled"
        );
        self.emit(
            AuditAction::ConsultationCancelled,
            crate::validation::capped(reason, crate::constants::DETAIL_MAX_LEN),
        );
        self.get().await
    }

    /// Step-by-step progress. Available in any state.
    pub async fn progress(&self) -> EmrResult<Progress> {
        let consultation = self.get().await?;
        let pool = self.store.pool();
        let started_on = consultation.created_at.date_naive();
        let (has_vitals, diagnosis_count, has_prescription, has_history) = tokio::try_join!(
            vitals::recorded_on(pool, consultation.vitals_id, started_on),
            diagnoses::count(pool, consultation.id),
            prescriptions::exists(pool, consultation.id),
            has_intake_history(&self.store, consultation.patient_id),
        )?;
        Ok(Progress::from_facts(StepFacts {
            has_vitals,
            has_diagnosis: diagnosis_count > 0,
            has_prescription,
            has_intake_history: has_history,
            ..recorded_steps(&consultation)
        }))
    }

    /// Status overview, gathered with concurrent queries.
    pub async fn status(&self) -> EmrResult<StatusSummary> {
        let pool = self.store.pool();
        let id = self.state.consultation_id;
        let (consultation, diagnoses, has_prescription) = tokio::try_join!(
            self.get(),
            diagnoses::list(pool, id),
            prescriptions::exists(pool, id),
        )?;
        let started_on = consultation.created_at.date_naive();
        let (has_vitals, has_history) = tokio::try_join!(
            vitals::recorded_on(pool, consultation.vitals_id, started_on),
            has_intake_history(&self.store, consultation.patient_id),
        )?;

        Ok(StatusSummary {
            consultation_id: consultation.id,
            status: consultation.status,
            is_first_visit: consultation.is_first_visit,
            diagnosis_count: diagnoses.len(),
            has_prescription,
            has_intake_history: has_history,
            progress: Progress::from_facts(StepFacts {
                has_vitals,
                has_diagnosis: !diagnoses.is_empty(),
                has_prescription,
                has_intake_history: has_history,
                ..recorded_steps(&consultation)
            }),
        })
    }

    /// The consultation with its patient, diagnoses and prescription.
    pub async fn detail(&self) -> EmrResult<ConsultationDetail> {
        let consultation = self.get().await?;
        let pool = self.store.pool();
        let patients = PatientService::new(self.store.clone());
        let (patient, diagnoses, prescription) = tokio::try_join!(
            patients.get(consultation.patient_id),
            diagnoses::list(pool, consultation.id),
            prescriptions::find(pool, consultation.id),
        )?;
        Ok(ConsultationDetail {
            consultation,
            patient,
            diagnoses,
            prescription,
        })
    }
}

/// Facts held on the consultation row itself; sub-record facts start out false.
fn recorded_steps(consultation: &Consultation) -> StepFacts {
    StepFacts {
        is_first_visit: consultation.is_first_visit,
        has_narrative: consultation.narrative.is_some(),
        has_physical_exam: consultation.physical_exam.is_some(),
        has_plan: consultation.work_plan.is_some(),
        ..StepFacts::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditReceiver;
    use crate::repositories::appointments::{AppointmentService, NewAppointment};
    use crate::repositories::prescriptions::NewPrescriptionItem;
    use crate::test_support::{
        seed_cie10, seed_clinic, seed_medication, seed_patient, seed_vitals_at, test_store,
        Clinic,
    };
    use chrono::Duration;
    use serde_json::json;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: Store,
        audit: AuditReceiver,
        clinic: Clinic,
    }

    async fn fixture() -> Fixture {
        let (dir, store, audit) = test_store().await;
        let clinic = seed_clinic(store.pool()).await;
        Fixture {
            _dir: dir,
            store,
            audit,
            clinic,
        }
    }

    async fn start(f: &Fixture) -> ConsultationService<Initialised> {
        ConsultationService::new(f.store.clone(), f.clinic.physician_id)
            .start(f.clinic.patient_id, None)
            .await
            .expect("start should succeed")
    }

    fn diagnosis(cie10_id: i64) -> NewDiagnosis {
        NewDiagnosis {
            cie10_id,
            kind: None,
            notes: None,
        }
    }

    async fn book_today(f: &Fixture) -> i64 {
        AppointmentService::new(f.store.clone())
            .create(
                f.clinic.physician_id,
                NewAppointment {
                    patient_id: f.clinic.patient_id,
                    clinician_id: f.clinic.physician_id,
                    date: Utc::now().date_naive().to_string(),
                    time: "08:00".into(),
                    reason: None,
                    notes: None,
                },
            )
            .await
            .unwrap()
            .id
    }

    /// Records every finalization requirement on a follow-up consultation.
    async fn complete_follow_up(service: &ConsultationService<Initialised>, cie10_id: i64) {
        service.record_narrative("Control de presión arterial").await.unwrap();
        service
            .record_physical_exam(ExamKind::Simplified, json!({"hallazgos": "sin cambios"}))
            .await
            .unwrap();
        service.record_work_plan("Continuar tratamiento").await.unwrap();
        service.add_diagnosis(diagnosis(cie10_id)).await.unwrap();
    }

    async fn consultation_count(store: &Store) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM consultations")
            .fetch_one(store.pool())
            .await
            .unwrap()
    }

    #[test]
    fn progress_weights_only_required_steps() {
        let follow_up = Progress::from_facts(StepFacts {
            has_vitals: true,
            has_narrative: true,
            ..Default::default()
        });
        // vitals, narrative, exam, diagnosis, plan
        assert_eq!(follow_up.percentage, 40);
        assert_eq!(
            follow_up.missing,
            vec![Step::PhysicalExam, Step::Diagnosis, Step::Plan]
        );

        let first_visit = Progress::from_facts(StepFacts {
            is_first_visit: true,
            has_vitals: true,
            has_narrative: true,
            has_prescription: true,
            ..Default::default()
        });
        assert_eq!(first_visit.percentage, 33);
        assert!(first_visit.missing.contains(&Step::IntakeHistory));
        assert!(!first_visit.missing.contains(&Step::Prescription));
    }

    #[tokio::test]
    async fn start_without_todays_vitals_writes_nothing() {
        let (_dir, store, _audit) = test_store().await;
        let clinic = seed_clinic(store.pool()).await;
        let other = seed_patient(store.pool(), "87654321").await;
        seed_vitals_at(store.pool(), other, clinic.nurse_id, Utc::now() - Duration::days(1)).await;

        let err = ConsultationService::new(store.clone(), clinic.physician_id)
            .start(other, None)
            .await
            .expect_err("vitals are from yesterday");
        assert!(matches!(
            err,
            EmrError::Prerequisite(Prerequisite::MissingVitals)
        ));
        assert_eq!(consultation_count(&store).await, 0);

        let err = ConsultationService::new(store.clone(), clinic.physician_id)
            .start(999, None)
            .await
            .expect_err("unknown patient");
        assert!(matches!(err, EmrError::PatientNotFound));
    }

    #[tokio::test]
    async fn first_visit_is_frozen_and_cancelled_ones_do_not_count() {
        let f = fixture().await;
        let first = start(&f).await;
        assert!(first.get().await.unwrap().is_first_visit);

        first.cancel(Some("paciente se retiró".into())).await.unwrap();
        let again = start(&f).await;
        assert!(again.get().await.unwrap().is_first_visit);

        let later = start(&f).await;
        assert!(!later.get().await.unwrap().is_first_visit);
        assert!(first.get().await.unwrap().is_first_visit);
    }

    #[tokio::test]
    async fn start_links_vitals_and_moves_appointment_in_progress() {
        let f = fixture().await;
        let appointments = AppointmentService::new(f.store.clone());
        let appointment = appointments
            .create(
                f.clinic.physician_id,
                NewAppointment {
                    patient_id: f.clinic.patient_id,
                    clinician_id: f.clinic.physician_id,
                    date: Utc::now().date_naive().to_string(),
                    time: "08:00".into(),
                    reason: None,
                    notes: None,
                },
            )
            .await
            .unwrap();

        let service = ConsultationService::new(f.store.clone(), f.clinic.physician_id)
            .start(f.clinic.patient_id, Some(appointment.id))
            .await
            .unwrap();

        let linked: Option<i64> =
            sqlx::query_scalar("SELECT consultation_id FROM vitals WHERE id = ?")
                .bind(f.clinic.vitals_id)
                .fetch_one(f.store.pool())
                .await
                .unwrap();
        assert_eq!(linked, Some(service.consultation_id()));
        assert_eq!(
            appointments.get(appointment.id).await.unwrap().status,
            AppointmentStatus::InProgress
        );

        let other = seed_patient(f.store.pool(), "87654321").await;
        seed_vitals_at(f.store.pool(), other, f.clinic.nurse_id, Utc::now()).await;
        let err = ConsultationService::new(f.store.clone(), f.clinic.physician_id)
            .start(other, Some(appointment.id))
            .await
            .expect_err("appointment belongs to someone else");
        assert!(matches!(err, EmrError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn wrong_exam_kind_is_rejected_both_ways() {
        let f = fixture().await;
        let first = start(&f).await;
        let err = first
            .record_physical_exam(ExamKind::Simplified, json!({"hallazgos": "normal"}))
            .await
            .expect_err("first visit needs a detailed exam");
        assert!(matches!(
            err,
            EmrError::WrongExamKind {
                expected: ExamKind::Detailed,
                supplied: ExamKind::Simplified
            }
        ));

        let follow_up = start(&f).await;
        let err = follow_up
            .record_physical_exam(
                ExamKind::Detailed,
                json!({"abdomen": {"hallazgos": "blando"}}),
            )
            .await
            .expect_err("follow-up needs a simplified exam");
        assert!(matches!(err, EmrError::WrongExamKind { .. }));
    }

    #[tokio::test]
    async fn writing_an_exam_clears_the_other_column() {
        let f = fixture().await;
        let service = start(&f).await;
        let id = service.consultation_id();
        service
            .record_intake_history(NewIntakeHistory::default())
            .await
            .unwrap();

        sqlx::query("UPDATE consultations SET simplified_exam = 'residuo' WHERE id = ?")
            .bind(id)
            .execute(f.store.pool())
            .await
            .unwrap();

        let updated = service
            .record_physical_exam(
                ExamKind::Detailed,
                json!({"cardiovascular": {"ritmo": "regular", "soplos": "no"}}),
            )
            .await
            .unwrap();
        assert_eq!(updated.physical_exam.map(|e| e.kind()), Some(ExamKind::Detailed));

        let (detailed, simplified): (Option<String>, Option<String>) = sqlx::query_as(
            "SELECT detailed_exam, simplified_exam FROM consultations WHERE id = ?",
        )
        .bind(id)
        .fetch_one(f.store.pool())
        .await
        .unwrap();
        assert!(detailed.is_some());
        assert_eq!(simplified, None);

        let err = service
            .record_physical_exam(ExamKind::Detailed, json!({"cardiovascular": {"color": "rojo"}}))
            .await
            .expect_err("unknown key");
        match err {
            EmrError::Validation(errors) => assert!(errors[0].contains("datos.cardiovascular")),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn finalize_reports_every_missing_requirement() {
        let f = fixture().await;
        let code = seed_cie10(f.store.pool(), "I10", "Hipertensión esencial").await;
        let service = start(&f).await;
        service
            .record_intake_history(NewIntakeHistory::default())
            .await
            .unwrap();
        service
            .record_physical_exam(ExamKind::Detailed, json!({"abdomen": {"doloroso": false}}))
            .await
            .unwrap();
        service.add_diagnosis(diagnosis(code)).await.unwrap();

        match service.finalize().await {
            Err(EmrError::IncompleteForFinalization(missing)) => {
                assert_eq!(missing, vec![Requirement::Narrative, Requirement::WorkPlan]);
            }
            other => panic!("expected incomplete error, got {other:?}"),
        }
        assert_eq!(service.get().await.unwrap().status, ConsultationStatus::Pending);
    }

    #[tokio::test]
    async fn empty_text_steps_are_invalid() {
        let f = fixture().await;
        let service = start(&f).await;
        assert!(matches!(
            service.record_narrative("   ").await,
            Err(EmrError::InvalidInput(_))
        ));
        assert!(matches!(
            service.record_work_plan("").await,
            Err(EmrError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_diagnosis_leaves_one_attachment() {
        let f = fixture().await;
        let code = seed_cie10(f.store.pool(), "I10", "Hipertensión esencial").await;
        let second = seed_cie10(f.store.pool(), "E78", "Hiperlipidemia").await;
        let service = start(&f).await;

        let principal = service.add_diagnosis(diagnosis(code)).await.unwrap();
        assert_eq!(principal.kind, super::diagnoses::DiagnosisKind::Principal);
        let err = service
            .add_diagnosis(diagnosis(code))
            .await
            .expect_err("duplicate");
        assert!(matches!(err, EmrError::DuplicateDiagnosis));
        assert_eq!(service.list_diagnoses().await.unwrap().len(), 1);

        let secondary = service.add_diagnosis(diagnosis(second)).await.unwrap();
        assert_eq!(secondary.kind, super::diagnoses::DiagnosisKind::Secondary);

        let err = service
            .add_diagnosis(diagnosis(4242))
            .await
            .expect_err("unknown code");
        assert!(matches!(err, EmrError::NotFound("CIE-10 code")));

        service.remove_diagnosis(secondary.id).await.unwrap();
        assert!(matches!(
            service.remove_diagnosis(secondary.id).await,
            Err(EmrError::NotFoundOrForbidden)
        ));
    }

    #[tokio::test]
    async fn bulk_import_is_best_effort() {
        let f = fixture().await;
        let a = seed_cie10(f.store.pool(), "I10", "Hipertensión esencial").await;
        let b = seed_cie10(f.store.pool(), "E11", "Diabetes mellitus tipo 2").await;
        let service = start(&f).await;

        let report = service
            .import_diagnoses(vec![diagnosis(a), diagnosis(a), diagnosis(999), diagnosis(b)])
            .await
            .unwrap();
        assert_eq!(report.imported.len(), 2);
        assert_eq!(
            report.failed.iter().map(|f| f.index).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(service.list_diagnoses().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn other_clinicians_cannot_see_the_consultation() {
        let f = fixture().await;
        let service = start(&f).await;
        let intruder = crate::test_support::seed_user(f.store.pool(), "otro", "physician").await;

        let foreign =
            ConsultationService::with_id(f.store.clone(), intruder, service.consultation_id());
        assert!(matches!(
            foreign.record_narrative("texto").await,
            Err(EmrError::NotFoundOrForbidden)
        ));
        assert!(matches!(foreign.get().await, Err(EmrError::NotFoundOrForbidden)));
    }

    #[tokio::test]
    async fn cancel_only_from_pending() {
        let f = fixture().await;
        let service = start(&f).await;
        let cancelled = service.cancel(None).await.unwrap();
        assert_eq!(cancelled.status, ConsultationStatus::Cancelled);

        assert!(matches!(
            service.cancel(None).await,
            Err(EmrError::AlreadyFinalizedOrCancelled(ConsultationStatus::Cancelled))
        ));
        assert!(matches!(
            service.record_narrative("tarde").await,
            Err(EmrError::AlreadyFinalizedOrCancelled(_))
        ));
    }

    #[tokio::test]
    async fn intake_history_only_once_and_only_on_first_visit() {
        let f = fixture().await;
        let first = start(&f).await;
        first
            .record_intake_history(NewIntakeHistory::default())
            .await
            .unwrap();
        assert!(matches!(
            first.record_intake_history(NewIntakeHistory::default()).await,
            Err(EmrError::IntakeHistoryExists)
        ));

        let follow_up = start(&f).await;
        assert!(matches!(
            follow_up
                .record_intake_history(NewIntakeHistory::default())
                .await,
            Err(EmrError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn first_visit_end_to_end() {
        let mut f = fixture().await;
        let code = seed_cie10(f.store.pool(), "I10", "Hipertensión esencial").await;
        let medication = seed_medication(f.store.pool(), "Enalapril 10 mg").await;
        let service = start(&f).await;

        let progress = service.progress().await.unwrap();
        assert!(progress.percentage < 100);
        assert!(progress.missing.contains(&Step::IntakeHistory));

        service
            .record_narrative("Cefalea y mareos de 2 semanas de evolución")
            .await
            .unwrap();
        let history: NewIntakeHistory = serde_json::from_value(json!({
            "tiempoEnfermedad": "2 semanas",
            "hipertension": "sí"
        }))
        .unwrap();
        service.record_intake_history(history).await.unwrap();
        service
            .record_physical_exam(
                ExamKind::Detailed,
                json!({
                    "estadoGeneral": {"conciencia": "lúcido"},
                    "cardiovascular": {"ritmo": "regular", "ruidosCardiacos": "normales"}
                }),
            )
            .await
            .unwrap();
        service.add_diagnosis(diagnosis(code)).await.unwrap();
        service
            .record_work_plan("Control de presión arterial en 2 semanas")
            .await
            .unwrap();
        service
            .create_prescription(NewPrescription {
                general_instructions: Some("Dieta hiposódica".into()),
                items: vec![NewPrescriptionItem {
                    medication_id: medication,
                    dose: "10 mg".into(),
                    frequency: "cada 12 horas".into(),
                    duration: "30 días".into(),
                    notes: None,
                }],
            })
            .await
            .unwrap();
        assert!(matches!(
            service.create_prescription(NewPrescription {
                general_instructions: Some("otra".into()),
                items: vec![],
            })
            .await,
            Err(EmrError::PrescriptionExists)
        ));

        let status = service.status().await.unwrap();
        assert_eq!(status.progress.percentage, 100);
        assert!(status.progress.missing.is_empty());
        assert!(status.has_prescription);

        let finalized = service.finalize().await.unwrap();
        assert_eq!(finalized.status, ConsultationStatus::Completed);
        assert!(finalized.finalized_at.is_some());
        assert!(matches!(
            service.finalize().await,
            Err(EmrError::AlreadyFinalizedOrCancelled(ConsultationStatus::Completed))
        ));

        let detail = service.detail().await.unwrap();
        assert_eq!(detail.patient.national_id, "12345678");
        assert_eq!(detail.diagnoses.len(), 1);
        assert_eq!(detail.prescription.map(|p| p.items.len()), Some(1));

        let mut actions = Vec::new();
        while let Some(event) = f.audit.try_next() {
            actions.push(event.action);
        }
        assert_eq!(actions.first(), Some(&AuditAction::ConsultationStarted));
        assert_eq!(actions.last(), Some(&AuditAction::ConsultationFinalized));
    }

    #[tokio::test]
    async fn detailed_exam_waits_for_intake_history_on_first_visit() {
        let f = fixture().await;
        let first = start(&f).await;
        let err = first
            .record_physical_exam(ExamKind::Detailed, json!({"abdomen": {"hallazgos": "blando"}}))
            .await
            .expect_err("no intake history yet");
        assert!(matches!(
            err,
            EmrError::Prerequisite(Prerequisite::MissingIntakeHistory)
        ));
        assert!(first.get().await.unwrap().physical_exam.is_none());

        first
            .record_intake_history(NewIntakeHistory::default())
            .await
            .unwrap();
        first
            .record_physical_exam(ExamKind::Detailed, json!({"abdomen": {"hallazgos": "blando"}}))
            .await
            .unwrap();

        // A follow-up never needs the gate, whatever is on file.
        sqlx::query("DELETE FROM intake_histories")
            .execute(f.store.pool())
            .await
            .unwrap();
        let follow_up = start(&f).await;
        follow_up
            .record_physical_exam(ExamKind::Simplified, json!({"hallazgos": "normal"}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn finalize_marks_the_appointment_attended() {
        let f = fixture().await;
        let code = seed_cie10(f.store.pool(), "I10", "Hipertensión esencial").await;
        start(&f).await;

        let appointment_id = book_today(&f).await;
        let service = ConsultationService::new(f.store.clone(), f.clinic.physician_id)
            .start(f.clinic.patient_id, Some(appointment_id))
            .await
            .unwrap();
        complete_follow_up(&service, code).await;
        service.finalize().await.unwrap();

        let appointment = AppointmentService::new(f.store.clone())
            .get(appointment_id)
            .await
            .unwrap();
        assert_eq!(appointment.status, AppointmentStatus::Attended);
    }

    #[tokio::test]
    async fn cancel_leaves_the_appointment_in_progress() {
        let f = fixture().await;
        let appointment_id = book_today(&f).await;
        let service = ConsultationService::new(f.store.clone(), f.clinic.physician_id)
            .start(f.clinic.patient_id, Some(appointment_id))
            .await
            .unwrap();
        service.cancel(Some("urgencia".into())).await.unwrap();

        let appointment = AppointmentService::new(f.store.clone())
            .get(appointment_id)
            .await
            .unwrap();
        assert_eq!(appointment.status, AppointmentStatus::InProgress);
    }

    #[tokio::test]
    async fn finalize_refuses_when_the_appointment_was_closed() {
        let f = fixture().await;
        let code = seed_cie10(f.store.pool(), "I10", "Hipertensión esencial").await;
        start(&f).await;
        let appointment_id = book_today(&f).await;
        let service = ConsultationService::new(f.store.clone(), f.clinic.physician_id)
            .start(f.clinic.patient_id, Some(appointment_id))
            .await
            .unwrap();
        complete_follow_up(&service, code).await;

        sqlx::query("UPDATE appointments SET status = 'no_show' WHERE id = ?")
            .bind(appointment_id)
            .execute(f.store.pool())
            .await
            .unwrap();
        assert!(matches!(
            service.finalize().await,
            Err(EmrError::AppointmentClosed("no_show"))
        ));
        assert_eq!(service.get().await.unwrap().status, ConsultationStatus::Pending);
    }

    #[tokio::test]
    async fn sub_records_are_frozen_once_closed() {
        let f = fixture().await;
        let code = seed_cie10(f.store.pool(), "I10", "Hipertensión esencial").await;
        let other = seed_cie10(f.store.pool(), "E78", "Hiperlipidemia").await;
        let medication = seed_medication(f.store.pool(), "Enalapril 10 mg").await;
        start(&f).await;
        let service = start(&f).await;
        complete_follow_up(&service, code).await;
        let attached = service.list_diagnoses().await.unwrap();
        service.finalize().await.unwrap();

        assert!(matches!(
            service.remove_diagnosis(attached[0].id).await,
            Err(EmrError::AlreadyFinalizedOrCancelled(ConsultationStatus::Completed))
        ));
        assert!(matches!(
            service.add_diagnosis(diagnosis(other)).await,
            Err(EmrError::AlreadyFinalizedOrCancelled(_))
        ));
        assert!(matches!(
            service.import_diagnoses(vec![diagnosis(other)]).await,
            Err(EmrError::AlreadyFinalizedOrCancelled(_))
        ));
        assert_eq!(service.list_diagnoses().await.unwrap().len(), 1);

        let cancelled = start(&f).await;
        cancelled.cancel(None).await.unwrap();
        let err = cancelled
            .create_prescription(NewPrescription {
                general_instructions: None,
                items: vec![NewPrescriptionItem {
                    medication_id: medication,
                    dose: "10 mg".into(),
                    frequency: "cada 24 horas".into(),
                    duration: "7 días".into(),
                    notes: None,
                }],
            })
            .await
            .expect_err("cancelled consultation");
        assert!(matches!(
            err,
            EmrError::AlreadyFinalizedOrCancelled(ConsultationStatus::Cancelled)
        ));
        assert_eq!(cancelled.prescription().await.unwrap(), None);
    }

    #[tokio::test]
    async fn progress_reads_the_stored_vitals() {
        let f = fixture().await;
        let service = start(&f).await;
        let progress = service.progress().await.unwrap();
        assert!(progress.steps[0].completed);

        sqlx::query("UPDATE vitals SET recorded_at = ? WHERE id = ?")
            .bind(Utc::now() - Duration::days(1))
            .bind(f.clinic.vitals_id)
            .execute(f.store.pool())
            .await
            .unwrap();
        let progress = service.progress().await.unwrap();
        assert_eq!(progress.steps[0].step, Step::Vitals);
        assert!(!progress.steps[0].completed);
        assert!(progress.missing.contains(&Step::Vitals));
        assert!(service.status().await.unwrap().progress.missing.contains(&Step::Vitals));
    }
}
