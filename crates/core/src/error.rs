use crate::exam::ExamKind;
use crate::repositories::consultations::{ConsultationStatus, Requirement};
use emr_types::TextError;

/// A domain precondition that must hold before a workflow step may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prerequisite {
    /// No vitals were recorded for the patient on the current day.
    MissingVitals,
    /// The patient has no intake history on file.
    MissingIntakeHistory,
}

impl std::fmt::Display for Prerequisite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Prerequisite::MissingVitals => f.write_str("missing vitals"),
            Prerequisite::MissingIntakeHistory => f.write_str("missing intake history"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EmrError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error(transparent)]
    Text(#[from] TextError),

    #[error("patient not found")]
    PatientNotFound,
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("consultation not found")]
    NotFoundOrForbidden,
    #[error("prerequisite not met: {0}")]
    Prerequisite(Prerequisite),

    #[error("wrong physical exam kind: consultation expects {expected}, got {supplied}")]
    WrongExamKind {
        expected: ExamKind,
        supplied: ExamKind,
    },
    #[error("diagnosis is already attached to this consultation")]
    DuplicateDiagnosis,
    #[error(
        "consultation cannot be finalized, missing: {}",
        .0.iter().map(|r| r.as_str()).collect::<Vec<_>>().join(", ")
    )]
    IncompleteForFinalization(Vec<Requirement>),
    #[error("consultation is already {0}")]
    AlreadyFinalizedOrCancelled(ConsultationStatus),

    #[error("no fields to update")]
    NoFieldsToUpdate,
    #[error("a patient with this national ID already exists")]
    DuplicateNationalId,
    #[error("intake history already exists for this patient")]
    IntakeHistoryExists,
    #[error("a prescription already exists for this consultation")]
    PrescriptionExists,
    #[error("the clinician already has an appointment at this date and time")]
    SchedulingConflict,
    #[error("appointment is already {0}")]
    AppointmentClosed(&'static str),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("stored record is malformed: {0}")]
    CorruptRecord(String),
}

pub type EmrResult<T> = std::result::Result<T, EmrError>;

/// Returns true when the database error is a unique-constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.is_unique_violation(),
        _ => false,
    }
}
