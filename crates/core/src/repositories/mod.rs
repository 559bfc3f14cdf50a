//! Entity services.
//!
//! Each module owns one table family and exposes a service holding a [`crate::db::Store`].
//! The consultation workflow engine lives in [`consultations`]; the others are the records
//! it depends on.

pub mod appointments;
pub mod catalog;
pub mod consultations;
pub mod diagnoses;
pub mod history;
pub mod patients;
pub mod prescriptions;
pub mod vitals;

use crate::EmrResult;
use sqlx::SqlitePool;

pub(crate) async fn patient_exists(pool: &SqlitePool, patient_id: i64) -> EmrResult<bool> {
    let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM patients WHERE id = ?")
        .bind(patient_id)
        .fetch_optional(pool)
        .await?;
    Ok(found.is_some())
}
