//! Fixtures shared by the unit tests of this crate.

use crate::audit::{AuditLog, AuditReceiver};
use crate::config::CoreConfig;
use crate::db::{self, Store};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tempfile::TempDir;

/// Creates a migrated database in a fresh temporary directory.
///
/// The `TempDir` must be kept alive for as long as the pool is used.
pub(crate) async fn test_pool() -> (TempDir, SqlitePool) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let url = format!("sqlite://{}", temp_dir.path().join("emr.db").display());
    let cfg = CoreConfig::new(url, 4).expect("CoreConfig::new should succeed");
    let pool = db::connect(&cfg).await.expect("connect should succeed");
    db::migrate(&pool).await.expect("migrate should succeed");
    (temp_dir, pool)
}

/// Like [`test_pool`] but wrapped in a `Store`, returning the audit receiver for inspection.
pub(crate) async fn test_store() -> (TempDir, Store, AuditReceiver) {
    let (temp_dir, pool) = test_pool().await;
    let (audit, receiver) = AuditLog::channel();
    (temp_dir, Store::new(pool, audit), receiver)
}

pub(crate) async fn seed_user(pool: &SqlitePool, username: &str, role: &str) -> i64 {
    sqlx::query("INSERT INTO users (username, full_name, role) VALUES (?, ?, ?)")
        .bind(username)
        .bind(format!("Dr. {username}"))
        .bind(role)
        .execute(pool)
        .await
        .expect("insert user")
        .last_insert_rowid()
}

pub(crate) async fn seed_patient(pool: &SqlitePool, national_id: &str) -> i64 {
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO patients (national_id, first_names, paternal_surname, maternal_surname,
         birth_date, sex, created_at, updated_at)
         VALUES (?, 'Ana', 'Quispe', 'Mamani', '1980-05-20', 'F', ?, ?)",
    )
    .bind(national_id)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await
    .expect("insert patient")
    .last_insert_rowid()
}

pub(crate) async fn seed_vitals_at(
    pool: &SqlitePool,
    patient_id: i64,
    recorded_by: i64,
    recorded_at: DateTime<Utc>,
) -> i64 {
    sqlx::query(
        "INSERT INTO vitals (patient_id, blood_pressure, pulse, weight_kg, height_cm, bmi,
         recorded_by, recorded_at)
         VALUES (?, '120/80', 72, 70.0, 175.0, 22.86, ?, ?)",
    )
    .bind(patient_id)
    .bind(recorded_by)
    .bind(recorded_at)
    .execute(pool)
    .await
    .expect("insert vitals")
    .last_insert_rowid()
}

pub(crate) async fn seed_cie10(pool: &SqlitePool, code: &str, description: &str) -> i64 {
    sqlx::query("INSERT INTO cie10_codes (code, description) VALUES (?, ?)")
        .bind(code)
        .bind(description)
        .execute(pool)
        .await
        .expect("insert cie10")
        .last_insert_rowid()
}

pub(crate) async fn seed_medication(pool: &SqlitePool, name: &str) -> i64 {
    sqlx::query("INSERT INTO medications (name, presentation) VALUES (?, 'tableta')")
        .bind(name)
        .execute(pool)
        .await
        .expect("insert medication")
        .last_insert_rowid()
}

/// A physician, a nurse, a patient and same-day vitals, ready for a consultation.
pub(crate) struct Clinic {
    pub physician_id: i64,
    pub nurse_id: i64,
    pub patient_id: i64,
    pub vitals_id: i64,
}

pub(crate) async fn seed_clinic(pool: &SqlitePool) -> Clinic {
    let physician_id = seed_user(pool, "medico", "physician").await;
    let nurse_id = seed_user(pool, "enfermera", "nurse").await;
    let patient_id = seed_patient(pool, "12345678").await;
    let vitals_id = seed_vitals_at(pool, patient_id, nurse_id, Utc::now()).await;
    Clinic {
        physician_id,
        nurse_id,
        patient_id,
        vitals_id,
    }
}
