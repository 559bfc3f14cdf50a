//! Appointment scheduling.
//!
//! A clinician cannot hold two live appointments in the same date and time slot; only
//! cancelled appointments free the slot. The consultation engine moves linked
//! appointments to `in_progress` and `attended` through [`set_status`].

use crate::audit::{AuditAction, AuditEvent};
use crate::constants::{DETAIL_MAX_LEN, SEARCH_LIMIT};
use crate::db::Store;
use crate::error::{EmrError, EmrResult};
use crate::update::{UpdateSet, Value};
use crate::validation::{capped, parse_date, parse_time, present};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Sqlite, SqlitePool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Scheduled,
    Confirmed,
    InProgress,
    Attended,
    Cancelled,
    NoShow,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Scheduled => "scheduled",
            AppointmentStatus::Confirmed => "confirmed",
            AppointmentStatus::InProgress => "in_progress",
            AppointmentStatus::Attended => "attended",
            AppointmentStatus::Cancelled => "cancelled",
            AppointmentStatus::NoShow => "no_show",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "scheduled" => Some(AppointmentStatus::Scheduled),
            "confirmed" => Some(AppointmentStatus::Confirmed),
            "in_progress" => Some(AppointmentStatus::InProgress),
            "attended" => Some(AppointmentStatus::Attended),
            "cancelled" => Some(AppointmentStatus::Cancelled),
            "no_show" => Some(AppointmentStatus::NoShow),
            _ => None,
        }
    }

    /// Cancelled, attended and no-show appointments accept no further changes.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AppointmentStatus::Cancelled | AppointmentStatus::Attended | AppointmentStatus::NoShow
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Appointment {
    #[serde(rename = "idCita")]
    pub id: i64,
    #[serde(rename = "idFichaClinica")]
    pub patient_id: i64,
    #[serde(rename = "idMedico")]
    pub clinician_id: i64,
    #[serde(rename = "fecha")]
    pub date: NaiveDate,
    #[serde(rename = "hora")]
    pub time: String,
    #[serde(rename = "motivo")]
    pub reason: Option<String>,
    #[serde(rename = "observaciones")]
    pub notes: Option<String>,
    #[serde(rename = "estado")]
    pub status: AppointmentStatus,
    #[serde(rename = "fechaRegistro")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "fechaActualizacion")]
    pub updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct AppointmentRow {
    id: i64,
    patient_id: i64,
    clinician_id: i64,
    date: NaiveDate,
    time: String,
    reason: Option<String>,
    notes: Option<String>,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<AppointmentRow> for Appointment {
    type Error = EmrError;

    fn try_from(row: AppointmentRow) -> Result<Self, Self::Error> {
        let status = AppointmentStatus::parse(&row.status).ok_or_else(|| {
            EmrError::CorruptRecord(format!("appointment {} status '{}'", row.id, row.status))
        })?;
        Ok(Appointment {
            id: row.id,
            patient_id: row.patient_id,
            clinician_id: row.clinician_id,
            date: row.date,
            time: row.time,
            reason: row.reason,
            notes: row.notes,
            status,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const APPOINTMENT_COLUMNS: &str =
    "id, patient_id, clinician_id, date, time, reason, notes, status, created_at, updated_at";

#[derive(Debug, Clone, Deserialize)]
pub struct NewAppointment {
    #[serde(rename = "idFichaClinica")]
    pub patient_id: i64,
    #[serde(rename = "idMedico")]
    pub clinician_id: i64,
    #[serde(rename = "fecha")]
    pub date: String,
    #[serde(rename = "hora")]
    pub time: String,
    #[serde(rename = "motivo", default)]
    pub reason: Option<String>,
    #[serde(rename = "observaciones", default)]
    pub notes: Option<String>,
}

/// Sparse appointment edit. `estado` may only move between scheduled, confirmed and no-show;
/// cancellation has its own operation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppointmentPatch {
    #[serde(rename = "idMedico", default)]
    pub clinician_id: Option<i64>,
    #[serde(rename = "fecha", default)]
    pub date: Option<String>,
    #[serde(rename = "hora", default)]
    pub time: Option<String>,
    #[serde(rename = "motivo", default, deserialize_with = "present")]
    pub reason: Option<Option<String>>,
    #[serde(rename = "observaciones", default, deserialize_with = "present")]
    pub notes: Option<Option<String>>,
    #[serde(rename = "estado", default)]
    pub status: Option<String>,
}

impl AppointmentPatch {
    fn into_update_set(self) -> UpdateSet {
        let mut set = UpdateSet::new("appointments");
        set.text("reason", "motivo", self.reason, DETAIL_MAX_LEN)
            .text("notes", "observaciones", self.notes, DETAIL_MAX_LEN);
        if let Some(id) = self.clinician_id {
            set.set("clinician_id", Value::Integer(Some(id)));
        }
        if let Some(raw) = self.date {
            match parse_date("fecha", &raw) {
                Ok(date) => {
                    set.set("date", Value::Date(Some(date)));
                }
                Err(e) => {
                    set.reject(e.to_string());
                }
            }
        }
        if let Some(raw) = self.time {
            match parse_time("hora", &raw) {
                Ok(time) => {
                    set.set("time", Value::Text(Some(time)));
                }
                Err(e) => {
                    set.reject(e.to_string());
                }
            }
        }
        if let Some(raw) = self.status {
            match AppointmentStatus::parse(&raw) {
                Some(
                    status @ (AppointmentStatus::Scheduled
                    | AppointmentStatus::Confirmed
                    | AppointmentStatus::NoShow),
                ) => {
                    set.set("status", Value::Text(Some(status.as_str().to_string())));
                }
                _ => {
                    set.reject(format!(
                        "estado can only be set to scheduled, confirmed or no_show, got '{raw}'"
                    ));
                }
            }
        }
        set
    }
}

pub(crate) async fn find<'c, E>(executor: E, id: i64) -> EmrResult<Option<Appointment>>
where
    E: sqlx::Executor<'c, Database = Sqlite>,
{
    let row: Option<AppointmentRow> = sqlx::query_as(&format!(
        "SELECT {APPOINTMENT_COLUMNS} FROM appointments WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(executor)
    .await?;
    row.map(Appointment::try_from).transpose()
}

/// Moves an appointment to `status`. Terminal appointments are left untouched.
pub(crate) async fn set_status<'c, E>(
    executor: E,
    id: i64,
    status: AppointmentStatus,
) -> EmrResult<u64>
where
    E: sqlx::Executor<'c, Database = Sqlite>,
{
    let result = sqlx::query(
        "UPDATE appointments SET status = ?, updated_at = ?
         WHERE id = ? AND status NOT IN ('cancelled', 'attended', 'no_show')",
    )
    .bind(status.as_str())
    .bind(Utc::now())
    .bind(id)
    .execute(executor)
    .await?;
    Ok(result.rows_affected())
}

async fn ensure_physician(pool: &SqlitePool, clinician_id: i64) -> EmrResult<()> {
    let found: Option<(String, bool)> =
        sqlx::query_as("SELECT role, active FROM users WHERE id = ?")
            .bind(clinician_id)
            .fetch_optional(pool)
            .await?;
    match found {
        Some((role, true)) if role == "physician" => Ok(()),
        Some(_) => Err(EmrError::InvalidInput(
            "idMedico must reference an active physician".into(),
        )),
        None => Err(EmrError::NotFound("clinician")),
    }
}

async fn slot_taken(
    pool: &SqlitePool,
    clinician_id: i64,
    date: NaiveDate,
    time: &str,
    ignore_id: Option<i64>,
) -> EmrResult<bool> {
    let found: Option<i64> = sqlx::query_scalar(
        "SELECT 1 FROM appointments
         WHERE clinician_id = ? AND date = ? AND time = ? AND status != 'cancelled' AND id != ?
         LIMIT 1",
    )
    .bind(clinician_id)
    .bind(date)
    .bind(time)
    .bind(ignore_id.unwrap_or(-1))
    .fetch_optional(pool)
    .await?;
    Ok(found.is_some())
}

#[derive(Clone, Debug)]
pub struct AppointmentService {
    store: Store,
}

impl AppointmentService {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Books an appointment.
    ///
    /// # Errors
    ///
    /// - [`EmrError::PatientNotFound`] / [`EmrError::NotFound`] for unknown references.
    /// - [`EmrError::InvalidInput`] for a bad date, time or non-physician clinician.
    /// - [`EmrError::SchedulingConflict`] when the slot is taken.
    pub async fn create(&self, actor_id: i64, input: NewAppointment) -> EmrResult<Appointment> {
        let date = parse_date("fecha", &input.date)?;
        let time = parse_time("hora", &input.time)?;
        let pool = self.store.pool();
        if !super::patient_exists(pool, input.patient_id).await? {
            return Err(EmrError::PatientNotFound);
        }
        ensure_physician(pool, input.clinician_id).await?;
        if slot_taken(pool, input.clinician_id, date, &time, None).await? {
            return Err(EmrError::SchedulingConflict);
        }

        let now = Utc::now();
        let id = sqlx::query(
            "INSERT INTO appointments (patient_id, clinician_id, date, time, reason, notes,
             status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, 'scheduled', ?, ?)",
        )
        .bind(input.patient_id)
        .bind(input.clinician_id)
        .bind(date)
        .bind(&time)
        .bind(capped(input.reason, DETAIL_MAX_LEN))
        .bind(capped(input.notes, DETAIL_MAX_LEN))
        .bind(now)
        .bind(now)
        .execute(pool)
        .await?
        .last_insert_rowid();

        tracing::info!(appointment_id = id, clinician_id = input.clinician_id, "appointment booked");
        self.store
            .audit()
            .emit(AuditEvent::new(actor_id, AuditAction::AppointmentCreated, "appointment", id));
        self.get(id).await
    }

    pub async fn get(&self, id: i64) -> EmrResult<Appointment> {
        find(self.store.pool(), id)
            .await?
            .ok_or(EmrError::NotFound("appointment"))
    }

    /// Lists appointments, optionally filtered by day and clinician, ordered by slot.
    pub async fn list(
        &self,
        date: Option<NaiveDate>,
        clinician_id: Option<i64>,
    ) -> EmrResult<Vec<Appointment>> {
        let mut qb: sqlx::QueryBuilder<'_, Sqlite> = sqlx::QueryBuilder::new(format!(
            "SELECT {APPOINTMENT_COLUMNS} FROM appointments WHERE 1 = 1"
        ));
        if let Some(date) = date {
            qb.push(" AND date = ").push_bind(date);
        }
        if let Some(clinician_id) = clinician_id {
            qb.push(" AND clinician_id = ").push_bind(clinician_id);
        }
        qb.push(" ORDER BY date, time LIMIT ").push_bind(SEARCH_LIMIT * 4);

        let rows: Vec<AppointmentRow> = qb.build_query_as().fetch_all(self.store.pool()).await?;
        rows.into_iter().map(Appointment::try_from).collect()
    }

    /// Applies a sparse edit; the slot rule is re-checked when date, time or clinician change.
    ///
    /// The status of an appointment whose consultation is under way (`in_progress`) is owned
    /// by the consultation and cannot be edited here.
    ///
    /// # Errors
    ///
    /// - [`EmrError::AppointmentClosed`] when the appointment is terminal, or in progress and
    ///   the patch sets `estado`.
    /// - [`EmrError::SchedulingConflict`] when the new slot is taken.
    /// - [`EmrError::NoFieldsToUpdate`] / [`EmrError::Validation`] from the patch.
    pub async fn update(
        &self,
        actor_id: i64,
        id: i64,
        patch: AppointmentPatch,
    ) -> EmrResult<Appointment> {
        let current = self.get(id).await?;
        if current.status.is_terminal() {
            return Err(EmrError::AppointmentClosed(current.status.as_str()));
        }

        let set = patch.into_update_set();
        let clinician_id = match set.value("clinician_id") {
            Some(Value::Integer(Some(v))) => *v,
            _ => current.clinician_id,
        };
        let date = match set.value("date") {
            Some(Value::Date(Some(d))) => *d,
            _ => current.date,
        };
        let time = match set.value("time") {
            Some(Value::Text(Some(t))) => t.clone(),
            _ => current.time.clone(),
        };
        let slot_changed = set.touches("clinician_id") || set.touches("date") || set.touches("time");
        let status_changed = set.touches("status");
        let pending = set.build()?;
        if status_changed && current.status == AppointmentStatus::InProgress {
            return Err(EmrError::AppointmentClosed(current.status.as_str()));
        }

        if slot_changed {
            let pool = self.store.pool();
            if clinician_id != current.clinician_id {
                ensure_physician(pool, clinician_id).await?;
            }
            if slot_taken(pool, clinician_id, date, &time, Some(id)).await? {
                return Err(EmrError::SchedulingConflict);
            }
        }

        let guard = if status_changed {
            "status IN ('scheduled', 'confirmed')"
        } else {
            "status NOT IN ('cancelled', 'attended', 'no_show')"
        };
        let columns = pending.columns().join(",");
        let mut tx = self.store.pool().begin().await?;
        let claimed = sqlx::query(&format!(
            "UPDATE appointments SET updated_at = ? WHERE id = ? AND {guard}"
        ))
        .bind(Utc::now())
        .bind(id)
        .execute(&mut *tx)
        .await?;
        if claimed.rows_affected() == 0 {
            drop(tx);
            let latest = self.get(id).await?;
            return Err(EmrError::AppointmentClosed(latest.status.as_str()));
        }
        pending.execute(&mut *tx, "id", id).await?;
        tx.commit().await?;
        self.store.audit().emit(
            AuditEvent::new(actor_id, AuditAction::AppointmentUpdated, "appointment", id)
                .with_detail(Some(columns)),
        );
        self.get(id).await
    }

    /// Cancels a scheduled or confirmed appointment, freeing its slot.
    ///
    /// An appointment already in progress belongs to its consultation and is refused with
    /// [`EmrError::AppointmentClosed`], like terminal ones.
    pub async fn cancel(&self, actor_id: i64, id: i64) -> EmrResult<Appointment> {
        self.get(id).await?;
        let result = sqlx::query(
            "UPDATE appointments SET status = 'cancelled', updated_at = ?
             WHERE id = ? AND status IN ('scheduled', 'confirmed')",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(self.store.pool())
        .await?;
        if result.rows_affected() == 0 {
            let latest = self.get(id).await?;
            return Err(EmrError::AppointmentClosed(latest.status.as_str()));
        }

        tracing::info!(appointment_id = id, "appointment cancelled");
        self.store
            .audit()
            .emit(AuditEvent::new(actor_id, AuditAction::AppointmentCancelled, "appointment", id));
        self.get(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{seed_patient, seed_user, test_store};

    struct Fixture {
        _dir: tempfile::TempDir,
        service: AppointmentService,
        desk: i64,
        physician: i64,
        patient: i64,
    }

    async fn fixture() -> Fixture {
        let (dir, store, _audit) = test_store().await;
        let desk = seed_user(store.pool(), "admision", "front_desk").await;
        let physician = seed_user(store.pool(), "medico", "physician").await;
        let patient = seed_patient(store.pool(), "12345678").await;
        Fixture {
            _dir: dir,
            service: AppointmentService::new(store),
            desk,
            physician,
            patient,
        }
    }

    fn booking(f: &Fixture, time: &str) -> NewAppointment {
        NewAppointment {
            patient_id: f.patient,
            clinician_id: f.physician,
            date: "2030-01-15".into(),
            time: time.into(),
            reason: Some("Control de presión".into()),
            notes: None,
        }
    }

    #[tokio::test]
    async fn same_slot_conflicts_until_cancelled() {
        let f = fixture().await;
        let first = f.service.create(f.desk, booking(&f, "9:30")).await.unwrap();
        assert_eq!(first.time, "09:30");
        assert_eq!(first.status, AppointmentStatus::Scheduled);

        let err = f
            .service
            .create(f.desk, booking(&f, "09:30"))
            .await
            .expect_err("slot is taken");
        assert!(matches!(err, EmrError::SchedulingConflict));

        let cancelled = f.service.cancel(f.desk, first.id).await.unwrap();
        assert_eq!(cancelled.status, AppointmentStatus::Cancelled);
        f.service.create(f.desk, booking(&f, "09:30")).await.unwrap();

        let err = f
            .service
            .cancel(f.desk, first.id)
            .await
            .expect_err("already cancelled");
        assert!(matches!(err, EmrError::AppointmentClosed("cancelled")));
    }

    #[tokio::test]
    async fn clinician_must_be_physician() {
        let f = fixture().await;
        let mut input = booking(&f, "10:00");
        input.clinician_id = f.desk;
        let err = f.service.create(f.desk, input).await.expect_err("not a physician");
        assert!(matches!(err, EmrError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn moving_into_a_taken_slot_is_rejected() {
        let f = fixture().await;
        f.service.create(f.desk, booking(&f, "10:00")).await.unwrap();
        let second = f.service.create(f.desk, booking(&f, "11:00")).await.unwrap();

        let err = f
            .service
            .update(
                f.desk,
                second.id,
                AppointmentPatch {
                    time: Some("10:00".into()),
                    ..Default::default()
                },
            )
            .await
            .expect_err("slot is taken");
        assert!(matches!(err, EmrError::SchedulingConflict));

        let updated = f
            .service
            .update(
                f.desk,
                second.id,
                AppointmentPatch {
                    status: Some("confirmed".into()),
                    notes: Some(Some("Trae exámenes".into())),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.status, AppointmentStatus::Confirmed);
        assert_eq!(updated.time, "11:00");

        let listed = f
            .service
            .list(NaiveDate::from_ymd_opt(2030, 1, 15), Some(f.physician))
            .await
            .unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].time, "10:00");
    }

    #[tokio::test]
    async fn appointment_in_progress_keeps_its_status() {
        let f = fixture().await;
        let booked = f.service.create(f.desk, booking(&f, "08:00")).await.unwrap();
        set_status(f.service.store.pool(), booked.id, AppointmentStatus::InProgress)
            .await
            .unwrap();

        let err = f
            .service
            .update(
                f.desk,
                booked.id,
                AppointmentPatch {
                    status: Some("no_show".into()),
                    ..Default::default()
                },
            )
            .await
            .expect_err("status belongs to the consultation");
        assert!(matches!(err, EmrError::AppointmentClosed("in_progress")));

        let err = f
            .service
            .cancel(f.desk, booked.id)
            .await
            .expect_err("consultation under way");
        assert!(matches!(err, EmrError::AppointmentClosed("in_progress")));

        let noted = f
            .service
            .update(
                f.desk,
                booked.id,
                AppointmentPatch {
                    notes: Some(Some("Paciente en consultorio".into())),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(noted.status, AppointmentStatus::InProgress);
        assert_eq!(noted.notes.as_deref(), Some("Paciente en consultorio"));
    }
}
