//! Vitals records.
//!
//! A vitals record is taken by a nurse or physician before a consultation is opened. The
//! consultation engine only looks at records taken on the current UTC calendar day; see
//! [`crate::prerequisites::has_vitals_today`].

use crate::audit::{AuditAction, AuditEvent};
use crate::db::Store;
use crate::error::{EmrError, EmrResult};
use crate::validation::finish;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PulseType {
    Regular,
    Irregular,
}

impl PulseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PulseType::Regular => "regular",
            PulseType::Irregular => "irregular",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "regular" => Some(PulseType::Regular),
            "irregular" => Some(PulseType::Irregular),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct Vitals {
    #[serde(rename = "idSignosVitales")]
    pub id: i64,
    #[serde(rename = "idFichaClinica")]
    pub patient_id: i64,
    #[serde(rename = "idConsulta")]
    pub consultation_id: Option<i64>,
    #[serde(rename = "presionArterial")]
    pub blood_pressure: Option<String>,
    #[serde(rename = "pulso")]
    pub pulse: Option<i64>,
    #[serde(rename = "tipoPulso")]
    pub pulse_type: Option<String>,
    #[serde(rename = "saturacionOxigeno")]
    pub oxygen_saturation: Option<f64>,
    #[serde(rename = "frecuenciaRespiratoria")]
    pub respiratory_rate: Option<i64>,
    #[serde(rename = "peso")]
    pub weight_kg: Option<f64>,
    #[serde(rename = "talla")]
    pub height_cm: Option<f64>,
    #[serde(rename = "temperatura")]
    pub temperature_c: Option<f64>,
    #[serde(rename = "imc")]
    pub bmi: Option<f64>,
    #[serde(rename = "registradoPor")]
    pub recorded_by: i64,
    #[serde(rename = "fechaRegistro")]
    pub recorded_at: DateTime<Utc>,
}

pub(crate) const VITALS_COLUMNS: &str = "id, patient_id, consultation_id, blood_pressure, pulse,
    pulse_type, oxygen_saturation, respiratory_rate, weight_kg, height_cm, temperature_c, bmi,
    recorded_by, recorded_at";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewVitals {
    #[serde(rename = "presionArterial", default)]
    pub blood_pressure: Option<String>,
    #[serde(rename = "pulso", default)]
    pub pulse: Option<i64>,
    #[serde(rename = "tipoPulso", default)]
    pub pulse_type: Option<String>,
    #[serde(rename = "saturacionOxigeno", default)]
    pub oxygen_saturation: Option<f64>,
    #[serde(rename = "frecuenciaRespiratoria", default)]
    pub respiratory_rate: Option<i64>,
    #[serde(rename = "peso", default)]
    pub weight_kg: Option<f64>,
    #[serde(rename = "talla", default)]
    pub height_cm: Option<f64>,
    #[serde(rename = "temperatura", default)]
    pub temperature_c: Option<f64>,
}

/// Body-mass index from weight in kilograms and height in centimetres, rounded to two
/// decimals. `None` when either input is missing or not positive.
pub fn compute_bmi(weight_kg: Option<f64>, height_cm: Option<f64>) -> Option<f64> {
    let (weight, height) = (weight_kg?, height_cm?);
    if weight <= 0.0 || height <= 0.0 {
        return None;
    }
    let metres = height / 100.0;
    Some((weight / (metres * metres) * 100.0).round() / 100.0)
}

fn is_blood_pressure(raw: &str) -> bool {
    let Some((systolic, diastolic)) = raw.split_once('/') else {
        return false;
    };
    [systolic, diastolic]
        .iter()
        .all(|part| (2..=3).contains(&part.len()) && part.bytes().all(|b| b.is_ascii_digit()))
}

fn check_range<T>(errors: &mut Vec<String>, field: &str, value: Option<T>, min: T, max: T)
where
    T: PartialOrd + std::fmt::Display + Copy,
{
    if let Some(v) = value {
        if v < min || v > max {
            errors.push(format!("{field} must be between {min} and {max}"));
        }
    }
}

impl NewVitals {
    fn is_empty(&self) -> bool {
        self.blood_pressure.is_none()
            && self.pulse.is_none()
            && self.oxygen_saturation.is_none()
            && self.respiratory_rate.is_none()
            && self.weight_kg.is_none()
            && self.height_cm.is_none()
            && self.temperature_c.is_none()
    }

    fn validate(&self) -> EmrResult<Option<PulseType>> {
        let mut errors = Vec::new();
        if self.is_empty() {
            errors.push("at least one measurement is required".to_string());
        }
        if let Some(bp) = &self.blood_pressure {
            if !is_blood_pressure(bp.trim()) {
                errors.push("presionArterial must look like 120/80".to_string());
            }
        }
        check_range(&mut errors, "pulso", self.pulse, 20, 250);
        check_range(&mut errors, "saturacionOxigeno", self.oxygen_saturation, 50.0, 100.0);
        check_range(&mut errors, "frecuenciaRespiratoria", self.respiratory_rate, 5, 60);
        check_range(&mut errors, "temperatura", self.temperature_c, 30.0, 45.0);
        check_range(&mut errors, "peso", self.weight_kg, 0.5, 400.0);
        check_range(&mut errors, "talla", self.height_cm, 30.0, 250.0);

        let pulse_type = match self.pulse_type.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => {
                let parsed = PulseType::parse(raw);
                if parsed.is_none() {
                    errors.push("tipoPulso must be 'regular' or 'irregular'".to_string());
                }
                parsed
            }
        };
        finish(errors)?;
        Ok(pulse_type)
    }
}

#[derive(Clone, Debug)]
pub struct VitalsService {
    store: Store,
}

impl VitalsService {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Records a vitals set for a patient, computing the BMI.
    ///
    /// # Errors
    ///
    /// - [`EmrError::PatientNotFound`] if the patient does not exist.
    /// - [`EmrError::Validation`] listing every out-of-range measurement.
    pub async fn record(
        &self,
        actor_id: i64,
        patient_id: i64,
        input: NewVitals,
    ) -> EmrResult<Vitals> {
        let pulse_type = input.validate()?;
        if !super::patient_exists(self.store.pool(), patient_id).await? {
            return Err(EmrError::PatientNotFound);
        }

        let bmi = compute_bmi(input.weight_kg, input.height_cm);
        let id = sqlx::query(
            "INSERT INTO vitals (patient_id, blood_pressure, pulse, pulse_type, oxygen_saturation,
             respiratory_rate, weight_kg, height_cm, temperature_c, bmi, recorded_by, recorded_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(patient_id)
        .bind(input.blood_pressure.as_deref().map(str::trim))
        .bind(input.pulse)
        .bind(pulse_type.map(|p| p.as_str()))
        .bind(input.oxygen_saturation)
        .bind(input.respiratory_rate)
        .bind(input.weight_kg)
        .bind(input.height_cm)
        .bind(input.temperature_c)
        .bind(bmi)
        .bind(actor_id)
        .bind(Utc::now())
        .execute(self.store.pool())
        .await?
        .last_insert_rowid();

        tracing::info!(patient_id, vitals_id = id, "vitals recorded");
        self.store
            .audit()
            .emit(AuditEvent::new(actor_id, AuditAction::VitalsRecorded, "vitals", id));
        self.get(id).await
    }

    pub async fn get(&self, id: i64) -> EmrResult<Vitals> {
        sqlx::query_as(&format!("SELECT {VITALS_COLUMNS} FROM vitals WHERE id = ?"))
            .bind(id)
            .fetch_optional(self.store.pool())
            .await?
            .ok_or(EmrError::NotFound("vitals record"))
    }

    /// All vitals for a patient, newest first.
    pub async fn list(&self, patient_id: i64) -> EmrResult<Vec<Vitals>> {
        if !super::patient_exists(self.store.pool(), patient_id).await? {
            return Err(EmrError::PatientNotFound);
        }
        let rows = sqlx::query_as(&format!(
            "SELECT {VITALS_COLUMNS} FROM vitals WHERE patient_id = ?
             ORDER BY recorded_at DESC, id DESC"
        ))
        .bind(patient_id)
        .fetch_all(self.store.pool())
        .await?;
        Ok(rows)
    }
}

/// Most recent vitals for the patient recorded in `[start, end)`.
pub(crate) async fn latest_between(
    pool: &SqlitePool,
    patient_id: i64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> EmrResult<Option<Vitals>> {
    let row = sqlx::query_as(&format!(
        "SELECT {VITALS_COLUMNS} FROM vitals
         WHERE patient_id = ? AND recorded_at >= ? AND recorded_at < ?
         ORDER BY recorded_at DESC, id DESC
         LIMIT 1"
    ))
    .bind(patient_id)
    .bind(start)
    .bind(end)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Whether vitals record `vitals_id` exists and was taken on `day` (UTC).
pub(crate) async fn recorded_on(
    pool: &SqlitePool,
    vitals_id: i64,
    day: NaiveDate,
) -> EmrResult<bool> {
    let recorded_at: Option<DateTime<Utc>> =
        sqlx::query_scalar("SELECT recorded_at FROM vitals WHERE id = ?")
            .bind(vitals_id)
            .fetch_optional(pool)
            .await?;
    Ok(recorded_at.is_some_and(|t| t.date_naive() == day))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{seed_patient, seed_user, test_store};

    #[test]
    fn bmi_is_rounded_to_two_decimals() {
        assert_eq!(compute_bmi(Some(70.0), Some(175.0)), Some(22.86));
        assert_eq!(compute_bmi(None, Some(175.0)), None);
        assert_eq!(compute_bmi(Some(70.0), Some(0.0)), None);
        assert_eq!(compute_bmi(Some(0.0), Some(175.0)), None);
    }

    #[test]
    fn blood_pressure_shape() {
        assert!(is_blood_pressure("120/80"));
        assert!(is_blood_pressure("90/60"));
        assert!(!is_blood_pressure("120-80"));
        assert!(!is_blood_pressure("1200/80"));
        assert!(!is_blood_pressure("abc/80"));
    }

    #[test]
    fn out_of_range_values_are_itemised() {
        let input = NewVitals {
            pulse: Some(300),
            oxygen_saturation: Some(20.0),
            pulse_type: Some("fuerte".into()),
            ..Default::default()
        };
        match input.validate() {
            Err(EmrError::Validation(errors)) => assert_eq!(errors.len(), 3, "{errors:?}"),
            other => panic!("expected validation error, got {other:?}"),
        }
        assert!(matches!(
            NewVitals::default().validate(),
            Err(EmrError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn record_stores_bmi_and_lists_newest_first() {
        let (_dir, store, mut audit) = test_store().await;
        let nurse = seed_user(store.pool(), "enfermera", "nurse").await;
        let patient_id = seed_patient(store.pool(), "12345678").await;
        let service = VitalsService::new(store);

        let first = service
            .record(
                nurse,
                patient_id,
                NewVitals {
                    blood_pressure: Some("120/80".into()),
                    weight_kg: Some(70.0),
                    height_cm: Some(175.0),
                    pulse_type: Some("Regular".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(first.bmi, Some(22.86));
        assert_eq!(first.pulse_type.as_deref(), Some("regular"));
        assert_eq!(
            audit.try_next().map(|e| e.action),
            Some(AuditAction::VitalsRecorded)
        );

        let second = service
            .record(
                nurse,
                patient_id,
                NewVitals {
                    pulse: Some(80),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(second.bmi, None);

        let listed = service.list(patient_id).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, second.id);
    }

    #[tokio::test]
    async fn record_requires_existing_patient() {
        let (_dir, store, _audit) = test_store().await;
        let nurse = seed_user(store.pool(), "enfermera", "nurse").await;
        let service = VitalsService::new(store);
        let err = service
            .record(
                nurse,
                42,
                NewVitals {
                    pulse: Some(70),
                    ..Default::default()
                },
            )
            .await
            .expect_err("unknown patient should fail");
        assert!(matches!(err, EmrError::PatientNotFound));
    }
}
