//! Prescriptions: one per consultation, with medication lines.

use super::catalog::missing_medications;
use crate::constants::{DETAIL_MAX_LEN, PRESCRIPTION_FIELD_MAX_LEN};
use crate::error::{is_unique_violation, EmrError, EmrResult};
use crate::validation::{capped, check_len, finish};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Sqlite, SqliteConnection, SqlitePool};

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct PrescriptionItem {
    #[serde(rename = "idDetalle")]
    pub id: i64,
    #[serde(rename = "idMedicamento")]
    pub medication_id: i64,
    #[serde(rename = "medicamento")]
    pub medication_name: String,
    #[serde(rename = "dosis")]
    pub dose: String,
    #[serde(rename = "frecuencia")]
    pub frequency: String,
    #[serde(rename = "duracion")]
    pub duration: String,
    #[serde(rename = "observaciones")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prescription {
    #[serde(rename = "idReceta")]
    pub id: i64,
    #[serde(rename = "idConsulta")]
    pub consultation_id: i64,
    #[serde(rename = "indicacionesGenerales")]
    pub general_instructions: Option<String>,
    #[serde(rename = "medicamentos")]
    pub items: Vec<PrescriptionItem>,
    #[serde(rename = "fechaRegistro")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewPrescriptionItem {
    #[serde(rename = "idMedicamento")]
    pub medication_id: i64,
    #[serde(rename = "dosis")]
    pub dose: String,
    #[serde(rename = "frecuencia")]
    pub frequency: String,
    #[serde(rename = "duracion")]
    pub duration: String,
    #[serde(rename = "observaciones", default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewPrescription {
    #[serde(rename = "indicacionesGenerales", default)]
    pub general_instructions: Option<String>,
    #[serde(rename = "medicamentos", default)]
    pub items: Vec<NewPrescriptionItem>,
}

impl NewPrescription {
    fn validate(&self) -> EmrResult<()> {
        let has_instructions = self
            .general_instructions
            .as_deref()
            .is_some_and(|s| !s.trim().is_empty());
        if self.items.is_empty() && !has_instructions {
            return Err(EmrError::InvalidInput(
                "a prescription needs at least one medication or general instructions".into(),
            ));
        }

        let mut errors = Vec::new();
        for (i, item) in self.items.iter().enumerate() {
            for (field, value) in [
                ("dosis", &item.dose),
                ("frecuencia", &item.frequency),
                ("duracion", &item.duration),
            ] {
                let name = format!("medicamentos[{i}].{field}");
                if value.trim().is_empty() {
                    errors.push(format!("{name} cannot be empty"));
                } else {
                    check_len(&mut errors, &name, value.trim(), PRESCRIPTION_FIELD_MAX_LEN);
                }
            }
        }
        finish(errors)
    }
}

pub(crate) async fn exists<'c, E>(executor: E, consultation_id: i64) -> EmrResult<bool>
where
    E: sqlx::Executor<'c, Database = Sqlite>,
{
    let found: Option<i64> =
        sqlx::query_scalar("SELECT 1 FROM prescriptions WHERE consultation_id = ?")
            .bind(consultation_id)
            .fetch_optional(executor)
            .await?;
    Ok(found.is_some())
}

/// Validates a prescription and its medication references against the catalog.
///
/// # Errors
///
/// - [`EmrError::InvalidInput`] / [`EmrError::Validation`] for malformed input.
/// - [`EmrError::NotFound`] when a medication id is not in the catalog.
pub(crate) async fn check(pool: &SqlitePool, input: &NewPrescription) -> EmrResult<()> {
    input.validate()?;
    let medication_ids: Vec<i64> = input.items.iter().map(|i| i.medication_id).collect();
    let missing = missing_medications(pool, &medication_ids).await?;
    if !missing.is_empty() {
        tracing::debug!(?missing, "prescription references unknown medications");
        return Err(EmrError::NotFound("medication"));
    }
    Ok(())
}

/// Inserts a checked prescription with all its lines on `conn`, which the caller runs
/// inside its transaction.
///
/// # Errors
///
/// - [`EmrError::PrescriptionExists`] when the consultation already has one.
pub(crate) async fn insert(
    conn: &mut SqliteConnection,
    consultation_id: i64,
    input: NewPrescription,
) -> EmrResult<i64> {
    if exists(&mut *conn, consultation_id).await? {
        return Err(EmrError::PrescriptionExists);
    }

    let prescription_id = sqlx::query(
        "INSERT INTO prescriptions (consultation_id, general_instructions, created_at)
         VALUES (?, ?, ?)",
    )
    .bind(consultation_id)
    .bind(capped(input.general_instructions, DETAIL_MAX_LEN))
    .bind(Utc::now())
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            EmrError::PrescriptionExists
        } else {
            EmrError::Database(e)
        }
    })?
    .last_insert_rowid();

    for item in &input.items {
        sqlx::query(
            "INSERT INTO prescription_items
             (prescription_id, medication_id, dose, frequency, duration, notes)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(prescription_id)
        .bind(item.medication_id)
        .bind(item.dose.trim())
        .bind(item.frequency.trim())
        .bind(item.duration.trim())
        .bind(capped(item.notes.clone(), DETAIL_MAX_LEN))
        .execute(&mut *conn)
        .await?;
    }
    Ok(prescription_id)
}

pub(crate) async fn find(
    pool: &SqlitePool,
    consultation_id: i64,
) -> EmrResult<Option<Prescription>> {
    let header: Option<(i64, Option<String>, DateTime<Utc>)> = sqlx::query_as(
        "SELECT id, general_instructions, created_at FROM prescriptions WHERE consultation_id = ?",
    )
    .bind(consultation_id)
    .fetch_optional(pool)
    .await?;
    let Some((id, general_instructions, created_at)) = header else {
        return Ok(None);
    };

    let items = sqlx::query_as(
        "SELECT i.id, i.medication_id, m.name AS medication_name, i.dose, i.frequency,
                i.duration, i.notes
         FROM prescription_items i
         JOIN medications m ON m.id = i.medication_id
         WHERE i.prescription_id = ?
         ORDER BY i.id",
    )
    .bind(id)
    .fetch_all(pool)
    .await?;

    Ok(Some(Prescription {
        id,
        consultation_id,
        general_instructions,
        items,
        created_at,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(dose: &str) -> NewPrescriptionItem {
        NewPrescriptionItem {
            medication_id: 1,
            dose: dose.into(),
            frequency: "cada 12 horas".into(),
            duration: "30 días".into(),
            notes: None,
        }
    }

    #[test]
    fn empty_prescription_is_rejected() {
        assert!(matches!(
            NewPrescription::default().validate(),
            Err(EmrError::InvalidInput(_))
        ));
        let only_instructions = NewPrescription {
            general_instructions: Some("Dieta hiposódica".into()),
            items: vec![],
        };
        assert!(only_instructions.validate().is_ok());
    }

    #[test]
    fn line_errors_carry_their_index() {
        let input = NewPrescription {
            general_instructions: None,
            items: vec![item("10 mg"), item(" ")],
        };
        match input.validate() {
            Err(EmrError::Validation(errors)) => {
                assert_eq!(errors, vec!["medicamentos[1].dosis cannot be empty".to_string()]);
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }
}
