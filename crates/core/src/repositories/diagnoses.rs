//! Diagnosis attachments of a consultation.
//!
//! State gating (ownership, pending status) happens in the consultation engine; the
//! functions here only enforce catalog existence and uniqueness per consultation.

use super::catalog::cie10_exists;
use crate::constants::DETAIL_MAX_LEN;
use crate::error::{is_unique_violation, EmrError, EmrResult};
use crate::validation::capped;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Sqlite, SqliteConnection, SqlitePool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiagnosisKind {
    #[serde(rename = "principal")]
    Principal,
    #[serde(rename = "secundario")]
    Secondary,
    #[serde(rename = "comorbilidad")]
    Comorbidity,
}

impl DiagnosisKind {
    /// Stored representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            DiagnosisKind::Principal => "principal",
            DiagnosisKind::Secondary => "secondary",
            DiagnosisKind::Comorbidity => "comorbidity",
        }
    }

    /// Accepts both the wire (Spanish) and stored spellings.
    pub fn parse(raw: &str) -> EmrResult<Self> {
        match raw.trim().to_lowercase().as_str() {
            "principal" => Ok(DiagnosisKind::Principal),
            "secundario" | "secondary" => Ok(DiagnosisKind::Secondary),
            "comorbilidad" | "comorbidity" => Ok(DiagnosisKind::Comorbidity),
            other => Err(EmrError::InvalidInput(format!(
                "tipo must be principal, secundario or comorbilidad, got '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnosis {
    #[serde(rename = "idDiagnostico")]
    pub id: i64,
    #[serde(rename = "idConsulta")]
    pub consultation_id: i64,
    #[serde(rename = "idCie10")]
    pub cie10_id: i64,
    #[serde(rename = "codigo")]
    pub code: String,
    #[serde(rename = "descripcion")]
    pub description: String,
    #[serde(rename = "tipo")]
    pub kind: DiagnosisKind,
    #[serde(rename = "observaciones")]
    pub notes: Option<String>,
    #[serde(rename = "fechaRegistro")]
    pub created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct DiagnosisRow {
    id: i64,
    consultation_id: i64,
    cie10_id: i64,
    code: String,
    description: String,
    kind: String,
    notes: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<DiagnosisRow> for Diagnosis {
    type Error = EmrError;

    fn try_from(row: DiagnosisRow) -> Result<Self, Self::Error> {
        let kind = DiagnosisKind::parse(&row.kind)
            .map_err(|_| EmrError::CorruptRecord(format!("diagnosis {} kind '{}'", row.id, row.kind)))?;
        Ok(Diagnosis {
            id: row.id,
            consultation_id: row.consultation_id,
            cie10_id: row.cie10_id,
            code: row.code,
            description: row.description,
            kind,
            notes: row.notes,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewDiagnosis {
    #[serde(rename = "idCie10")]
    pub cie10_id: i64,
    #[serde(rename = "tipo", default)]
    pub kind: Option<String>,
    #[serde(rename = "observaciones", default)]
    pub notes: Option<String>,
}

/// Outcome of one item of a bulk import.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImportFailure {
    #[serde(rename = "indice")]
    pub index: usize,
    #[serde(rename = "idCie10")]
    pub cie10_id: i64,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImportReport {
    #[serde(rename = "importados")]
    pub imported: Vec<i64>,
    #[serde(rename = "fallidos")]
    pub failed: Vec<ImportFailure>,
}

/// Attaches a CIE-10 code to a consultation.
///
/// Without an explicit kind the first attachment becomes `principal` and later ones
/// `secondary`. Every check runs before the insert so a failure leaves nothing behind,
/// which lets bulk imports share one transaction.
pub(crate) async fn attach(
    conn: &mut SqliteConnection,
    consultation_id: i64,
    input: &NewDiagnosis,
) -> EmrResult<i64> {
    let explicit_kind = input.kind.as_deref().map(DiagnosisKind::parse).transpose()?;
    if !cie10_exists(&mut *conn, input.cie10_id).await? {
        return Err(EmrError::NotFound("CIE-10 code"));
    }

    let existing: Vec<i64> =
        sqlx::query_scalar("SELECT cie10_id FROM consultation_diagnoses WHERE consultation_id = ?")
            .bind(consultation_id)
            .fetch_all(&mut *conn)
            .await?;
    if existing.contains(&input.cie10_id) {
        return Err(EmrError::DuplicateDiagnosis);
    }
    let kind = explicit_kind.unwrap_or(if existing.is_empty() {
        DiagnosisKind::Principal
    } else {
        DiagnosisKind::Secondary
    });

    let result = sqlx::query(
        "INSERT INTO consultation_diagnoses (consultation_id, cie10_id, kind, notes, created_at)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(consultation_id)
    .bind(input.cie10_id)
    .bind(kind.as_str())
    .bind(capped(input.notes.clone(), DETAIL_MAX_LEN))
    .bind(Utc::now())
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            EmrError::DuplicateDiagnosis
        } else {
            EmrError::Database(e)
        }
    })?;
    Ok(result.last_insert_rowid())
}

pub(crate) async fn list(pool: &SqlitePool, consultation_id: i64) -> EmrResult<Vec<Diagnosis>> {
    let rows: Vec<DiagnosisRow> = sqlx::query_as(
        "SELECT d.id, d.consultation_id, d.cie10_id, c.code, c.description, d.kind, d.notes,
                d.created_at
         FROM consultation_diagnoses d
         JOIN cie10_codes c ON c.id = d.cie10_id
         WHERE d.consultation_id = ?
         ORDER BY d.id",
    )
    .bind(consultation_id)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(Diagnosis::try_from).collect()
}

pub(crate) async fn count<'c, E>(executor: E, consultation_id: i64) -> EmrResult<i64>
where
    E: sqlx::Executor<'c, Database = Sqlite>,
{
    let n = sqlx::query_scalar("SELECT COUNT(*) FROM consultation_diagnoses WHERE consultation_id = ?")
        .bind(consultation_id)
        .fetch_one(executor)
        .await?;
    Ok(n)
}

/// Removes an attachment. It must belong to `consultation_id`.
pub(crate) async fn detach<'c, E>(
    executor: E,
    consultation_id: i64,
    diagnosis_id: i64,
) -> EmrResult<()>
where
    E: sqlx::Executor<'c, Database = Sqlite>,
{
    let result =
        sqlx::query("DELETE FROM consultation_diagnoses WHERE id = ? AND consultation_id = ?")
            .bind(diagnosis_id)
            .bind(consultation_id)
            .execute(executor)
            .await?;
    if result.rows_affected() == 0 {
        return Err(EmrError::NotFoundOrForbidden);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_accepts_both_spellings() {
        assert_eq!(DiagnosisKind::parse("Secundario").unwrap(), DiagnosisKind::Secondary);
        assert_eq!(DiagnosisKind::parse("comorbidity").unwrap(), DiagnosisKind::Comorbidity);
        assert!(matches!(
            DiagnosisKind::parse("otro"),
            Err(EmrError::InvalidInput(_))
        ));
    }

    #[test]
    fn wire_kind_is_spanish() {
        let json = serde_json::to_string(&DiagnosisKind::Secondary).unwrap();
        assert_eq!(json, "\"secundario\"");
    }
}
