//! Intake history ("antecedentes").
//!
//! One row per patient, created during the patient's first consultation by the attending
//! clinician (see `ConsultationService::record_intake_history`). After that it can only be
//! amended through [`IntakeHistoryPatch`].

use crate::audit::{AuditAction, AuditEvent};
use crate::constants::{CLINICAL_TEXT_MAX_LEN, DETAIL_MAX_LEN, SHORT_TEXT_MAX_LEN};
use crate::db::Store;
use crate::error::{is_unique_violation, EmrError, EmrResult, Prerequisite};
use crate::update::{push_value, UpdateSet, Value};
use crate::validation::{capped, present, Flag};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct IntakeHistory {
    #[serde(rename = "idAntecedentes")]
    pub id: i64,
    #[serde(rename = "idFichaClinica")]
    pub patient_id: i64,
    #[serde(rename = "idConsulta")]
    pub consultation_id: i64,
    #[serde(rename = "tiempoEnfermedad")]
    pub illness_duration: Option<String>,
    #[serde(rename = "formaInicio")]
    pub illness_onset: Option<String>,
    #[serde(rename = "curso")]
    pub illness_course: Option<String>,
    #[serde(rename = "relatoEnfermedad")]
    pub illness_narrative: Option<String>,
    #[serde(rename = "dolorToracico")]
    pub chest_pain: bool,
    #[serde(rename = "disnea")]
    pub dyspnea: bool,
    #[serde(rename = "palpitaciones")]
    pub palpitations: bool,
    #[serde(rename = "sincope")]
    pub syncope: bool,
    pub edema: bool,
    #[serde(rename = "fatiga")]
    pub fatigue: bool,
    #[serde(rename = "hipertension")]
    pub hypertension: bool,
    #[serde(rename = "infartoPrevio")]
    pub prior_infarction: bool,
    #[serde(rename = "insuficienciaCardiaca")]
    pub heart_failure: bool,
    #[serde(rename = "arritmia")]
    pub arrhythmia: bool,
    #[serde(rename = "valvulopatia")]
    pub valvular_disease: bool,
    #[serde(rename = "notasCardiovasculares")]
    pub cardiovascular_notes: Option<String>,
    #[serde(rename = "antecedentesRespiratorios")]
    pub respiratory_history: Option<String>,
    #[serde(rename = "antecedentesDigestivos")]
    pub digestive_history: Option<String>,
    #[serde(rename = "antecedentesRenales")]
    pub renal_history: Option<String>,
    #[serde(rename = "antecedentesNeurologicos")]
    pub neurological_history: Option<String>,
    #[serde(rename = "antecedentesEndocrinos")]
    pub endocrine_history: Option<String>,
    #[serde(rename = "otrosAntecedentes")]
    pub other_history: Option<String>,
    #[serde(rename = "tabaquismo")]
    pub smoking: bool,
    #[serde(rename = "tabaquismoDetalle")]
    pub smoking_detail: Option<String>,
    pub alcohol: bool,
    #[serde(rename = "alcoholDetalle")]
    pub alcohol_detail: Option<String>,
    pub diabetes: bool,
    #[serde(rename = "diabetesDetalle")]
    pub diabetes_detail: Option<String>,
    #[serde(rename = "dislipidemia")]
    pub dyslipidemia: bool,
    #[serde(rename = "dislipidemiaDetalle")]
    pub dyslipidemia_detail: Option<String>,
    #[serde(rename = "antecedentesFamiliares")]
    pub family_history: bool,
    #[serde(rename = "antecedentesFamiliaresDetalle")]
    pub family_history_detail: Option<String>,
    #[serde(rename = "obesidad")]
    pub obesity: bool,
    #[serde(rename = "sedentarismo")]
    pub sedentarism: bool,
    #[serde(rename = "registradoPor")]
    pub created_by: i64,
    #[serde(rename = "fechaRegistro")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "fechaActualizacion")]
    pub updated_at: DateTime<Utc>,
}

/// Input for the first recording of a patient's intake history.
///
/// Flags accept the permissive truthy spellings and default to false.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewIntakeHistory {
    #[serde(rename = "tiempoEnfermedad", default)]
    pub illness_duration: Option<String>,
    #[serde(rename = "formaInicio", default)]
    pub illness_onset: Option<String>,
    #[serde(rename = "curso", default)]
    pub illness_course: Option<String>,
    #[serde(rename = "relatoEnfermedad", default)]
    pub illness_narrative: Option<String>,
    #[serde(rename = "dolorToracico", default)]
    pub chest_pain: Flag,
    #[serde(rename = "disnea", default)]
    pub dyspnea: Flag,
    #[serde(rename = "palpitaciones", default)]
    pub palpitations: Flag,
    #[serde(rename = "sincope", default)]
    pub syncope: Flag,
    #[serde(default)]
    pub edema: Flag,
    #[serde(rename = "fatiga", default)]
    pub fatigue: Flag,
    #[serde(rename = "hipertension", default)]
    pub hypertension: Flag,
    #[serde(rename = "infartoPrevio", default)]
    pub prior_infarction: Flag,
    #[serde(rename = "insuficienciaCardiaca", default)]
    pub heart_failure: Flag,
    #[serde(rename = "arritmia", default)]
    pub arrhythmia: Flag,
    #[serde(rename = "valvulopatia", default)]
    pub valvular_disease: Flag,
    #[serde(rename = "notasCardiovasculares", default)]
    pub cardiovascular_notes: Option<String>,
    #[serde(rename = "antecedentesRespiratorios", default)]
    pub respiratory_history: Option<String>,
    #[serde(rename = "antecedentesDigestivos", default)]
    pub digestive_history: Option<String>,
    #[serde(rename = "antecedentesRenales", default)]
    pub renal_history: Option<String>,
    #[serde(rename = "antecedentesNeurologicos", default)]
    pub neurological_history: Option<String>,
    #[serde(rename = "antecedentesEndocrinos", default)]
    pub endocrine_history: Option<String>,
    #[serde(rename = "otrosAntecedentes", default)]
    pub other_history: Option<String>,
    #[serde(rename = "tabaquismo", default)]
    pub smoking: Flag,
    #[serde(rename = "tabaquismoDetalle", default)]
    pub smoking_detail: Option<String>,
    #[serde(default)]
    pub alcohol: Flag,
    #[serde(rename = "alcoholDetalle", default)]
    pub alcohol_detail: Option<String>,
    #[serde(default)]
    pub diabetes: Flag,
    #[serde(rename = "diabetesDetalle", default)]
    pub diabetes_detail: Option<String>,
    #[serde(rename = "dislipidemia", default)]
    pub dyslipidemia: Flag,
    #[serde(rename = "dislipidemiaDetalle", default)]
    pub dyslipidemia_detail: Option<String>,
    #[serde(rename = "antecedentesFamiliares", default)]
    pub family_history: Flag,
    #[serde(rename = "antecedentesFamiliaresDetalle", default)]
    pub family_history_detail: Option<String>,
    #[serde(rename = "obesidad", default)]
    pub obesity: Flag,
    #[serde(rename = "sedentarismo", default)]
    pub sedentarism: Flag,
}

impl NewIntakeHistory {
    /// Column/value pairs for the insert, with text truncated to its cap.
    fn into_columns(self) -> Vec<(&'static str, Value)> {
        let short = |v: Option<String>| Value::Text(capped(v, SHORT_TEXT_MAX_LEN));
        let detail = |v: Option<String>| Value::Text(capped(v, DETAIL_MAX_LEN));
        let flag = |f: Flag| Value::Integer(Some(f.as_int()));
        vec![
            ("illness_duration", short(self.illness_duration)),
            ("illness_onset", short(self.illness_onset)),
            ("illness_course", short(self.illness_course)),
            (
                "illness_narrative",
                Value::Text(capped(self.illness_narrative, CLINICAL_TEXT_MAX_LEN)),
            ),
            ("chest_pain", flag(self.chest_pain)),
            ("dyspnea", flag(self.dyspnea)),
            ("palpitations", flag(self.palpitations)),
            ("syncope", flag(self.syncope)),
            ("edema", flag(self.edema)),
            ("fatigue", flag(self.fatigue)),
            ("hypertension", flag(self.hypertension)),
            ("prior_infarction", flag(self.prior_infarction)),
            ("heart_failure", flag(self.heart_failure)),
            ("arrhythmia", flag(self.arrhythmia)),
            ("valvular_disease", flag(self.valvular_disease)),
            ("cardiovascular_notes", detail(self.cardiovascular_notes)),
            ("respiratory_history", detail(self.respiratory_history)),
            ("digestive_history", detail(self.digestive_history)),
            ("renal_history", detail(self.renal_history)),
            ("neurological_history", detail(self.neurological_history)),
            ("endocrine_history", detail(self.endocrine_history)),
            ("other_history", detail(self.other_history)),
            ("smoking", flag(self.smoking)),
            ("smoking_detail", detail(self.smoking_detail)),
            ("alcohol", flag(self.alcohol)),
            ("alcohol_detail", detail(self.alcohol_detail)),
            ("diabetes", flag(self.diabetes)),
            ("diabetes_detail", detail(self.diabetes_detail)),
            ("dyslipidemia", flag(self.dyslipidemia)),
            ("dyslipidemia_detail", detail(self.dyslipidemia_detail)),
            ("family_history", flag(self.family_history)),
            ("family_history_detail", detail(self.family_history_detail)),
            ("obesity", flag(self.obesity)),
            ("sedentarism", flag(self.sedentarism)),
        ]
    }
}

/// Sparse intake-history edit.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IntakeHistoryPatch {
    #[serde(rename = "tiempoEnfermedad", default, deserialize_with = "present")]
    pub illness_duration: Option<Option<String>>,
    #[serde(rename = "formaInicio", default, deserialize_with = "present")]
    pub illness_onset: Option<Option<String>>,
    #[serde(rename = "curso", default, deserialize_with = "present")]
    pub illness_course: Option<Option<String>>,
    #[serde(rename = "relatoEnfermedad", default, deserialize_with = "present")]
    pub illness_narrative: Option<Option<String>>,
    #[serde(rename = "dolorToracico", default)]
    pub chest_pain: Option<Flag>,
    #[serde(rename = "disnea", default)]
    pub dyspnea: Option<Flag>,
    #[serde(rename = "palpitaciones", default)]
    pub palpitations: Option<Flag>,
    #[serde(rename = "sincope", default)]
    pub syncope: Option<Flag>,
    #[serde(default)]
    pub edema: Option<Flag>,
    #[serde(rename = "fatiga", default)]
    pub fatigue: Option<Flag>,
    #[serde(rename = "hipertension", default)]
    pub hypertension: Option<Flag>,
    #[serde(rename = "infartoPrevio", default)]
    pub prior_infarction: Option<Flag>,
    #[serde(rename = "insuficienciaCardiaca", default)]
    pub heart_failure: Option<Flag>,
    #[serde(rename = "arritmia", default)]
    pub arrhythmia: Option<Flag>,
    #[serde(rename = "valvulopatia", default)]
    pub valvular_disease: Option<Flag>,
    #[serde(rename = "notasCardiovasculares", default, deserialize_with = "present")]
    pub cardiovascular_notes: Option<Option<String>>,
    #[serde(rename = "antecedentesRespiratorios", default, deserialize_with = "present")]
    pub respiratory_history: Option<Option<String>>,
    #[serde(rename = "antecedentesDigestivos", default, deserialize_with = "present")]
    pub digestive_history: Option<Option<String>>,
    #[serde(rename = "antecedentesRenales", default, deserialize_with = "present")]
    pub renal_history: Option<Option<String>>,
    #[serde(rename = "antecedentesNeurologicos", default, deserialize_with = "present")]
    pub neurological_history: Option<Option<String>>,
    #[serde(rename = "antecedentesEndocrinos", default, deserialize_with = "present")]
    pub endocrine_history: Option<Option<String>>,
    #[serde(rename = "otrosAntecedentes", default, deserialize_with = "present")]
    pub other_history: Option<Option<String>>,
    #[serde(rename = "tabaquismo", default)]
    pub smoking: Option<Flag>,
    #[serde(rename = "tabaquismoDetalle", default, deserialize_with = "present")]
    pub smoking_detail: Option<Option<String>>,
    #[serde(default)]
    pub alcohol: Option<Flag>,
    #[serde(rename = "alcoholDetalle", default, deserialize_with = "present")]
    pub alcohol_detail: Option<Option<String>>,
    #[serde(default)]
    pub diabetes: Option<Flag>,
    #[serde(rename = "diabetesDetalle", default, deserialize_with = "present")]
    pub diabetes_detail: Option<Option<String>>,
    #[serde(rename = "dislipidemia", default)]
    pub dyslipidemia: Option<Flag>,
    #[serde(rename = "dislipidemiaDetalle", default, deserialize_with = "present")]
    pub dyslipidemia_detail: Option<Option<String>>,
    #[serde(rename = "antecedentesFamiliares", default)]
    pub family_history: Option<Flag>,
    #[serde(
        rename = "antecedentesFamiliaresDetalle",
        default,
        deserialize_with = "present"
    )]
    pub family_history_detail: Option<Option<String>>,
    #[serde(rename = "obesidad", default)]
    pub obesity: Option<Flag>,
    #[serde(rename = "sedentarismo", default)]
    pub sedentarism: Option<Flag>,
}

impl IntakeHistoryPatch {
    fn into_update_set(self) -> UpdateSet {
        let mut set = UpdateSet::new("intake_histories");
        set.text("illness_duration", "tiempoEnfermedad", self.illness_duration, SHORT_TEXT_MAX_LEN)
            .text("illness_onset", "formaInicio", self.illness_onset, SHORT_TEXT_MAX_LEN)
            .text("illness_course", "curso", self.illness_course, SHORT_TEXT_MAX_LEN)
            .text(
                "illness_narrative",
                "relatoEnfermedad",
                self.illness_narrative,
                CLINICAL_TEXT_MAX_LEN,
            )
            .flag("chest_pain", self.chest_pain)
            .flag("dyspnea", self.dyspnea)
            .flag("palpitations", self.palpitations)
            .flag("syncope", self.syncope)
            .flag("edema", self.edema)
            .flag("fatigue", self.fatigue)
            .flag("hypertension", self.hypertension)
            .flag("prior_infarction", self.prior_infarction)
            .flag("heart_failure", self.heart_failure)
            .flag("arrhythmia", self.arrhythmia)
            .flag("valvular_disease", self.valvular_disease)
            .text(
                "cardiovascular_notes",
                "notasCardiovasculares",
                self.cardiovascular_notes,
                DETAIL_MAX_LEN,
            )
            .text(
                "respiratory_history",
                "antecedentesRespiratorios",
                self.respiratory_history,
                DETAIL_MAX_LEN,
            )
            .text(
                "digestive_history",
                "antecedentesDigestivos",
                self.digestive_history,
                DETAIL_MAX_LEN,
            )
            .text("renal_history", "antecedentesRenales", self.renal_history, DETAIL_MAX_LEN)
            .text(
                "neurological_history",
                "antecedentesNeurologicos",
                self.neurological_history,
                DETAIL_MAX_LEN,
            )
            .text(
                "endocrine_history",
                "antecedentesEndocrinos",
                self.endocrine_history,
                DETAIL_MAX_LEN,
            )
            .text("other_history", "otrosAntecedentes", self.other_history, DETAIL_MAX_LEN)
            .flag("smoking", self.smoking)
            .text("smoking_detail", "tabaquismoDetalle", self.smoking_detail, DETAIL_MAX_LEN)
            .flag("alcohol", self.alcohol)
            .text("alcohol_detail", "alcoholDetalle", self.alcohol_detail, DETAIL_MAX_LEN)
            .flag("diabetes", self.diabetes)
            .text("diabetes_detail", "diabetesDetalle", self.diabetes_detail, DETAIL_MAX_LEN)
            .flag("dyslipidemia", self.dyslipidemia)
            .text(
                "dyslipidemia_detail",
                "dislipidemiaDetalle",
                self.dyslipidemia_detail,
                DETAIL_MAX_LEN,
            )
            .flag("family_history", self.family_history)
            .text(
                "family_history_detail",
                "antecedentesFamiliaresDetalle",
                self.family_history_detail,
                DETAIL_MAX_LEN,
            )
            .flag("obesity", self.obesity)
            .flag("sedentarism", self.sedentarism);
        set
    }
}

/// Inserts the intake history row for a patient.
///
/// Callers gate this on the consultation state; the unique index on `patient_id` settles
/// concurrent attempts.
pub(crate) async fn insert<'c, E>(
    executor: E,
    patient_id: i64,
    consultation_id: i64,
    created_by: i64,
    input: NewIntakeHistory,
) -> EmrResult<i64>
where
    E: sqlx::Executor<'c, Database = Sqlite>,
{
    let now = Utc::now();
    let mut values = input.into_columns();
    values.push(("patient_id", Value::Integer(Some(patient_id))));
    values.push(("consultation_id", Value::Integer(Some(consultation_id))));
    values.push(("created_by", Value::Integer(Some(created_by))));

    let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new("INSERT INTO intake_histories (");
    {
        let mut columns = qb.separated(", ");
        for (column, _) in &values {
            columns.push(*column);
        }
        columns.push("created_at");
        columns.push("updated_at");
    }
    qb.push(") VALUES (");
    for (_, value) in values {
        push_value(&mut qb, value);
        qb.push(", ");
    }
    qb.push_bind(now);
    qb.push(", ");
    qb.push_bind(now);
    qb.push(")");

    let result = qb.build().execute(executor).await.map_err(|e| {
        if is_unique_violation(&e) {
            EmrError::IntakeHistoryExists
        } else {
            EmrError::Database(e)
        }
    })?;
    Ok(result.last_insert_rowid())
}

pub(crate) async fn find(pool: &SqlitePool, patient_id: i64) -> EmrResult<Option<IntakeHistory>> {
    let row = sqlx::query_as("SELECT * FROM intake_histories WHERE patient_id = ?")
        .bind(patient_id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

#[derive(Clone, Debug)]
pub struct HistoryService {
    store: Store,
}

impl HistoryService {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Returns the intake history of a patient.
    ///
    /// # Errors
    ///
    /// - [`EmrError::PatientNotFound`] for an unknown patient.
    /// - [`EmrError::NotFound`] when the patient has no history yet.
    pub async fn get(&self, patient_id: i64) -> EmrResult<IntakeHistory> {
        if !super::patient_exists(self.store.pool(), patient_id).await? {
            return Err(EmrError::PatientNotFound);
        }
        find(self.store.pool(), patient_id)
            .await?
            .ok_or(EmrError::NotFound("intake history"))
    }

    /// Applies a sparse edit to an existing intake history.
    ///
    /// # Errors
    ///
    /// - [`EmrError::Prerequisite`] with [`Prerequisite::MissingIntakeHistory`] when the
    ///   patient has no history on file.
    /// - [`EmrError::NoFieldsToUpdate`] / [`EmrError::Validation`] from the patch.
    pub async fn update(
        &self,
        actor_id: i64,
        patient_id: i64,
        patch: IntakeHistoryPatch,
    ) -> EmrResult<IntakeHistory> {
        if !super::patient_exists(self.store.pool(), patient_id).await? {
            return Err(EmrError::PatientNotFound);
        }
        let pending = patch.into_update_set().build()?;
        let columns = pending.columns().join(",");
        let affected = pending
            .execute(self.store.pool(), "patient_id", patient_id)
            .await?;
        if affected == 0 {
            return Err(EmrError::Prerequisite(Prerequisite::MissingIntakeHistory));
        }

        let history = self.get(patient_id).await?;
        self.store.audit().emit(
            AuditEvent::new(
                actor_id,
                AuditAction::IntakeHistoryUpdated,
                "intake_history",
                history.id,
            )
            .with_detail(Some(columns)),
        );
        Ok(history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{seed_clinic, test_store};
    use chrono::Utc;

    async fn seed_consultation(pool: &SqlitePool, patient_id: i64, physician: i64, vitals: i64) -> i64 {
        sqlx::query(
            "INSERT INTO consultations (patient_id, clinician_id, vitals_id, is_first_visit,
             created_at, updated_at) VALUES (?, ?, ?, 1, ?, ?)",
        )
        .bind(patient_id)
        .bind(physician)
        .bind(vitals)
        .bind(Utc::now())
        .bind(Utc::now())
        .execute(pool)
        .await
        .unwrap()
        .last_insert_rowid()
    }

    #[tokio::test]
    async fn insert_coerces_flags_and_refuses_second_row() {
        let (_dir, store, _audit) = test_store().await;
        let clinic = seed_clinic(store.pool()).await;
        let consultation =
            seed_consultation(store.pool(), clinic.patient_id, clinic.physician_id, clinic.vitals_id)
                .await;

        let input: NewIntakeHistory = serde_json::from_value(serde_json::json!({
            "tiempoEnfermedad": "3 meses",
            "dolorToracico": "sí",
            "disnea": 1,
            "palpitaciones": "no",
            "hipertension": true,
            "tabaquismo": "verdadero",
            "tabaquismoDetalle": "10 cigarrillos/día"
        }))
        .unwrap();
        insert(store.pool(), clinic.patient_id, consultation, clinic.physician_id, input)
            .await
            .unwrap();

        let history = HistoryService::new(store.clone())
            .get(clinic.patient_id)
            .await
            .unwrap();
        assert!(history.chest_pain);
        assert!(history.dyspnea);
        assert!(!history.palpitations);
        assert!(history.hypertension);
        assert!(history.smoking);
        assert_eq!(history.illness_duration.as_deref(), Some("3 meses"));

        let err = insert(
            store.pool(),
            clinic.patient_id,
            consultation,
            clinic.physician_id,
            NewIntakeHistory::default(),
        )
        .await
        .expect_err("second history should fail");
        assert!(matches!(err, EmrError::IntakeHistoryExists));
    }

    #[tokio::test]
    async fn update_requires_existing_history() {
        let (_dir, store, _audit) = test_store().await;
        let clinic = seed_clinic(store.pool()).await;
        let service = HistoryService::new(store.clone());

        let patch = IntakeHistoryPatch {
            obesity: Some(Flag(true)),
            ..Default::default()
        };
        let err = service
            .update(clinic.physician_id, clinic.patient_id, patch.clone())
            .await
            .expect_err("no history on file");
        assert!(matches!(
            err,
            EmrError::Prerequisite(Prerequisite::MissingIntakeHistory)
        ));

        let consultation =
            seed_consultation(store.pool(), clinic.patient_id, clinic.physician_id, clinic.vitals_id)
                .await;
        insert(
            store.pool(),
            clinic.patient_id,
            consultation,
            clinic.physician_id,
            NewIntakeHistory::default(),
        )
        .await
        .unwrap();

        let updated = service
            .update(clinic.physician_id, clinic.patient_id, patch)
            .await
            .unwrap();
        assert!(updated.obesity);
        assert!(!updated.sedentarism);

        let err = service
            .update(clinic.physician_id, clinic.patient_id, IntakeHistoryPatch::default())
            .await
            .expect_err("empty patch");
        assert!(matches!(err, EmrError::NoFieldsToUpdate));
    }
}
