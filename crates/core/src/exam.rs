//! Physical examination payloads.
//!
//! A consultation carries exactly one exam representation. First visits record a
//! [`DetailedExam`] made of typed sections; follow-up visits record a [`SimplifiedExam`].
//! On the wire the two are adjacently tagged as `{"tipo": "detallado" | "simplificado",
//! "datos": {...}}`. In storage the detailed exam is strict JSON in `detailed_exam`, the
//! simplified one plain text in `simplified_exam`; writing one always clears the other.

use crate::validation::check_len;
use crate::constants::CLINICAL_TEXT_MAX_LEN;
use crate::{EmrError, EmrResult};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExamKind {
    #[serde(rename = "detallado")]
    Detailed,
    #[serde(rename = "simplificado")]
    Simplified,
}

impl ExamKind {
    /// The kind a consultation must record, given its frozen first-visit flag.
    pub fn expected_for(is_first_visit: bool) -> Self {
        if is_first_visit {
            ExamKind::Detailed
        } else {
            ExamKind::Simplified
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExamKind::Detailed => "detallado",
            ExamKind::Simplified => "simplificado",
        }
    }
}

impl std::fmt::Display for ExamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExamKind {
    type Err = EmrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "detallado" => Ok(ExamKind::Detailed),
            "simplificado" => Ok(ExamKind::Simplified),
            other => Err(EmrError::InvalidInput(format!(
                "tipo must be 'detallado' or 'simplificado', got '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tipo", content = "datos")]
pub enum PhysicalExam {
    #[serde(rename = "detallado")]
    Detailed(DetailedExam),
    #[serde(rename = "simplificado")]
    Simplified(SimplifiedExam),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DetailedExam {
    #[serde(rename = "estadoGeneral", default, skip_serializing_if = "Option::is_none")]
    pub general: Option<GeneralAppearance>,
    #[serde(rename = "cabezaCuello", default, skip_serializing_if = "Option::is_none")]
    pub head_and_neck: Option<HeadAndNeck>,
    #[serde(rename = "toraxPulmones", default, skip_serializing_if = "Option::is_none")]
    pub chest_and_lungs: Option<ChestAndLungs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cardiovascular: Option<Cardiovascular>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abdomen: Option<Abdomen>,
    #[serde(rename = "extremidades", default, skip_serializing_if = "Option::is_none")]
    pub extremities: Option<Extremities>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GeneralAppearance {
    #[serde(rename = "conciencia", default, skip_serializing_if = "Option::is_none")]
    pub consciousness: Option<String>,
    #[serde(rename = "hidratacion", default, skip_serializing_if = "Option::is_none")]
    pub hydration: Option<String>,
    #[serde(rename = "nutricion", default, skip_serializing_if = "Option::is_none")]
    pub nutrition: Option<String>,
    #[serde(rename = "observaciones", default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeadAndNeck {
    #[serde(rename = "hallazgos", default, skip_serializing_if = "Option::is_none")]
    pub findings: Option<String>,
    #[serde(rename = "ingurgitacionYugular", default)]
    pub jugular_distension: bool,
    #[serde(rename = "tiroides", default, skip_serializing_if = "Option::is_none")]
    pub thyroid: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChestAndLungs {
    #[serde(rename = "murmulloVesicular", default, skip_serializing_if = "Option::is_none")]
    pub breath_sounds: Option<String>,
    #[serde(rename = "ruidosAgregados", default, skip_serializing_if = "Option::is_none")]
    pub added_sounds: Option<String>,
    #[serde(rename = "hallazgos", default, skip_serializing_if = "Option::is_none")]
    pub findings: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Cardiovascular {
    #[serde(rename = "ritmo", default, skip_serializing_if = "Option::is_none")]
    pub rhythm: Option<String>,
    #[serde(rename = "ruidosCardiacos", default, skip_serializing_if = "Option::is_none")]
    pub heart_sounds: Option<String>,
    #[serde(rename = "soplos", default, skip_serializing_if = "Option::is_none")]
    pub murmurs: Option<String>,
    #[serde(rename = "pulsosPerifericos", default, skip_serializing_if = "Option::is_none")]
    pub peripheral_pulses: Option<String>,
    #[serde(rename = "hallazgos", default, skip_serializing_if = "Option::is_none")]
    pub findings: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Abdomen {
    #[serde(rename = "hallazgos", default, skip_serializing_if = "Option::is_none")]
    pub findings: Option<String>,
    #[serde(rename = "doloroso", default)]
    pub tender: bool,
    #[serde(rename = "visceromegalia", default)]
    pub organomegaly: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Extremities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edema: Option<String>,
    #[serde(rename = "llenadoCapilar", default, skip_serializing_if = "Option::is_none")]
    pub capillary_refill: Option<String>,
    #[serde(rename = "hallazgos", default, skip_serializing_if = "Option::is_none")]
    pub findings: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimplifiedExam {
    #[serde(rename = "hallazgos")]
    pub findings: String,
}

impl DetailedExam {
    fn is_empty(&self) -> bool {
        self.general.is_none()
            && self.head_and_neck.is_none()
            && self.chest_and_lungs.is_none()
            && self.cardiovascular.is_none()
            && self.abdomen.is_none()
            && self.extremities.is_none()
    }
}

impl PhysicalExam {
    pub fn kind(&self) -> ExamKind {
        match self {
            PhysicalExam::Detailed(_) => ExamKind::Detailed,
            PhysicalExam::Simplified(_) => ExamKind::Simplified,
        }
    }

    /// Builds an exam from the wire `tipo` and the untyped `datos` payload.
    ///
    /// Schema mismatches are reported with the path of the failing field.
    pub fn from_parts(kind: ExamKind, datos: serde_json::Value) -> EmrResult<Self> {
        let exam = match kind {
            ExamKind::Detailed => PhysicalExam::Detailed(decode_value(datos)?),
            ExamKind::Simplified => PhysicalExam::Simplified(decode_value(datos)?),
        };
        exam.validate()?;
        Ok(exam)
    }

    fn validate(&self) -> EmrResult<()> {
        let mut errors = Vec::new();
        match self {
            PhysicalExam::Detailed(detailed) => {
                if detailed.is_empty() {
                    errors.push("detailed exam must include at least one section".to_string());
                }
                if let Ok(json) = serde_json::to_string(detailed) {
                    check_len(&mut errors, "datos", &json, CLINICAL_TEXT_MAX_LEN * 4);
                }
            }
            PhysicalExam::Simplified(simplified) => {
                if simplified.findings.trim().is_empty() {
                    errors.push("datos.hallazgos cannot be empty".to_string());
                }
                check_len(
                    &mut errors,
                    "datos.hallazgos",
                    &simplified.findings,
                    CLINICAL_TEXT_MAX_LEN,
                );
            }
        }
        crate::validation::finish(errors)
    }

    /// Splits the exam into the `(detailed_exam, simplified_exam)` column pair.
    ///
    /// Exactly one side is `Some`.
    pub fn to_columns(&self) -> EmrResult<(Option<String>, Option<String>)> {
        match self {
            PhysicalExam::Detailed(detailed) => {
                let json = serde_json::to_string(detailed)
                    .map_err(|e| EmrError::InvalidInput(format!("unserialisable exam: {e}")))?;
                Ok((Some(json), None))
            }
            PhysicalExam::Simplified(simplified) => {
                Ok((None, Some(simplified.findings.trim().to_string())))
            }
        }
    }

    /// Rebuilds the exam from its stored column pair.
    pub fn from_columns(
        detailed: Option<&str>,
        simplified: Option<&str>,
    ) -> EmrResult<Option<Self>> {
        if let Some(json) = detailed {
            let mut de = serde_json::Deserializer::from_str(json);
            let parsed: DetailedExam = serde_path_to_error::deserialize(&mut de).map_err(|err| {
                let path = err.path().to_string();
                EmrError::CorruptRecord(format!("detailed_exam at {path}: {}", err.into_inner()))
            })?;
            return Ok(Some(PhysicalExam::Detailed(parsed)));
        }
        Ok(simplified.map(|findings| {
            PhysicalExam::Simplified(SimplifiedExam {
                findings: findings.to_string(),
            })
        }))
    }
}

fn decode_value<T: serde::de::DeserializeOwned>(datos: serde_json::Value) -> EmrResult<T> {
    serde_path_to_error::deserialize(datos).map_err(|err| {
        let path = err.path().to_string();
        let path = if path.is_empty() || path == "." {
            "datos".to_string()
        } else {
            format!("datos.{path}")
        };
        EmrError::Validation(vec![format!("{path}: {}", err.into_inner())])
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn detailed_exam_round_trips_through_columns() {
        let exam = PhysicalExam::from_parts(
            ExamKind::Detailed,
            json!({
                "cardiovascular": {"ritmo": "regular", "soplos": "no"},
                "abdomen": {"hallazgos": "blando", "doloroso": false}
            }),
        )
        .unwrap();

        let (detailed, simplified) = exam.to_columns().unwrap();
        assert!(detailed.is_some());
        assert!(simplified.is_none());

        let restored = PhysicalExam::from_columns(detailed.as_deref(), None)
            .unwrap()
            .unwrap();
        assert_eq!(restored, exam);
    }

    #[test]
    fn unknown_section_field_reports_path() {
        let err = PhysicalExam::from_parts(
            ExamKind::Detailed,
            json!({"cardiovascular": {"ritmo": "regular", "color": "azul"}}),
        )
        .expect_err("unknown field should be rejected");
        match err {
            EmrError::Validation(errors) => {
                assert!(errors[0].starts_with("datos.cardiovascular"), "{errors:?}");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn empty_detailed_exam_is_rejected() {
        let err = PhysicalExam::from_parts(ExamKind::Detailed, json!({}))
            .expect_err("empty exam should be rejected");
        assert!(matches!(err, EmrError::Validation(_)));
    }

    #[test]
    fn simplified_exam_requires_findings() {
        let err = PhysicalExam::from_parts(ExamKind::Simplified, json!({"hallazgos": "  "}))
            .expect_err("blank findings should be rejected");
        assert!(matches!(err, EmrError::Validation(_)));

        let ok = PhysicalExam::from_parts(ExamKind::Simplified, json!({"hallazgos": "sin cambios"}))
            .unwrap();
        assert_eq!(ok.to_columns().unwrap(), (None, Some("sin cambios".into())));
    }

    #[test]
    fn wire_form_is_adjacently_tagged() {
        let exam: PhysicalExam =
            serde_json::from_value(json!({"tipo": "simplificado", "datos": {"hallazgos": "ok"}}))
                .unwrap();
        assert_eq!(exam.kind(), ExamKind::Simplified);
        assert_eq!(ExamKind::expected_for(true), ExamKind::Detailed);
    }

    #[test]
    fn corrupt_stored_exam_is_reported() {
        let err = PhysicalExam::from_columns(Some("{\"abdomen\": 3}"), None)
            .expect_err("malformed JSON should be reported");
        assert!(matches!(err, EmrError::CorruptRecord(_)));
    }
}
