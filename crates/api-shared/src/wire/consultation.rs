use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct StartConsultationReq {
    /// Clinical record (patient) id.
    #[serde(rename = "idFichaClinica")]
    pub patient_id: i64,
    #[serde(rename = "idCita", default)]
    pub appointment_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct StartConsultationRes {
    #[serde(rename = "idConsulta")]
    pub consultation_id: i64,
    /// Patient full name.
    #[serde(rename = "paciente")]
    pub patient: String,
    #[serde(rename = "esPrimeraConsulta")]
    pub is_first_visit: bool,
    /// RFC 3339 timestamp.
    #[serde(rename = "fechaInicio")]
    pub started_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct NarrativeReq {
    #[serde(rename = "relato")]
    pub narrative: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct WorkPlanReq {
    #[serde(rename = "planTrabajo")]
    pub work_plan: String,
}

/// `tipo` is `detallado` on a first visit and `simplificado` afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct PhysicalExamReq {
    #[serde(rename = "tipo")]
    pub kind: String,
    #[serde(rename = "datos")]
    #[schema(value_type = Object)]
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct DiagnosisReq {
    #[serde(rename = "idCie10")]
    pub cie10_id: i64,
    /// `principal`, `secundario` or `comorbilidad`.
    #[serde(rename = "tipo", default)]
    pub kind: Option<String>,
    #[serde(rename = "observaciones", default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct BulkDiagnosesReq {
    #[serde(rename = "diagnosticos")]
    pub diagnoses: Vec<DiagnosisReq>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct PrescriptionLineReq {
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

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct PrescriptionReq {
    #[serde(rename = "indicacionesGenerales", default)]
    pub general_instructions: Option<String>,
    #[serde(rename = "medicamentos", default)]
    pub lines: Vec<PrescriptionLineReq>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct CancelConsultationReq {
    #[serde(rename = "motivo", default)]
    pub reason: Option<String>,
}
