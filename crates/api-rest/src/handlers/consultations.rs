//! Consultation workflow endpoints.
//!
//! Every route below `/api/consulta/{idConsulta}` acts on behalf of the calling physician;
//! a consultation owned by someone else is reported as not found.

use api_shared::wire::{
    BulkDiagnosesReq, CancelConsultationReq, DiagnosisReq, NarrativeReq, PhysicalExamReq,
    PrescriptionReq, StartConsultationReq, StartConsultationRes, WorkPlanReq,
};
use api_shared::{ApiOk, ErrorRes};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use emr_core::prerequisites::{self, Requirements};
use emr_core::repositories::consultations::{Consultation, ConsultationDetail, StatusSummary};
use emr_core::repositories::diagnoses::{Diagnosis, ImportReport, NewDiagnosis};
use emr_core::repositories::history::{IntakeHistory, NewIntakeHistory};
use emr_core::repositories::patients::PatientService;
use emr_core::repositories::prescriptions::{NewPrescription, NewPrescriptionItem, Prescription};
use emr_core::{ConsultationService, ExamKind, Initialised};
use serde_json::json;
use std::str::FromStr;

use crate::auth::{CurrentUser, ANY_STAFF, PHYSICIANS};
use crate::error::{ApiJson, ApiPath, ApiResult};
use crate::AppState;

fn bound(state: &AppState, user: &CurrentUser, id: i64) -> ConsultationService<Initialised> {
    ConsultationService::with_id(state.store.clone(), user.id, id)
}

fn new_diagnosis(req: DiagnosisReq) -> NewDiagnosis {
    NewDiagnosis {
        cie10_id: req.cie10_id,
        kind: req.kind,
        notes: req.notes,
    }
}

fn new_prescription(req: PrescriptionReq) -> NewPrescription {
    NewPrescription {
        general_instructions: req.general_instructions,
        items: req
            .lines
            .into_iter()
            .map(|line| NewPrescriptionItem {
                medication_id: line.medication_id,
                dose: line.dose,
                frequency: line.frequency,
                duration: line.duration,
                notes: line.notes,
            })
            .collect(),
    }
}

#[utoipa::path(
    post,
    path = "/api/consulta/iniciar",
    request_body = StartConsultationReq,
    security(("bearer" = [])),
    responses(
        (status = 201, description = "Consultation opened; wrapped in the success envelope", body = StartConsultationRes),
        (status = 400, description = "No vitals today or invalid appointment", body = ErrorRes),
        (status = 404, description = "Patient not found", body = ErrorRes)
    )
)]
/// Opens a consultation for a patient with vitals recorded today.
///
/// The first-visit flag is decided here and never changes afterwards.
#[axum::debug_handler]
pub(crate) async fn start_consultation(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiJson(req): ApiJson<StartConsultationReq>,
) -> ApiResult<(StatusCode, Json<ApiOk<StartConsultationRes>>)> {
    user.require(PHYSICIANS)?;
    let service = ConsultationService::new(state.store.clone(), user.id)
        .start(req.patient_id, req.appointment_id)
        .await?;
    let consultation = service.get().await?;
    let patient = PatientService::new(state.store.clone())
        .get(consultation.patient_id)
        .await?;

    let res = StartConsultationRes {
        consultation_id: consultation.id,
        patient: patient.full_name(),
        is_first_visit: consultation.is_first_visit,
        started_at: consultation.created_at.to_rfc3339(),
    };
    Ok((StatusCode::CREATED, Json(ApiOk::new("Consulta iniciada", res))))
}

#[utoipa::path(
    get,
    path = "/api/consulta/requisitos/{idFichaClinica}",
    params(("idFichaClinica" = i64, Path, description = "Patient id")),
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Readiness report for opening a consultation")
    )
)]
#[axum::debug_handler]
pub(crate) async fn consultation_requirements(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiPath(patient_id): ApiPath<i64>,
) -> ApiResult<Json<ApiOk<Requirements>>> {
    user.require(ANY_STAFF)?;
    let report = prerequisites::requirements(&state.store, patient_id).await?;
    Ok(Json(ApiOk::new("Requisitos de consulta", report)))
}

#[utoipa::path(
    get,
    path = "/api/consulta/{idConsulta}",
    params(("idConsulta" = i64, Path, description = "Consultation id")),
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Consultation with patient, diagnoses and prescription"),
        (status = 404, description = "Unknown consultation or owned by another clinician", body = ErrorRes)
    )
)]
#[axum::debug_handler]
pub(crate) async fn consultation_detail(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiPath(id): ApiPath<i64>,
) -> ApiResult<Json<ApiOk<ConsultationDetail>>> {
    user.require(PHYSICIANS)?;
    let detail = bound(&state, &user, id).detail().await?;
    Ok(Json(ApiOk::new("Detalle de consulta", detail)))
}

#[utoipa::path(
    put,
    path = "/api/consulta/{idConsulta}/relato",
    params(("idConsulta" = i64, Path, description = "Consultation id")),
    request_body = NarrativeReq,
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Narrative recorded"),
        (status = 409, description = "Consultation already closed", body = ErrorRes)
    )
)]
#[axum::debug_handler]
pub(crate) async fn record_narrative(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiPath(id): ApiPath<i64>,
    ApiJson(req): ApiJson<NarrativeReq>,
) -> ApiResult<Json<ApiOk<Consultation>>> {
    user.require(PHYSICIANS)?;
    let consultation = bound(&state, &user, id)
        .record_narrative(&req.narrative)
        .await?;
    Ok(Json(ApiOk::new("Relato registrado", consultation)))
}

#[utoipa::path(
    put,
    path = "/api/consulta/{idConsulta}/examen-fisico",
    params(("idConsulta" = i64, Path, description = "Consultation id")),
    request_body = PhysicalExamReq,
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Physical exam recorded"),
        (status = 400, description = "Wrong exam kind for the visit type or malformed data", body = ErrorRes)
    )
)]
#[axum::debug_handler]
pub(crate) async fn record_physical_exam(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiPath(id): ApiPath<i64>,
    ApiJson(req): ApiJson<PhysicalExamReq>,
) -> ApiResult<Json<ApiOk<Consultation>>> {
    user.require(PHYSICIANS)?;
    let kind = ExamKind::from_str(&req.kind)?;
    let consultation = bound(&state, &user, id)
        .record_physical_exam(kind, req.data)
        .await?;
    Ok(Json(ApiOk::new("Examen físico registrado", consultation)))
}

#[utoipa::path(
    put,
    path = "/api/consulta/{idConsulta}/plan-trabajo",
    params(("idConsulta" = i64, Path, description = "Consultation id")),
    request_body = WorkPlanReq,
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Work plan recorded"),
        (status = 409, description = "Consultation already closed", body = ErrorRes)
    )
)]
#[axum::debug_handler]
pub(crate) async fn record_work_plan(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiPath(id): ApiPath<i64>,
    ApiJson(req): ApiJson<WorkPlanReq>,
) -> ApiResult<Json<ApiOk<Consultation>>> {
    user.require(PHYSICIANS)?;
    let consultation = bound(&state, &user, id)
        .record_work_plan(&req.work_plan)
        .await?;
    Ok(Json(ApiOk::new("Plan de trabajo registrado", consultation)))
}

#[utoipa::path(
    post,
    path = "/api/consulta/{idConsulta}/antecedentes",
    params(("idConsulta" = i64, Path, description = "Consultation id")),
    security(("bearer" = [])),
    responses(
        (status = 201, description = "Intake history created"),
        (status = 400, description = "Consultation is a follow-up", body = ErrorRes),
        (status = 409, description = "Patient already has an intake history", body = ErrorRes)
    )
)]
/// Records the patient's intake history during their first consultation.
#[axum::debug_handler]
pub(crate) async fn record_intake_history(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiPath(id): ApiPath<i64>,
    ApiJson(input): ApiJson<NewIntakeHistory>,
) -> ApiResult<(StatusCode, Json<ApiOk<IntakeHistory>>)> {
    user.require(PHYSICIANS)?;
    let history = bound(&state, &user, id).record_intake_history(input).await?;
    Ok((
        StatusCode::CREATED,
        Json(ApiOk::new("Antecedentes registrados", history)),
    ))
}

#[utoipa::path(
    get,
    path = "/api/consulta/{idConsulta}/diagnosticos",
    params(("idConsulta" = i64, Path, description = "Consultation id")),
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Diagnoses attached to the consultation")
    )
)]
#[axum::debug_handler]
pub(crate) async fn list_diagnoses(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiPath(id): ApiPath<i64>,
) -> ApiResult<Json<ApiOk<Vec<Diagnosis>>>> {
    user.require(PHYSICIANS)?;
    let diagnoses = bound(&state, &user, id).list_diagnoses().await?;
    Ok(Json(ApiOk::new("Diagnósticos de la consulta", diagnoses)))
}

#[utoipa::path(
    post,
    path = "/api/consulta/{idConsulta}/diagnosticos",
    params(("idConsulta" = i64, Path, description = "Consultation id")),
    request_body = DiagnosisReq,
    security(("bearer" = [])),
    responses(
        (status = 201, description = "Diagnosis attached"),
        (status = 404, description = "Unknown CIE-10 code", body = ErrorRes),
        (status = 409, description = "Code already attached", body = ErrorRes)
    )
)]
#[axum::debug_handler]
pub(crate) async fn add_diagnosis(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiPath(id): ApiPath<i64>,
    ApiJson(req): ApiJson<DiagnosisReq>,
) -> ApiResult<(StatusCode, Json<ApiOk<Diagnosis>>)> {
    user.require(PHYSICIANS)?;
    let diagnosis = bound(&state, &user, id).add_diagnosis(new_diagnosis(req)).await?;
    Ok((
        StatusCode::CREATED,
        Json(ApiOk::new("Diagnóstico agregado", diagnosis)),
    ))
}

#[utoipa::path(
    post,
    path = "/api/consulta/{idConsulta}/diagnosticos/lote",
    params(("idConsulta" = i64, Path, description = "Consultation id")),
    request_body = BulkDiagnosesReq,
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Per-item import report")
    )
)]
/// Attaches several diagnoses; failing items are reported without aborting the rest.
#[axum::debug_handler]
pub(crate) async fn import_diagnoses(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiPath(id): ApiPath<i64>,
    ApiJson(req): ApiJson<BulkDiagnosesReq>,
) -> ApiResult<Json<ApiOk<ImportReport>>> {
    user.require(PHYSICIANS)?;
    let items = req.diagnoses.into_iter().map(new_diagnosis).collect();
    let report = bound(&state, &user, id).import_diagnoses(items).await?;
    let metadata = json!({
        "importados": report.imported.len(),
        "fallidos": report.failed.len(),
    });
    Ok(Json(
        ApiOk::new("Importación de diagnósticos", report).with_metadata(metadata),
    ))
}

#[utoipa::path(
    delete,
    path = "/api/consulta/{idConsulta}/diagnosticos/{idDiagnostico}",
    params(
        ("idConsulta" = i64, Path, description = "Consultation id"),
        ("idDiagnostico" = i64, Path, description = "Attached diagnosis id")
    ),
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Diagnosis removed"),
        (status = 404, description = "Diagnosis not attached to this consultation", body = ErrorRes)
    )
)]
#[axum::debug_handler]
pub(crate) async fn remove_diagnosis(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiPath((id, diagnosis_id)): ApiPath<(i64, i64)>,
) -> ApiResult<Json<ApiOk<()>>> {
    user.require(PHYSICIANS)?;
    bound(&state, &user, id).remove_diagnosis(diagnosis_id).await?;
    Ok(Json(ApiOk::message("Diagnóstico eliminado")))
}

#[utoipa::path(
    get,
    path = "/api/consulta/{idConsulta}/recetas",
    params(("idConsulta" = i64, Path, description = "Consultation id")),
    security(("bearer" = [])),
    responses(
        (status = 200, description = "The consultation's prescription, if any")
    )
)]
#[axum::debug_handler]
pub(crate) async fn get_prescription(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiPath(id): ApiPath<i64>,
) -> ApiResult<Json<ApiOk<Option<Prescription>>>> {
    user.require(PHYSICIANS)?;
    let prescription = bound(&state, &user, id).prescription().await?;
    Ok(Json(ApiOk::new("Receta de la consulta", prescription)))
}

#[utoipa::path(
    post,
    path = "/api/consulta/{idConsulta}/recetas",
    params(("idConsulta" = i64, Path, description = "Consultation id")),
    request_body = PrescriptionReq,
    security(("bearer" = [])),
    responses(
        (status = 201, description = "Prescription created"),
        (status = 409, description = "The consultation already has a prescription", body = ErrorRes)
    )
)]
#[axum::debug_handler]
pub(crate) async fn create_prescription(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiPath(id): ApiPath<i64>,
    ApiJson(req): ApiJson<PrescriptionReq>,
) -> ApiResult<(StatusCode, Json<ApiOk<Prescription>>)> {
    user.require(PHYSICIANS)?;
    let prescription = bound(&state, &user, id)
        .create_prescription(new_prescription(req))
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(ApiOk::new("Receta registrada", prescription)),
    ))
}

#[utoipa::path(
    put,
    path = "/api/consulta/{idConsulta}/finalizar",
    params(("idConsulta" = i64, Path, description = "Consultation id")),
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Consultation completed"),
        (status = 400, description = "Missing requirements listed in `errores`", body = ErrorRes),
        (status = 409, description = "Consultation already closed", body = ErrorRes)
    )
)]
/// Completes a consultation once narrative, exam, plan and a diagnosis are present.
#[axum::debug_handler]
pub(crate) async fn finalize_consultation(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiPath(id): ApiPath<i64>,
) -> ApiResult<Json<ApiOk<Consultation>>> {
    user.require(PHYSICIANS)?;
    let consultation = bound(&state, &user, id).finalize().await?;
    Ok(Json(ApiOk::new("Consulta finalizada", consultation)))
}

#[utoipa::path(
    put,
    path = "/api/consulta/{idConsulta}/cancelar",
    params(("idConsulta" = i64, Path, description = "Consultation id")),
    request_body = CancelConsultationReq,
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Consultation cancelled"),
        (status = 409, description = "Consultation already closed", body = ErrorRes)
    )
)]
#[axum::debug_handler]
pub(crate) async fn cancel_consultation(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiPath(id): ApiPath<i64>,
    body: Option<ApiJson<CancelConsultationReq>>,
) -> ApiResult<Json<ApiOk<Consultation>>> {
    user.require(PHYSICIANS)?;
    let reason = body.and_then(|ApiJson(req)| req.reason);
    let consultation = bound(&state, &user, id).cancel(reason).await?;
    Ok(Json(ApiOk::new("Consulta cancelada", consultation)))
}

#[utoipa::path(
    get,
    path = "/api/consulta/{idConsulta}/estado",
    params(("idConsulta" = i64, Path, description = "Consultation id")),
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Status summary with step-by-step progress")
    )
)]
#[axum::debug_handler]
pub(crate) async fn consultation_status(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiPath(id): ApiPath<i64>,
) -> ApiResult<Json<ApiOk<StatusSummary>>> {
    user.require(PHYSICIANS)?;
    let summary = bound(&state, &user, id).status().await?;
    Ok(Json(ApiOk::new("Estado de la consulta", summary)))
}
