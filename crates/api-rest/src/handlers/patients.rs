//! Patient registration, lookup and vitals intake.

use api_shared::{ApiOk, ErrorRes};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use emr_core::repositories::patients::{NewPatient, Patient, PatientPatch, PatientService};
use emr_core::repositories::vitals::{NewVitals, Vitals, VitalsService};
use emr_core::NationalId;
use serde_json::json;

use super::SearchParams;
use crate::auth::{CurrentUser, ANY_STAFF, INTAKE};
use crate::error::{ApiJson, ApiPath, ApiQuery, ApiResult};
use crate::AppState;

#[utoipa::path(
    post,
    path = "/api/pacientes",
    security(("bearer" = [])),
    responses(
        (status = 201, description = "Patient registered"),
        (status = 400, description = "Field errors listed in `errores`", body = ErrorRes),
        (status = 409, description = "National ID already registered", body = ErrorRes)
    )
)]
#[axum::debug_handler]
pub(crate) async fn create_patient(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiJson(input): ApiJson<NewPatient>,
) -> ApiResult<(StatusCode, Json<ApiOk<Patient>>)> {
    user.require(INTAKE)?;
    let patient = PatientService::new(state.store.clone())
        .create(user.id, input)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(ApiOk::new("Paciente registrado", patient)),
    ))
}

#[utoipa::path(
    get,
    path = "/api/pacientes",
    params(SearchParams),
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Patients matching a name or national-ID prefix")
    )
)]
#[axum::debug_handler]
pub(crate) async fn search_patients(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiQuery(params): ApiQuery<SearchParams>,
) -> ApiResult<Json<ApiOk<Vec<Patient>>>> {
    user.require(ANY_STAFF)?;
    let patients = PatientService::new(state.store.clone())
        .search(params.q.as_deref())
        .await?;
    let metadata = json!({ "total": patients.len() });
    Ok(Json(
        ApiOk::new("Pacientes encontrados", patients).with_metadata(metadata),
    ))
}

#[utoipa::path(
    get,
    path = "/api/pacientes/{idFichaClinica}",
    params(("idFichaClinica" = i64, Path, description = "Patient id")),
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Patient record"),
        (status = 404, description = "Patient not found", body = ErrorRes)
    )
)]
#[axum::debug_handler]
pub(crate) async fn get_patient(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiPath(id): ApiPath<i64>,
) -> ApiResult<Json<ApiOk<Patient>>> {
    user.require(ANY_STAFF)?;
    let patient = PatientService::new(state.store.clone()).get(id).await?;
    Ok(Json(ApiOk::new("Paciente", patient)))
}

#[utoipa::path(
    put,
    path = "/api/pacientes/{idFichaClinica}",
    params(("idFichaClinica" = i64, Path, description = "Patient id")),
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Patient updated"),
        (status = 400, description = "No fields to update or invalid values", body = ErrorRes),
        (status = 404, description = "Patient not found", body = ErrorRes)
    )
)]
/// Partial update: absent fields are untouched, `null` clears optional ones.
#[axum::debug_handler]
pub(crate) async fn update_patient(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiPath(id): ApiPath<i64>,
    ApiJson(patch): ApiJson<PatientPatch>,
) -> ApiResult<Json<ApiOk<Patient>>> {
    user.require(INTAKE)?;
    let patient = PatientService::new(state.store.clone())
        .update(user.id, id, patch)
        .await?;
    Ok(Json(ApiOk::new("Paciente actualizado", patient)))
}

#[utoipa::path(
    get,
    path = "/api/pacientes/dni/{dni}",
    params(("dni" = String, Path, description = "Eight-digit national ID")),
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Patient record"),
        (status = 400, description = "Malformed national ID", body = ErrorRes),
        (status = 404, description = "Patient not found", body = ErrorRes)
    )
)]
#[axum::debug_handler]
pub(crate) async fn get_patient_by_national_id(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiPath(raw): ApiPath<String>,
) -> ApiResult<Json<ApiOk<Patient>>> {
    user.require(ANY_STAFF)?;
    let national_id = NationalId::parse(&raw).map_err(emr_core::EmrError::from)?;
    let patient = PatientService::new(state.store.clone())
        .get_by_national_id(&national_id)
        .await?;
    Ok(Json(ApiOk::new("Paciente", patient)))
}

#[utoipa::path(
    get,
    path = "/api/pacientes/{idFichaClinica}/signos-vitales",
    params(("idFichaClinica" = i64, Path, description = "Patient id")),
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Vitals for the patient, newest first")
    )
)]
#[axum::debug_handler]
pub(crate) async fn list_vitals(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiPath(patient_id): ApiPath<i64>,
) -> ApiResult<Json<ApiOk<Vec<Vitals>>>> {
    user.require(ANY_STAFF)?;
    let vitals = VitalsService::new(state.store.clone())
        .list(patient_id)
        .await?;
    Ok(Json(ApiOk::new("Signos vitales", vitals)))
}

#[utoipa::path(
    post,
    path = "/api/pacientes/{idFichaClinica}/signos-vitales",
    params(("idFichaClinica" = i64, Path, description = "Patient id")),
    security(("bearer" = [])),
    responses(
        (status = 201, description = "Vitals recorded; BMI derived from weight and height"),
        (status = 400, description = "Out-of-range measurements listed in `errores`", body = ErrorRes),
        (status = 404, description = "Patient not found", body = ErrorRes)
    )
)]
#[axum::debug_handler]
pub(crate) async fn record_vitals(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiPath(patient_id): ApiPath<i64>,
    ApiJson(input): ApiJson<NewVitals>,
) -> ApiResult<(StatusCode, Json<ApiOk<Vitals>>)> {
    user.require(INTAKE)?;
    let vitals = VitalsService::new(state.store.clone())
        .record(user.id, patient_id, input)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(ApiOk::new("Signos vitales registrados", vitals)),
    ))
}
