//! Appointment scheduling endpoints.

use api_shared::{ApiOk, ErrorRes};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use emr_core::repositories::appointments::{
    Appointment, AppointmentPatch, AppointmentService, NewAppointment,
};
use emr_core::validation::parse_date;
use serde::Deserialize;
use utoipa::IntoParams;

use crate::auth::{CurrentUser, ANY_STAFF, SCHEDULING};
use crate::error::{ApiJson, ApiPath, ApiQuery, ApiResult};
use crate::AppState;

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub(crate) struct AppointmentFilter {
    /// Day in `YYYY-MM-DD`.
    #[serde(rename = "fecha")]
    pub date: Option<String>,
    #[serde(rename = "idMedico")]
    pub clinician_id: Option<i64>,
}

#[utoipa::path(
    post,
    path = "/api/citas",
    security(("bearer" = [])),
    responses(
        (status = 201, description = "Appointment scheduled"),
        (status = 400, description = "Invalid date, time or clinician", body = ErrorRes),
        (status = 409, description = "The clinician's slot is taken", body = ErrorRes)
    )
)]
#[axum::debug_handler]
pub(crate) async fn create_appointment(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiJson(input): ApiJson<NewAppointment>,
) -> ApiResult<(StatusCode, Json<ApiOk<Appointment>>)> {
    user.require(SCHEDULING)?;
    let appointment = AppointmentService::new(state.store.clone())
        .create(user.id, input)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(ApiOk::new("Cita registrada", appointment)),
    ))
}

#[utoipa::path(
    get,
    path = "/api/citas",
    params(AppointmentFilter),
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Appointments ordered by slot")
    )
)]
#[axum::debug_handler]
pub(crate) async fn list_appointments(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiQuery(filter): ApiQuery<AppointmentFilter>,
) -> ApiResult<Json<ApiOk<Vec<Appointment>>>> {
    user.require(ANY_STAFF)?;
    let date = filter
        .date
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|raw| parse_date("fecha", raw))
        .transpose()?;
    let appointments = AppointmentService::new(state.store.clone())
        .list(date, filter.clinician_id)
        .await?;
    Ok(Json(ApiOk::new("Citas", appointments)))
}

#[utoipa::path(
    get,
    path = "/api/citas/{idCita}",
    params(("idCita" = i64, Path, description = "Appointment id")),
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Appointment"),
        (status = 404, description = "Appointment not found", body = ErrorRes)
    )
)]
#[axum::debug_handler]
pub(crate) async fn get_appointment(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiPath(id): ApiPath<i64>,
) -> ApiResult<Json<ApiOk<Appointment>>> {
    user.require(ANY_STAFF)?;
    let appointment = AppointmentService::new(state.store.clone()).get(id).await?;
    Ok(Json(ApiOk::new("Cita", appointment)))
}

#[utoipa::path(
    put,
    path = "/api/citas/{idCita}",
    params(("idCita" = i64, Path, description = "Appointment id")),
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Appointment updated"),
        (status = 409, description = "Slot taken or appointment closed", body = ErrorRes)
    )
)]
#[axum::debug_handler]
pub(crate) async fn update_appointment(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiPath(id): ApiPath<i64>,
    ApiJson(patch): ApiJson<AppointmentPatch>,
) -> ApiResult<Json<ApiOk<Appointment>>> {
    user.require(SCHEDULING)?;
    let appointment = AppointmentService::new(state.store.clone())
        .update(user.id, id, patch)
        .await?;
    Ok(Json(ApiOk::new("Cita actualizada", appointment)))
}

#[utoipa::path(
    put,
    path = "/api/citas/{idCita}/cancelar",
    params(("idCita" = i64, Path, description = "Appointment id")),
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Appointment cancelled"),
        (status = 409, description = "Appointment already closed", body = ErrorRes)
    )
)]
#[axum::debug_handler]
pub(crate) async fn cancel_appointment(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiPath(id): ApiPath<i64>,
) -> ApiResult<Json<ApiOk<Appointment>>> {
    user.require(SCHEDULING)?;
    let appointment = AppointmentService::new(state.store.clone())
        .cancel(user.id, id)
        .await?;
    Ok(Json(ApiOk::new("Cita cancelada", appointment)))
}
