//! Intake history outside of a consultation: read and amend.
//!
//! Creation happens only inside a first-visit consultation.

use api_shared::{ApiOk, ErrorRes};
use axum::extract::State;
use axum::response::Json;
use emr_core::repositories::history::{HistoryService, IntakeHistory, IntakeHistoryPatch};

use crate::auth::{CurrentUser, CLINICAL_READ, PHYSICIANS};
use crate::error::{ApiJson, ApiPath, ApiResult};
use crate::AppState;

#[utoipa::path(
    get,
    path = "/api/antecedentes/{idFichaClinica}",
    params(("idFichaClinica" = i64, Path, description = "Patient id")),
    security(("bearer" = [])),
    responses(
        (status = 200, description = "The patient's intake history"),
        (status = 404, description = "Patient or history not found", body = ErrorRes)
    )
)]
#[axum::debug_handler]
pub(crate) async fn get_intake_history(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiPath(patient_id): ApiPath<i64>,
) -> ApiResult<Json<ApiOk<IntakeHistory>>> {
    user.require(CLINICAL_READ)?;
    let history = HistoryService::new(state.store.clone())
        .get(patient_id)
        .await?;
    Ok(Json(ApiOk::new("Antecedentes", history)))
}

#[utoipa::path(
    put,
    path = "/api/antecedentes/{idFichaClinica}",
    params(("idFichaClinica" = i64, Path, description = "Patient id")),
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Intake history updated"),
        (status = 400, description = "No history on file or nothing to update", body = ErrorRes)
    )
)]
#[axum::debug_handler]
pub(crate) async fn update_intake_history(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiPath(patient_id): ApiPath<i64>,
    ApiJson(patch): ApiJson<IntakeHistoryPatch>,
) -> ApiResult<Json<ApiOk<IntakeHistory>>> {
    user.require(PHYSICIANS)?;
    let history = HistoryService::new(state.store.clone())
        .update(user.id, patient_id, patch)
        .await?;
    Ok(Json(ApiOk::new("Antecedentes actualizados", history)))
}
