use api_shared::ApiOk;
use axum::extract::State;
use axum::response::Json;
use emr_core::repositories::catalog::{CatalogService, Cie10Code, Medication};

use super::SearchParams;
use crate::auth::{CurrentUser, ANY_STAFF};
use crate::error::{ApiQuery, ApiResult};
use crate::AppState;

#[utoipa::path(
    get,
    path = "/api/catalogos/cie10",
    params(SearchParams),
    security(("bearer" = [])),
    responses(
        (status = 200, description = "CIE-10 codes by code prefix or description")
    )
)]
#[axum::debug_handler]
pub(crate) async fn search_cie10(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiQuery(params): ApiQuery<SearchParams>,
) -> ApiResult<Json<ApiOk<Vec<Cie10Code>>>> {
    user.require(ANY_STAFF)?;
    let codes = CatalogService::new(state.store.clone())
        .search_cie10(params.q.as_deref())
        .await?;
    Ok(Json(ApiOk::new("Códigos CIE-10", codes)))
}

#[utoipa::path(
    get,
    path = "/api/catalogos/medicamentos",
    params(SearchParams),
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Medications by name")
    )
)]
#[axum::debug_handler]
pub(crate) async fn search_medications(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiQuery(params): ApiQuery<SearchParams>,
) -> ApiResult<Json<ApiOk<Vec<Medication>>>> {
    user.require(ANY_STAFF)?;
    let medications = CatalogService::new(state.store.clone())
        .search_medications(params.q.as_deref())
        .await?;
    Ok(Json(ApiOk::new("Medicamentos", medications)))
}
