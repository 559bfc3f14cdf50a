//! # API REST
//!
//! REST API implementation for the EMR backend.
//!
//! Handles:
//! - HTTP endpoints with axum
//! - OpenAPI/Swagger documentation
//! - REST-specific concerns (JSON envelopes, CORS, bearer-token sessions)
//!
//! Uses `api-shared` for wire types and `emr-core` for all domain work.

#![warn(rust_2018_idioms)]

pub mod auth;
pub mod error;
mod handlers;

use anyhow::Context;
use api_shared::TokenKeys;
use axum::routing::{delete, get, post, put};
use axum::{middleware, Router};
use emr_core::Store;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};
use utoipa_swagger_ui::SwaggerUi;

use handlers::{appointments, catalog, consultations, health, history, patients};

/// Bind address used when `EMR_REST_ADDR` is not set.
pub const DEFAULT_REST_ADDR: &str = "0.0.0.0:3000";

/// REST configuration resolved at startup.
#[derive(Clone, Debug)]
pub struct ApiConfig {
    addr: String,
    keys: TokenKeys,
    development: bool,
}

impl ApiConfig {
    pub fn new(addr: String, jwt_secret: &str, development: bool) -> anyhow::Result<Self> {
        let keys = TokenKeys::from_secret(jwt_secret).context("EMR_JWT_SECRET")?;
        Ok(Self {
            addr,
            keys,
            development,
        })
    }

    /// Build a configuration from optional raw values (typically environment variables).
    ///
    /// The signing secret is required; development mode is on when `env` is `development`.
    pub fn from_env_values(
        addr: Option<String>,
        jwt_secret: Option<String>,
        env: Option<String>,
    ) -> anyhow::Result<Self> {
        let addr = addr
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_REST_ADDR.into());
        let secret = jwt_secret
            .filter(|v| !v.trim().is_empty())
            .context("EMR_JWT_SECRET must be set")?;
        let development = env
            .as_deref()
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("development"));
        Self::new(addr, &secret, development)
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn keys(&self) -> &TokenKeys {
        &self.keys
    }

    pub fn development(&self) -> bool {
        self.development
    }
}

/// Application state for the REST API server
///
/// Contains shared state that needs to be accessible to all request handlers: the store
/// (pool plus audit emitter) and the resolved configuration.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub config: Arc<ApiConfig>,
}

impl AppState {
    pub fn new(store: Store, config: ApiConfig) -> Self {
        Self {
            store,
            config: Arc::new(config),
        }
    }
}

struct BearerAuth;

impl Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health,
        consultations::start_consultation,
        consultations::consultation_requirements,
        consultations::consultation_detail,
        consultations::record_narrative,
        consultations::record_physical_exam,
        consultations::record_work_plan,
        consultations::record_intake_history,
        consultations::list_diagnoses,
        consultations::add_diagnosis,
        consultations::import_diagnoses,
        consultations::remove_diagnosis,
        consultations::get_prescription,
        consultations::create_prescription,
        consultations::finalize_consultation,
        consultations::cancel_consultation,
        consultations::consultation_status,
        patients::create_patient,
        patients::search_patients,
        patients::get_patient,
        patients::update_patient,
        patients::get_patient_by_national_id,
        patients::list_vitals,
        patients::record_vitals,
        history::get_intake_history,
        history::update_intake_history,
        appointments::create_appointment,
        appointments::list_appointments,
        appointments::get_appointment,
        appointments::update_appointment,
        appointments::cancel_appointment,
        catalog::search_cie10,
        catalog::search_medications,
    ),
    components(schemas(
        api_shared::HealthRes,
        api_shared::ErrorRes,
        api_shared::wire::StartConsultationReq,
        api_shared::wire::StartConsultationRes,
        api_shared::wire::NarrativeReq,
        api_shared::wire::PhysicalExamReq,
        api_shared::wire::WorkPlanReq,
        api_shared::wire::DiagnosisReq,
        api_shared::wire::BulkDiagnosesReq,
        api_shared::wire::PrescriptionLineReq,
        api_shared::wire::PrescriptionReq,
        api_shared::wire::CancelConsultationReq,
    )),
    modifiers(&BearerAuth)
)]
pub struct ApiDoc;

/// Builds the full application router.
pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/consulta/iniciar", post(consultations::start_consultation))
        .route(
            "/consulta/requisitos/:patient_id",
            get(consultations::consultation_requirements),
        )
        .route("/consulta/:id", get(consultations::consultation_detail))
        .route("/consulta/:id/relato", put(consultations::record_narrative))
        .route(
            "/consulta/:id/examen-fisico",
            put(consultations::record_physical_exam),
        )
        .route("/consulta/:id/plan-trabajo", put(consultations::record_work_plan))
        .route(
            "/consulta/:id/antecedentes",
            post(consultations::record_intake_history),
        )
        .route(
            "/consulta/:id/diagnosticos",
            get(consultations::list_diagnoses).post(consultations::add_diagnosis),
        )
        .route(
            "/consulta/:id/diagnosticos/lote",
            post(consultations::import_diagnoses),
        )
        .route(
            "/consulta/:id/diagnosticos/:diagnosis_id",
            delete(consultations::remove_diagnosis),
        )
        .route(
            "/consulta/:id/recetas",
            get(consultations::get_prescription).post(consultations::create_prescription),
        )
        .route("/consulta/:id/finalizar", put(consultations::finalize_consultation))
        .route("/consulta/:id/cancelar", put(consultations::cancel_consultation))
        .route("/consulta/:id/estado", get(consultations::consultation_status))
        .route(
            "/pacientes",
            get(patients::search_patients).post(patients::create_patient),
        )
        .route(
            "/pacientes/dni/:national_id",
            get(patients::get_patient_by_national_id),
        )
        .route(
            "/pacientes/:id",
            get(patients::get_patient).put(patients::update_patient),
        )
        .route(
            "/pacientes/:id/signos-vitales",
            get(patients::list_vitals).post(patients::record_vitals),
        )
        .route(
            "/antecedentes/:patient_id",
            get(history::get_intake_history).put(history::update_intake_history),
        )
        .route(
            "/citas",
            get(appointments::list_appointments).post(appointments::create_appointment),
        )
        .route(
            "/citas/:id",
            get(appointments::get_appointment).put(appointments::update_appointment),
        )
        .route("/citas/:id/cancelar", put(appointments::cancel_appointment))
        .route("/catalogos/cie10", get(catalog::search_cie10))
        .route("/catalogos/medicamentos", get(catalog::search_medications));

    Router::new()
        .route("/health", get(health::health))
        .nest("/api", api)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(middleware::map_response_with_state(
            state.clone(),
            error::expose_internal_detail,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
