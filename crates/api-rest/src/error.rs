//! Mapping of domain and request errors onto HTTP responses.

use api_shared::ErrorRes;
use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{FromRequest, FromRequestParts, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use emr_core::{EmrError, Prerequisite};

use crate::AppState;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug)]
pub enum ApiError {
    Emr(EmrError),
    /// Malformed request body, path or query string.
    BadRequest(String),
    Unauthorized,
    Forbidden,
}

impl From<EmrError> for ApiError {
    fn from(err: EmrError) -> Self {
        ApiError::Emr(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

/// `axum::Json` with rejections reported in the error envelope.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
pub struct ApiJson<T>(pub T);

#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Path), rejection(ApiError))]
pub struct ApiPath<T>(pub T);

#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(ApiError))]
pub struct ApiQuery<T>(pub T);

/// Internal failure detail, attached to 500 responses and exposed only in development.
#[derive(Clone, Debug)]
struct InternalDetail(String);

fn status_and_body(err: &EmrError) -> (StatusCode, ErrorRes) {
    let bad_request = StatusCode::BAD_REQUEST;
    let conflict = StatusCode::CONFLICT;
    match err {
        EmrError::Validation(items) => (
            bad_request,
            ErrorRes::new("validation failed")
                .with_code("VALIDATION")
                .with_items(items.clone()),
        ),
        EmrError::InvalidInput(_) | EmrError::Text(_) => (
            bad_request,
            ErrorRes::new(err.to_string()).with_code("INVALID_INPUT"),
        ),
        EmrError::NoFieldsToUpdate => (
            bad_request,
            ErrorRes::new(err.to_string()).with_code("NO_FIELDS_TO_UPDATE"),
        ),
        EmrError::WrongExamKind { .. } => (
            bad_request,
            ErrorRes::new(err.to_string()).with_code("WRONG_EXAM_KIND"),
        ),
        EmrError::Prerequisite(Prerequisite::MissingVitals) => (
            bad_request,
            ErrorRes::new("vital signs must be recorded today before starting a consultation")
                .with_code("MISSING_VITALS"),
        ),
        EmrError::Prerequisite(Prerequisite::MissingIntakeHistory) => (
            bad_request,
            ErrorRes::new("the patient has no intake history on file")
                .with_code("MISSING_INTAKE_HISTORY"),
        ),
        EmrError::IncompleteForFinalization(missing) => (
            bad_request,
            ErrorRes::new("consultation is incomplete")
                .with_code("INCOMPLETE")
                .with_items(missing.iter().map(|r| r.as_str().to_string()).collect()),
        ),

        EmrError::PatientNotFound => (
            StatusCode::NOT_FOUND,
            ErrorRes::new(err.to_string()).with_code("PATIENT_NOT_FOUND"),
        ),
        EmrError::NotFound(_) | EmrError::NotFoundOrForbidden => (
            StatusCode::NOT_FOUND,
            ErrorRes::new(err.to_string()).with_code("NOT_FOUND"),
        ),

        EmrError::DuplicateDiagnosis => (
            conflict,
            ErrorRes::new(err.to_string()).with_code("DUPLICATE_DIAGNOSIS"),
        ),
        EmrError::DuplicateNationalId => (
            conflict,
            ErrorRes::new(err.to_string()).with_code("DUPLICATE_NATIONAL_ID"),
        ),
        EmrError::IntakeHistoryExists => (
            conflict,
            ErrorRes::new(err.to_string()).with_code("INTAKE_HISTORY_EXISTS"),
        ),
        EmrError::PrescriptionExists => (
            conflict,
            ErrorRes::new(err.to_string()).with_code("PRESCRIPTION_EXISTS"),
        ),
        EmrError::SchedulingConflict => (
            conflict,
            ErrorRes::new(err.to_string()).with_code("SCHEDULING_CONFLICT"),
        ),
        EmrError::AlreadyFinalizedOrCancelled(_) | EmrError::AppointmentClosed(_) => (
            conflict,
            ErrorRes::new(err.to_string()).with_code("CLOSED"),
        ),

        EmrError::Database(_) | EmrError::Migration(_) | EmrError::CorruptRecord(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorRes::new("internal server error").with_code("INTERNAL"),
        ),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Emr(err) => {
                let (status, body) = status_and_body(&err);
                if status == StatusCode::INTERNAL_SERVER_ERROR {
                    tracing::error!("request failed: {err}");
                    let mut response = (status, Json(body)).into_response();
                    response
                        .extensions_mut()
                        .insert(InternalDetail(err.to_string()));
                    return response;
                }
                (status, Json(body)).into_response()
            }
            ApiError::BadRequest(detail) => (
                StatusCode::BAD_REQUEST,
                Json(ErrorRes::new(detail).with_code("BAD_REQUEST")),
            )
                .into_response(),
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                Json(ErrorRes::new("authentication required").with_code("UNAUTHORIZED")),
            )
                .into_response(),
            ApiError::Forbidden => (
                StatusCode::FORBIDDEN,
                Json(ErrorRes::new("role not allowed for this operation").with_code("FORBIDDEN")),
            )
                .into_response(),
        }
    }
}

/// Response middleware: in development, 500 responses carry the underlying error text.
pub(crate) async fn expose_internal_detail(
    State(state): State<AppState>,
    response: Response,
) -> Response {
    if !state.config.development() {
        return response;
    }
    match response.extensions().get::<InternalDetail>().cloned() {
        Some(InternalDetail(detail)) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorRes::new(detail).with_code("INTERNAL")),
        )
            .into_response(),
        None => response,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emr_core::{ExamKind, Requirement};

    #[test]
    fn incomplete_consultations_list_missing_requirements() {
        let (status, body) = status_and_body(&EmrError::IncompleteForFinalization(vec![
            Requirement::Narrative,
            Requirement::Diagnosis,
        ]));
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.errores, vec!["relato", "diagnosticos"]);
    }

    #[test]
    fn domain_errors_map_to_expected_statuses() {
        let cases = [
            (EmrError::PatientNotFound, StatusCode::NOT_FOUND),
            (EmrError::NotFoundOrForbidden, StatusCode::NOT_FOUND),
            (EmrError::DuplicateNationalId, StatusCode::CONFLICT),
            (EmrError::SchedulingConflict, StatusCode::CONFLICT),
            (
                EmrError::Prerequisite(Prerequisite::MissingVitals),
                StatusCode::BAD_REQUEST,
            ),
            (
                EmrError::WrongExamKind {
                    expected: ExamKind::Detailed,
                    supplied: ExamKind::Simplified,
                },
                StatusCode::BAD_REQUEST,
            ),
            (
                EmrError::CorruptRecord("row 1".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(status_and_body(&err).0, expected, "{err}");
        }
    }

    #[test]
    fn internal_errors_hide_their_detail() {
        let (_, body) = status_and_body(&EmrError::CorruptRecord("secret path".into()));
        assert_eq!(body.error, "internal server error");
    }
}
