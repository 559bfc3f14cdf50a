//! Bearer-token authentication and role allow-lists.
//!
//! A request is authenticated when its token verifies, the user still exists and is active,
//! and the token's session id is the user's current one. The role used for allow-lists is
//! the stored role, not the one embedded in the token.

use api_shared::auth::bearer_token;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use emr_core::{AccountService, Role};

use crate::error::ApiError;
use crate::AppState;

/// Every staff role.
pub const ANY_STAFF: &[Role] = &[Role::Admin, Role::Physician, Role::FrontDesk, Role::Nurse];
/// Consultation workflow.
pub const PHYSICIANS: &[Role] = &[Role::Physician];
/// Patient registration and vitals intake.
pub const INTAKE: &[Role] = &[Role::Admin, Role::FrontDesk, Role::Nurse, Role::Physician];
/// Appointment scheduling.
pub const SCHEDULING: &[Role] = &[Role::Admin, Role::FrontDesk, Role::Physician];
/// Reading clinical history.
pub const CLINICAL_READ: &[Role] = &[Role::Admin, Role::Physician, Role::Nurse];

/// The authenticated caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurrentUser {
    pub id: i64,
    pub role: Role,
}

impl CurrentUser {
    /// Fails with 403 unless the caller's role is in `allowed`.
    pub fn require(&self, allowed: &[Role]) -> Result<(), ApiError> {
        if allowed.contains(&self.role) {
            Ok(())
        } else {
            tracing::debug!(user_id = self.id, role = %self.role, "role not allowed");
            Err(ApiError::Forbidden)
        }
    }
}

#[axum::async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(ApiError::Unauthorized)?;
        let token = bearer_token(header).map_err(|_| ApiError::Unauthorized)?;
        let claims = state.config.keys().verify(token).map_err(|e| {
            tracing::debug!("rejected token: {e}");
            ApiError::Unauthorized
        })?;

        let account = AccountService::new(state.store.clone())
            .current_session(claims.sub)
            .await?;
        match account {
            Some(account) if account.accepts_session(&claims.sid) => Ok(CurrentUser {
                id: account.id,
                role: account.role,
            }),
            _ => {
                tracing::debug!(user_id = claims.sub, "stale or inactive session");
                Err(ApiError::Unauthorized)
            }
        }
    }
}
