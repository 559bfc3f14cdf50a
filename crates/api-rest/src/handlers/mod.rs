//! HTTP handlers, one module per resource.

pub(crate) mod appointments;
pub(crate) mod catalog;
pub(crate) mod consultations;
pub(crate) mod health;
pub(crate) mod history;
pub(crate) mod patients;

use serde::Deserialize;
use utoipa::IntoParams;

/// `?q=` free-text search parameter.
#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub(crate) struct SearchParams {
    /// Search term; empty or absent returns the first page.
    pub q: Option<String>,
}
