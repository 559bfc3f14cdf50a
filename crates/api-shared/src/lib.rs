//! # API Shared
//!
//! Shared utilities and definitions for the EMR APIs.
//!
//! Contains:
//! - Request/response wire types with OpenAPI schemas (`wire` module)
//! - Response envelopes
//! - Shared services like `HealthService`
//! - Bearer-token claims and signing keys
//!
//! Used by `api-rest` and the operator CLI.

pub mod auth;
pub mod envelope;
pub mod health;
pub mod wire;

pub use auth::{AuthError, Claims, TokenKeys};
pub use envelope::{ApiOk, ErrorRes};
pub use health::{HealthRes, HealthService};
