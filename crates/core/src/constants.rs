//! Constants used throughout the EMR core crate.
//!
//! This module contains defaults and field limits to ensure consistency
//! across the codebase and make maintenance easier.

/// Database URL used when no explicit URL is configured.
pub const DEFAULT_DATABASE_URL: &str = "sqlite://emr.db?mode=rwc";

/// Pool size used when no explicit size is configured.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// Maximum number of rows returned by search endpoints.
pub const SEARCH_LIMIT: i64 = 50;

/// Length cap for person names.
pub const NAME_MAX_LEN: usize = 100;

/// Length cap for short contact fields (phone, district, ...).
pub const SHORT_TEXT_MAX_LEN: usize = 100;

/// Length cap for addresses and email.
pub const ADDRESS_MAX_LEN: usize = 200;

/// Length cap for checklist detail fields.
pub const DETAIL_MAX_LEN: usize = 500;

/// Length cap for long clinical free text (narrative, plan, history sections).
pub const CLINICAL_TEXT_MAX_LEN: usize = 5_000;

/// Length cap for prescription line fields (dose, frequency, duration).
pub const PRESCRIPTION_FIELD_MAX_LEN: usize = 100;
