//! Input validation utilities.
//!
//! This module contains the helpers shared by create and update paths: text normalisation,
//! length caps, permissive boolean coercion and date/time parsing.

use crate::{EmrError, EmrResult};
use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Deserializer};

/// Trims the input and maps blank strings to `None`.
pub fn clean_text(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Truncates `value` to at most `max_chars` characters.
///
/// Used by create paths, where over-long input is cut silently rather than rejected.
pub fn truncate(value: &str, max_chars: usize) -> String {
    match value.char_indices().nth(max_chars) {
        Some((idx, _)) => value[..idx].to_string(),
        None => value.to_string(),
    }
}

/// Cleans and truncates an optional text value for a create path.
pub fn capped(value: Option<String>, max_chars: usize) -> Option<String> {
    clean_text(value).map(|v| truncate(&v, max_chars))
}

/// Records an error in `errors` when `value` exceeds `max_chars` characters.
///
/// Used by update paths, where exceeding the cap is reported instead of truncated.
pub fn check_len(errors: &mut Vec<String>, field: &str, value: &str, max_chars: usize) {
    if value.chars().count() > max_chars {
        errors.push(format!(
            "{field} exceeds maximum length of {max_chars} characters"
        ));
    }
}

/// Converts a list of collected messages into a `Validation` error, if any.
pub fn finish(errors: Vec<String>) -> EmrResult<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(EmrError::Validation(errors))
    }
}

/// Permissive truthy-string coercion.
///
/// `"true"`, `"1"`, `"sí"`, `"si"`, `"yes"` and `"verdadero"` (case-insensitive, trimmed) are
/// true. Everything else is false.
pub fn is_truthy(raw: &str) -> bool {
    matches!(
        raw.trim().to_lowercase().as_str(),
        "true" | "1" | "sí" | "si" | "yes" | "verdadero"
    )
}

/// A checklist flag accepted from loosely-typed clients.
///
/// Deserialises from booleans, numbers, strings or null; anything that is not truthy
/// (see [`is_truthy`]) becomes `false`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
#[serde(transparent)]
pub struct Flag(pub bool);

impl Flag {
    pub fn get(self) -> bool {
        self.0
    }

    pub fn as_int(self) -> i64 {
        i64::from(self.0)
    }
}

impl<'de> Deserialize<'de> for Flag {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = serde_json::Value::deserialize(deserializer)?;
        let truthy = match raw {
            serde_json::Value::Bool(b) => b,
            serde_json::Value::Number(n) => is_truthy(&n.to_string()),
            serde_json::Value::String(s) => is_truthy(&s),
            _ => false,
        };
        Ok(Flag(truthy))
    }
}

/// Deserialises a field that distinguishes "absent" from "explicitly null".
///
/// Use with `#[serde(default, deserialize_with = "present")]` on an `Option<Option<T>>`:
/// absent → `None`, `null` → `Some(None)`, value → `Some(Some(v))`.
pub fn present<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Parses an ISO `YYYY-MM-DD` date.
pub fn parse_date(field: &str, raw: &str) -> EmrResult<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| EmrError::InvalidInput(format!("{field} must be YYYY-MM-DD")))
}

/// Parses a `HH:MM` time and returns it normalised to two-digit hours and minutes.
pub fn parse_time(field: &str, raw: &str) -> EmrResult<String> {
    let time = NaiveTime::parse_from_str(raw.trim(), "%H:%M")
        .map_err(|_| EmrError::InvalidInput(format!("{field} must be HH:MM")))?;
    Ok(time.format("%H:%M").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthy_coercion_accepts_known_spellings() {
        for raw in ["true", "TRUE", "1", "sí", "Sí", "si", "yes", "Verdadero", " yes "] {
            assert!(is_truthy(raw), "{raw} should be truthy");
        }
        for raw in ["false", "0", "no", "", "2", "y"] {
            assert!(!is_truthy(raw), "{raw} should not be truthy");
        }
    }

    #[test]
    fn flag_deserialises_mixed_json() {
        #[derive(Deserialize)]
        struct Checklist {
            a: Flag,
            b: Flag,
            c: Flag,
            d: Flag,
            #[serde(default)]
            e: Flag,
        }

        let parsed: Checklist =
            serde_json::from_str(r#"{"a": true, "b": 1, "c": "SI", "d": null}"#).unwrap();
        assert!(parsed.a.get());
        assert!(parsed.b.get());
        assert!(parsed.c.get());
        assert!(!parsed.d.get());
        assert!(!parsed.e.get());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("corazón", 6), "corazó");
        assert_eq!(truncate("abc", 10), "abc");
    }

    #[test]
    fn present_distinguishes_null_from_absent() {
        #[derive(Deserialize)]
        struct Patch {
            #[serde(default, deserialize_with = "present")]
            phone: Option<Option<String>>,
        }

        let absent: Patch = serde_json::from_str("{}").unwrap();
        let null: Patch = serde_json::from_str(r#"{"phone": null}"#).unwrap();
        let set: Patch = serde_json::from_str(r#"{"phone": "999"}"#).unwrap();
        assert_eq!(absent.phone, None);
        assert_eq!(null.phone, Some(None));
        assert_eq!(set.phone, Some(Some("999".into())));
    }

    #[test]
    fn parse_time_normalises() {
        assert_eq!(parse_time("hora", "9:05").unwrap(), "09:05");
        assert!(parse_time("hora", "25:00").is_err());
    }
}
