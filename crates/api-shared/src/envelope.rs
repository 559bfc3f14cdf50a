//! JSON response envelopes.
//!
//! Success: `{"message", "success": true, "data"?, "metadata"?}`.
//! Failure: `{"error", "code"?, "errores"?}`; `errores` itemises validation problems and
//! missing finalization requirements.

use serde::Serialize;
use utoipa::ToSchema;

#[derive(Debug, Clone, Serialize)]
pub struct ApiOk<T> {
    pub message: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl<T> ApiOk<T> {
    pub fn new(message: impl Into<String>, data: T) -> Self {
        Self {
            message: message.into(),
            success: true,
            data: Some(data),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

impl ApiOk<()> {
    /// An envelope with a message and no payload.
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            success: true,
            data: None,
            metadata: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct ErrorRes {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errores: Vec<String>,
}

impl ErrorRes {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: None,
            errores: Vec::new(),
        }
    }

    pub fn with_code(mut self, code: &str) -> Self {
        self.code = Some(code.to_string());
        self
    }

    pub fn with_items(mut self, items: Vec<String>) -> Self {
        self.errores = items;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_fields_are_omitted() {
        let ok = serde_json::to_value(ApiOk::message("Consulta cancelada")).unwrap();
        assert_eq!(ok, json!({"message": "Consulta cancelada", "success": true}));

        let err = serde_json::to_value(ErrorRes::new("not found")).unwrap();
        assert_eq!(err, json!({"error": "not found"}));
    }

    #[test]
    fn itemised_errors_are_listed() {
        let err = ErrorRes::new("incomplete")
            .with_code("INCOMPLETE")
            .with_items(vec!["relato".into(), "plan_trabajo".into()]);
        let value = serde_json::to_value(err).unwrap();
        assert_eq!(value["errores"], json!(["relato", "plan_trabajo"]));
        assert_eq!(value["code"], "INCOMPLETE");
    }
}
