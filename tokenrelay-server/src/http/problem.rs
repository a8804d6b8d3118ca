//! `application/problem+json` bodies.
//!
//! Streaming routes fail before the first byte is written, so every error a
//! client can see arrives as one of these documents. The `code` doubles as the
//! last path segment of `type`.

use axum::{
    Json,
    http::{
        StatusCode,
        header::{CACHE_CONTROL, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
};
use serde::{Serialize, Serializer};
use serde_json::Value;

const PROBLEM_BASE: &str = "https://tokenrelay.dev/problems/";
const PROBLEM_JSON: &str = "application/problem+json";

#[derive(Debug, Serialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    kind: String,
    title: &'static str,
    #[serde(serialize_with = "status_as_u16")]
    status: StatusCode,
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

fn status_as_u16<S: Serializer>(status: &StatusCode, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u16(status.as_u16())
}

impl ProblemDetails {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind: format!("{PROBLEM_BASE}{code}"),
            title: status.canonical_reason().unwrap_or("Error"),
            status,
            code,
            message: message.into(),
            details: None,
        }
    }

    /// Attaches machine-readable context, e.g. the offending field.
    #[must_use]
    pub fn with_details(self, details: Value) -> Self {
        Self {
            details: Some(details),
            ..self
        }
    }
}

impl IntoResponse for ProblemDetails {
    fn into_response(self) -> Response {
        // Header parts are applied after `Json`, so this content type wins.
        let headers = [(CONTENT_TYPE, PROBLEM_JSON), (CACHE_CONTROL, "no-store")];
        (self.status, headers, Json(self)).into_response()
    }
}
