//! Shared HTTP response helpers.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;

fn error_body(kind: &str, message: impl Into<String>) -> serde_json::Value {
    json!({
        "error": {
            "type": kind,
            "message": message.into(),
        }
    })
}

pub fn bad_request(message: impl Into<String>) -> Response {
    (StatusCode::BAD_REQUEST, Json(error_body("bad_request", message))).into_response()
}

pub fn not_found(message: impl Into<String>) -> Response {
    (StatusCode::NOT_FOUND, Json(error_body("not_found", message))).into_response()
}

pub fn internal_error(message: impl Into<String>) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(error_body("internal_error", message)),
    )
        .into_response()
}
