//! 错误到HTTP响应的映射

use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use pacs_core::PacsError;
use serde_json::json;

/// 处理器返回的错误
#[derive(Debug)]
pub struct ApiError(pub PacsError);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            PacsError::MalformedRequest(_) => StatusCode::BAD_REQUEST,
            PacsError::StudyNotFound(_) => StatusCode::NOT_FOUND,
            PacsError::UpstreamAuth(_)
            | PacsError::MetadataResolution(_)
            | PacsError::UpstreamUnavailable(_)
            | PacsError::InstanceFetch(_) => StatusCode::BAD_GATEWAY,
            PacsError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<PacsError> for ApiError {
    fn from(err: PacsError) -> Self {
        Self(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(PacsError::MalformedRequest(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error_response(self.status(), self.0.kind(), &self.0.to_string())
    }
}

/// 统一的错误响应体
pub fn error_response(status: StatusCode, kind: &str, message: &str) -> Response {
    let body = Json(json!({
        "error": true,
        "kind": kind,
        "message": message,
        "status": status.as_u16(),
    }));

    (status, body).into_response()
}
