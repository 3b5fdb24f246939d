//! Common types for REST API responses and errors

use crate::Error;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

/// API error response
#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    pub message: String,
}

impl ApiError {
    pub fn new(message: impl Into<String>) -> Self {
        ApiError {
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> (StatusCode, Json<ApiError>) {
        (StatusCode::BAD_REQUEST, Json(ApiError::new(message)))
    }

    pub fn conflict(message: impl Into<String>) -> (StatusCode, Json<ApiError>) {
        (StatusCode::CONFLICT, Json(ApiError::new(message)))
    }

    pub fn internal(message: impl Into<String>) -> (StatusCode, Json<ApiError>) {
        (StatusCode::INTERNAL_SERVER_ERROR, Json(ApiError::new(message)))
    }

    pub fn bad_gateway(message: impl Into<String>) -> (StatusCode, Json<ApiError>) {
        (StatusCode::BAD_GATEWAY, Json(ApiError::new(message)))
    }

    /// Map a supervisor error onto a status code
    pub fn from_error(err: &Error) -> (StatusCode, Json<ApiError>) {
        match err {
            Error::Destroyed => Self::conflict(err.to_string()),
            Error::Config(_) | Error::Parse(_) => Self::bad_request(err.to_string()),
            Error::Fetch(_) | Error::ConnectivityTest(_) => Self::bad_gateway(err.to_string()),
            _ => Self::internal(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (StatusCode::INTERNAL_SERVER_ERROR, Json(self)).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

/// `GET /route` query
#[derive(Debug, Deserialize)]
pub struct RouteParams {
    pub host: String,
}

/// `PATCH /preferences` body
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreferencesPatch {
    pub enabled: Option<bool>,
    pub proxied_hosts: Option<Vec<String>>,
}
