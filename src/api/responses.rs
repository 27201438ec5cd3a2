//! API response types
//!
//! Error responses follow RFC 7807 problem details, the same shape for
//! every endpoint. Success payloads are endpoint-specific and serialize
//! directly.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::documents::GatewayError;

/// API error following RFC 7807 problem details.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    /// Human-readable title
    pub title: String,

    /// HTTP status code
    pub status: u16,

    /// Detailed error message
    pub detail: String,

    /// Stable error code
    pub code: String,

    /// Response timestamp
    pub timestamp: DateTime<Utc>,
}

impl ApiError {
    pub fn new(
        status: StatusCode,
        code: impl Into<String>,
        title: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            status: status.as_u16(),
            detail: detail.into(),
            code: code.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", "Bad Request", detail)
    }

    pub fn unauthorized(detail: impl Into<String>) -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "UNAUTHORIZED",
            "Unauthorized",
            detail,
        )
    }

    pub fn forbidden(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "FORBIDDEN", "Forbidden", detail)
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            "Resource Not Found",
            detail,
        )
    }

    pub fn internal_error(detail: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_ERROR",
            "Internal Server Error",
            detail,
        )
    }

    pub fn service_unavailable(detail: impl Into<String>) -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "SERVICE_UNAVAILABLE",
            "Service Unavailable",
            detail,
        )
    }

    /// Map a data-gateway failure onto the HTTP taxonomy.
    pub fn from_gateway(e: GatewayError) -> Self {
        match e {
            GatewayError::NotFound(id) => Self::not_found(format!("document {} not found", id)),
            GatewayError::PermissionDenied { document_id, .. } => {
                Self::forbidden(format!("not a collaborator on {}", document_id))
            }
            GatewayError::Transient(detail) => Self::service_unavailable(detail),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors_set_status() {
        assert_eq!(ApiError::bad_request("x").status, 400);
        assert_eq!(ApiError::unauthorized("x").status, 401);
        assert_eq!(ApiError::forbidden("x").status, 403);
        assert_eq!(ApiError::not_found("x").status, 404);
        assert_eq!(ApiError::internal_error("x").status, 500);
        assert_eq!(ApiError::service_unavailable("x").status, 503);
    }

    #[test]
    fn test_gateway_error_mapping() {
        let not_found = ApiError::from_gateway(GatewayError::NotFound("d1".to_string()));
        assert_eq!(not_found.status, 404);

        let denied = ApiError::from_gateway(GatewayError::PermissionDenied {
            principal_id: "p".to_string(),
            document_id: "d1".to_string(),
        });
        assert_eq!(denied.status, 403);

        let transient = ApiError::from_gateway(GatewayError::Transient("io".to_string()));
        assert_eq!(transient.status, 503);
    }
}
