//! The API error envelope.
//!
//! Every error leaves the HTTP surface as
//! `{error: {code, message, details?, request_id, timestamp}}` with the
//! status mapped from the domain taxonomy.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;

use hearth_domain::error::Error;

pub struct ApiError(pub Error);

pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self(error)
    }
}

fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::Json(_) | Error::InvalidInput(_) | Error::Config(_) | Error::Constraint { .. } => {
            StatusCode::BAD_REQUEST
        }
        Error::Auth(_) => StatusCode::UNAUTHORIZED,
        Error::PolicyDenied { .. } => StatusCode::FORBIDDEN,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Conflict(_) => StatusCode::CONFLICT,
        Error::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        Error::Http(_) | Error::Provider { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        let request_id = uuid::Uuid::new_v4().simple().to_string();

        if status.is_server_error() {
            tracing::error!(request_id = %request_id, error = %self.0, "request failed");
        }

        let body = serde_json::json!({
            "error": {
                "code": self.0.code(),
                "message": self.0.to_string(),
                "request_id": request_id,
                "timestamp": Utc::now().to_rfc3339(),
            }
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_follows_taxonomy() {
        assert_eq!(status_for(&Error::InvalidInput("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(&Error::Auth("x".into())), StatusCode::UNAUTHORIZED);
        assert_eq!(
            status_for(&Error::PolicyDenied { rule: "r".into(), reason: "x".into() }),
            StatusCode::FORBIDDEN
        );
        assert_eq!(status_for(&Error::NotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&Error::Conflict("x".into())), StatusCode::CONFLICT);
        assert_eq!(
            status_for(&Error::RateLimited { retry_after: None }),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(status_for(&Error::Storage("x".into())), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
