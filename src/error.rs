use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde_json::json;

/// Classified failure from the messaging provider. The reconciler keys its
/// decisions off the kind: only `NotFound` triggers self-healing deletion,
/// a `Timeout` never does (the remote instance most likely still exists).
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Transport(String),
    #[error("provider request timed out after {0}s")]
    Timeout(u64),
    #[error("provider returned {status}: {message}")]
    Remote { status: u16, message: String },
    #[error("provider rejected the instance name (already exists)")]
    Forbidden,
    #[error("instance not found on the provider")]
    NotFound,
}

impl ProviderError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database connection failed: {0}")]
    Connection(String),
    #[error("query failed: {0}")]
    Query(String),
    #[error("row not found")]
    NotFound,
}

impl From<diesel::result::Error> for StoreError {
    fn from(err: diesel::result::Error) -> Self {
        match err {
            diesel::result::Error::NotFound => Self::NotFound,
            other => Self::Query(other.to_string()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not authenticated")]
    Auth,
    #[error("{0}")]
    Validation(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("access denied")]
    Permission,
    #[error("provider unavailable")]
    Provider(#[from] ProviderError),
    #[error("storage failure")]
    Store(#[from] StoreError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, body) = match &self {
            Self::Auth => (StatusCode::UNAUTHORIZED, json!({"error": "Not authenticated"})),
            Self::Validation(msg) => (StatusCode::BAD_REQUEST, json!({"error": msg})),
            Self::NotFound(what) => (
                StatusCode::NOT_FOUND,
                json!({"error": format!("{what} not found")}),
            ),
            Self::Permission => (StatusCode::FORBIDDEN, json!({"error": "Access denied"})),
            Self::Provider(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"error": "Provider error", "details": e.to_string()}),
            ),
            Self::Store(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"error": "Storage error", "details": e.to_string()}),
            ),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_classification() {
        assert!(ProviderError::NotFound.is_not_found());
        assert!(!ProviderError::Timeout(30).is_not_found());
        assert!(!ProviderError::Transport("refused".into()).is_not_found());
    }

    #[test]
    fn test_api_error_status_codes() {
        use axum::response::IntoResponse;
        assert_eq!(ApiError::Auth.into_response().status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ApiError::Validation("instanceName is required".into())
                .into_response()
                .status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::NotFound("Instance").into_response().status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(ApiError::Permission.into_response().status(), StatusCode::FORBIDDEN);
    }
}
