use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use mcm_provider::Code;
use tracing::{error, warn};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error(transparent)]
    Provider(#[from] mcm_provider::Error),
}

/// HTTP status for an RPC code.
pub fn status_for(code: Code) -> StatusCode {
    match code {
        Code::Unimplemented => StatusCode::NOT_IMPLEMENTED,
        Code::NotFound => StatusCode::NOT_FOUND,
        Code::InvalidArgument => StatusCode::BAD_REQUEST,
        Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        Code::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        Code::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, state) = match &self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, Code::InvalidArgument.as_str(), None),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthenticated", None),
            ApiError::Provider(e) => {
                let code = e.code();
                if code == Code::Internal {
                    error!(error = ?e, "internal error while serving request");
                } else if code.is_retryable() {
                    warn!(%code, error = %e, "request failed, caller will retry");
                }
                (status_for(code), code.as_str(), e.last_known_state().map(|s| STANDARD.encode(s)))
            }
        };

        let mut body = serde_json::json!({ "code": code, "message": self.to_string() });
        if let Some(state) = state {
            body["lastKnownState"] = state.into();
        }
        (status, axum::Json(body)).into_response()
    }
}
