use std::time::Duration;

use axum::Json;
use axum::extract::{FromRequest, FromRequestParts, Request};
use axum::http::request::Parts;
use serde::de::DeserializeOwned;
use tokio::time::Instant;

use crate::error::ApiError;

/// Header carrying the caller's remaining time budget in milliseconds.
pub const TIMEOUT_HEADER: &str = "x-request-timeout-ms";

/// JSON body whose rejections render as `InvalidArgument`.
pub struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|e| ApiError::BadRequest(e.body_text()))?;
        Ok(Self(value))
    }
}

/// Deadline derived from [`TIMEOUT_HEADER`], if the caller sent one.
#[derive(Debug, Clone, Copy)]
pub struct CallerDeadline(pub Option<Instant>);

impl<S: Send + Sync> FromRequestParts<S> for CallerDeadline {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let Some(raw) = parts.headers.get(TIMEOUT_HEADER) else {
            return Ok(Self(None));
        };

        let millis: u64 = raw
            .to_str()
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .ok_or_else(|| ApiError::BadRequest(format!("{TIMEOUT_HEADER} must be a number of milliseconds")))?;

        Ok(Self(Some(Instant::now() + Duration::from_millis(millis))))
    }
}
