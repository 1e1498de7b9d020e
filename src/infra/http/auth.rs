//! Caller identity forwarded by the edge gateway.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::application::error::AppError;

pub const USER_ID_HEADER: &str = "x-user-id";

/// Authenticated user id taken from the `x-user-id` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserId(pub String);

impl UserId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<S> FromRequestParts<S> for UserId
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| UserId(value.to_string()))
            .ok_or(AppError::Unauthorized)
    }
}
