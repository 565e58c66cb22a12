use axum::{extract::FromRequestParts, http::request::Parts};

use crate::server::shared::types::api::ApiError;

pub const USER_ID_HEADER: &str = "x-user-id";

/// Caller identity, taken from the `x-user-id` header on every request
#[derive(Debug, Clone)]
pub struct UserId(pub String);

impl<S> FromRequestParts<S> for UserId
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ApiError::unauthorized("Missing x-user-id header"))?;

        Ok(UserId(value.to_string()))
    }
}
