use axum::{extract::FromRequestParts, http::request::Parts};

use crate::error::ApiError;
use crate::AppState;

/// Extractor that validates the `X-Admin-Key` header against
/// `config.platform_admin_key`. Guards platform-operator endpoints
/// (school listing, subscription plan overrides).
pub struct PlatformAdminAuth;

impl FromRequestParts<AppState> for PlatformAdminAuth {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let key = parts
            .headers
            .get("X-Admin-Key")
            .and_then(|v| v.to_str().ok())
            .ok_or(ApiError::Unauthorized("Missing X-Admin-Key header"))?;

        if key != state.config.platform_admin_key {
            return Err(ApiError::Unauthorized("Invalid platform admin key"));
        }

        Ok(PlatformAdminAuth)
    }
}
