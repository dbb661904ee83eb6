//! Bearer-token authorization for runner endpoints.

use axum::http::HeaderMap;

use crate::routes::ApiError;

/// Check a runner request against the configured access token.
///
/// No configured token disables the check entirely. A missing header maps
/// to 401, a wrong token to 403; neither touches job state.
///
/// # Errors
///
/// Returns the [`ApiError`] to surface when the request is not authorized.
pub fn authorize_runner(expected: Option<&str>, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = expected else {
        return Ok(());
    };

    let Some(header) = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
    else {
        return Err(ApiError::Unauthorized("Missing Authorization header"));
    };

    let token = header
        .strip_prefix("Bearer ")
        .or_else(|| header.strip_prefix("bearer "))
        .unwrap_or(header)
        .trim();
    if token != expected {
        return Err(ApiError::Forbidden("Invalid runner token"));
    }
    Ok(())
}
