use crate::access::Principal;
use crate::jwt::{validate_token, USER_ACCESS};
use crate::{ApiError, AppState};
use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

/// Resolves the bearer token into a [`Principal`] request extension.
pub async fn require_principal(
    State(data): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let token = match req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|auth_header| auth_header.to_str().ok())
        .and_then(|auth_value| auth_value.strip_prefix("Bearer "))
    {
        Some(token) => token.trim().to_string(),
        None => return ApiError::InvalidJwt.into_response(),
    };

    let claims = match validate_token(&token, &data.config.jwt_secret, USER_ACCESS) {
        Ok(claims) => claims,
        Err(e) => {
            tracing::debug!("Rejected bearer token: {}", e);
            return ApiError::InvalidJwt.into_response();
        }
    };

    let user_id = match claims.user_id() {
        Ok(user_id) => user_id,
        Err(e) => {
            tracing::error!("Error parsing user uuid: {:?}", e);
            return ApiError::InvalidJwt.into_response();
        }
    };

    req.extensions_mut().insert(Principal::new(user_id));
    next.run(req).await
}
