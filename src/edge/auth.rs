use axum::{
    extract::Request,
    http::{header::AUTHORIZATION, HeaderMap},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use subtle::ConstantTimeEq;

use super::error::ApiError;

/// Bearer-token guard for the mutating admin endpoints
pub struct AdminAuth {
    token: Option<String>,
}

impl AdminAuth {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: token.filter(|t| !t.is_empty()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.token.is_some()
    }

    pub fn validate(&self, presented: Option<&str>) -> bool {
        // No token configured: admin endpoints are open (development mode)
        let Some(expected) = &self.token else {
            return true;
        };
        match presented {
            Some(presented) => bool::from(presented.as_bytes().ct_eq(expected.as_bytes())),
            None => false,
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
}

pub async fn admin_auth_middleware(
    auth: Arc<AdminAuth>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    if auth.validate(bearer_token(&headers)) {
        next.run(request).await
    } else {
        ApiError::Unauthorized.into_response()
    }
}
