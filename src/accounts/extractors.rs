use std::convert::Infallible;
use std::fmt;

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use uuid::Uuid;

use crate::context::CallContext;
use crate::error::AppError;
use crate::state::AppState;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Builds the request's [`CallContext`] once and caches it in the extensions.
fn request_context(parts: &mut Parts, state: &AppState) -> CallContext {
    if let Some(ctx) = parts.extensions.get::<CallContext>() {
        return ctx.clone();
    }
    let request_id = parts
        .headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let ctx = CallContext::background()
        .with_request_id(request_id)
        .with_timeout(state.config.request_timeout);
    parts.extensions.insert(ctx.clone());
    ctx
}

/// Request id and deadline for the current request.
pub struct RequestContext(pub CallContext);

#[async_trait]
impl FromRequestParts<AppState> for RequestContext {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        Ok(RequestContext(request_context(parts, state)))
    }
}

/// A validated bearer session.
pub struct AuthUser {
    pub user_id: Uuid,
    pub token: String,
}

impl fmt::Debug for AuthUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthUser")
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let auth = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .ok_or(AppError::MissingAuthHeader)?;

        // Expect "Bearer <token>"
        let token = auth
            .strip_prefix("Bearer ")
            .or_else(|| auth.strip_prefix("bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(AppError::InvalidAuthFormat)?
            .to_string();

        let ctx = request_context(parts, state);
        let record = state.sessions.validate(&ctx, &token).await?;
        Ok(AuthUser {
            user_id: record.user_id,
            token,
        })
    }
}
