use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use tracing::{info, instrument};

use super::dto::{
    AcceptedResponse, DeletionScheduledResponse, LoginRequest, NewPasswordRequest,
    PasswordResetRequest, PublicUser, RegisterRequest, SessionResponse, VerificationRequest,
};
use super::extractors::{AuthUser, RequestContext};
use crate::error::AppError;
use crate::state::AppState;

const ACCEPTED: AcceptedResponse = AcceptedResponse {
    message: "if the address is known, an email is on its way",
};

#[instrument(skip_all)]
pub async fn register(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    Json(payload): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<SessionResponse>), AppError> {
    let payload = payload.validated()?;
    let user = state
        .accounts
        .register(&ctx, &payload.name, &payload.email, &payload.password)
        .await?;
    let token = state.sessions.create_for_user(&ctx, user.id).await?;

    Ok((
        StatusCode::CREATED,
        Json(SessionResponse {
            token: token.raw,
            expires_at: token.record.expires_at,
            user: user.into(),
        }),
    ))
}

#[instrument(skip_all)]
pub async fn login(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<SessionResponse>, AppError> {
    let payload = payload.validated()?;
    let (user, token) = state
        .sessions
        .login(&ctx, &payload.email, &payload.password)
        .await?;

    Ok(Json(SessionResponse {
        token: token.raw,
        expires_at: token.record.expires_at,
        user: user.into(),
    }))
}

#[instrument(skip_all, fields(user_id = %auth.user_id))]
pub async fn logout(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    auth: AuthUser,
) -> Result<StatusCode, AppError> {
    let ctx = ctx.with_user_id(auth.user_id);
    state.sessions.logout(&ctx, &auth.token).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip_all, fields(user_id = %auth.user_id))]
pub async fn get_me(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    auth: AuthUser,
) -> Result<Json<PublicUser>, AppError> {
    let ctx = ctx.with_user_id(auth.user_id);
    let user = state.accounts.get(&ctx, auth.user_id).await?;
    Ok(Json(user.into()))
}

#[instrument(skip_all, fields(user_id = %auth.user_id))]
pub async fn schedule_deletion(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    auth: AuthUser,
) -> Result<(StatusCode, Json<DeletionScheduledResponse>), AppError> {
    let ctx = ctx.with_user_id(auth.user_id);
    let scheduled_at = state.accounts.schedule_deletion(&ctx, auth.user_id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(DeletionScheduledResponse { scheduled_at }),
    ))
}

#[instrument(skip_all)]
pub async fn request_password_reset(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    Json(payload): Json<PasswordResetRequest>,
) -> Result<(StatusCode, Json<AcceptedResponse>), AppError> {
    let payload = payload.validated()?;
    state.password_resets.request_reset(&ctx, &payload.email).await?;
    Ok((StatusCode::ACCEPTED, Json(ACCEPTED)))
}

#[instrument(skip_all)]
pub async fn execute_password_reset(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    Path(token): Path<String>,
    Json(payload): Json<NewPasswordRequest>,
) -> Result<StatusCode, AppError> {
    let payload = payload.validated()?;
    state
        .password_resets
        .execute_reset(&ctx, &token, &payload.password)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Authenticated callers get a fresh link for their own account. Anonymous
/// callers name an address and always get 202.
#[instrument(skip_all)]
pub async fn send_verification(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    auth: Option<AuthUser>,
    body: Option<Json<VerificationRequest>>,
) -> Result<(StatusCode, Json<AcceptedResponse>), AppError> {
    match auth {
        Some(auth) => {
            let ctx = ctx.with_user_id(auth.user_id);
            state.email_verifications.send(&ctx, auth.user_id).await?;
        }
        None => {
            let email = body
                .and_then(|Json(b)| b.email)
                .ok_or_else(|| AppError::Validation("email is required".into()))?;
            let email = PasswordResetRequest { email }.validated()?.email;
            state.email_verifications.resend(&ctx, &email).await?;
        }
    }
    Ok((StatusCode::ACCEPTED, Json(ACCEPTED)))
}

#[instrument(skip_all)]
pub async fn verify_email(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    Path(token): Path<String>,
) -> Result<StatusCode, AppError> {
    state.email_verifications.verify(&ctx, &token).await?;
    info!("email verification accepted");
    Ok(StatusCode::NO_CONTENT)
}
