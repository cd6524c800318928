use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::tokens::{self, ensure_redeemable, TOKEN_BYTES};
use crate::context::CallContext;
use crate::db::{tx::TxManager, SingleUseTokens, Stores, User, UserStore};
use crate::error::AppError;
use crate::tasks::email::{EmailPayload, TEMPLATE_EMAIL_VERIFICATION, TYPE_EMAIL_SEND};
use crate::tasks::TaskDispatcher;

pub struct EmailVerificationService {
    users: Arc<dyn UserStore>,
    verifications: SingleUseTokens,
    tx: TxManager,
    dispatcher: TaskDispatcher,
    ttl: Duration,
    base_url: String,
}

impl EmailVerificationService {
    pub fn new(
        stores: &Stores,
        tx: TxManager,
        dispatcher: TaskDispatcher,
        ttl: Duration,
        base_url: String,
    ) -> Self {
        Self {
            users: stores.users.clone(),
            verifications: stores.email_verifications.clone(),
            tx,
            dispatcher,
            ttl,
            base_url,
        }
    }

    /// Replaces any outstanding verification token with a new one and mails it.
    #[instrument(skip_all, fields(request_id = ?ctx.request_id(), user_id = %user_id))]
    pub async fn send(&self, ctx: &CallContext, user_id: Uuid) -> Result<(), AppError> {
        let user = ctx
            .bounded(self.users.get_by_id(user_id))
            .await?
            .ok_or(AppError::UserNotFound)?;
        self.send_to(ctx, user).await
    }

    /// Silently succeeds for unknown or already verified addresses.
    #[instrument(skip_all, fields(request_id = ?ctx.request_id()))]
    pub async fn resend(&self, ctx: &CallContext, email: &str) -> Result<(), AppError> {
        match ctx.bounded(self.users.get_by_email(email)).await? {
            Some(user) if !user.is_email_verified() => self.send_to(ctx, user).await,
            _ => {
                debug!("verification resend skipped");
                Ok(())
            }
        }
    }

    async fn send_to(&self, ctx: &CallContext, user: User) -> Result<(), AppError> {
        if user.is_email_verified() {
            return Err(AppError::EmailAlreadyVerified);
        }

        let raw = tokens::generate(TOKEN_BYTES)?;
        let token_hash = tokens::hash(&raw);
        let expires_at = OffsetDateTime::now_utc() + self.ttl;
        let user_id = user.id;
        self.tx
            .run(ctx, move |s| {
                Box::pin(async move {
                    s.email_verifications.invalidate_all_for_user(user_id).await?;
                    s.email_verifications
                        .create(user_id, &token_hash, expires_at)
                        .await?;
                    Ok(())
                })
            })
            .await?;

        let payload = EmailPayload::new(
            &user.email,
            "Verify your email address",
            TEMPLATE_EMAIL_VERIFICATION,
        )
        .with("name", user.name.clone())
        .with("verification_link", format!("{}/verify-email?token={raw}", self.base_url))
        .with("expires_hours", self.ttl.as_secs() / 3600);
        let ctx = ctx.clone().with_user_id(user.id);
        self.dispatcher.dispatch(&ctx, TYPE_EMAIL_SEND, &payload).await;

        info!(user_id = %user.id, "verification email queued");
        Ok(())
    }

    #[instrument(skip_all, fields(request_id = ?ctx.request_id()))]
    pub async fn verify(&self, ctx: &CallContext, raw: &str) -> Result<(), AppError> {
        let found = ctx
            .bounded(self.verifications.get_by_hash(&tokens::hash(raw)))
            .await?;
        let record = ensure_redeemable(
            found,
            AppError::InvalidVerificationToken,
            OffsetDateTime::now_utc(),
        )?;
        let (user_id, token_id) = (record.user_id, record.id);

        self.tx
            .run(ctx, move |s| {
                Box::pin(async move {
                    if !s.email_verifications.mark_used(token_id).await? {
                        return Err(AppError::TokenAlreadyUsed);
                    }
                    s.users.mark_email_verified(user_id).await?;
                    s.email_verifications.invalidate_all_for_user(user_id).await?;
                    Ok(())
                })
            })
            .await?;

        info!(user_id = %user_id, "email verified");
        Ok(())
    }
}
