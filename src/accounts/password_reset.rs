use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tracing::{debug, info, instrument};

use super::password::Passwords;
use super::tokens::{self, ensure_redeemable, TOKEN_BYTES};
use crate::context::CallContext;
use crate::db::{tx::TxManager, SingleUseTokens, Stores, UserStore};
use crate::error::AppError;
use crate::tasks::email::{EmailPayload, TEMPLATE_PASSWORD_RESET, TYPE_EMAIL_SEND};
use crate::tasks::TaskDispatcher;

pub struct PasswordResetService {
    users: Arc<dyn UserStore>,
    resets: SingleUseTokens,
    tx: TxManager,
    dispatcher: TaskDispatcher,
    passwords: Passwords,
    ttl: Duration,
    base_url: String,
}

impl PasswordResetService {
    pub fn new(
        stores: &Stores,
        tx: TxManager,
        dispatcher: TaskDispatcher,
        passwords: Passwords,
        ttl: Duration,
        base_url: String,
    ) -> Self {
        Self {
            users: stores.users.clone(),
            resets: stores.password_resets.clone(),
            tx,
            dispatcher,
            passwords,
            ttl,
            base_url,
        }
    }

    /// Succeeds whether or not the email belongs to an account.
    #[instrument(skip_all, fields(request_id = ?ctx.request_id()))]
    pub async fn request_reset(&self, ctx: &CallContext, email: &str) -> Result<(), AppError> {
        let Some(user) = ctx.bounded(self.users.get_by_email(email)).await? else {
            debug!("password reset requested for unknown email");
            return Ok(());
        };

        let raw = tokens::generate(TOKEN_BYTES)?;
        let expires_at = OffsetDateTime::now_utc() + self.ttl;
        ctx.bounded(self.resets.create(user.id, &tokens::hash(&raw), expires_at))
            .await?;

        let payload = EmailPayload::new(&user.email, "Reset your password", TEMPLATE_PASSWORD_RESET)
            .with("name", user.name.clone())
            .with("reset_link", format!("{}/reset-password?token={raw}", self.base_url))
            .with("expires_minutes", self.ttl.as_secs() / 60);
        let ctx = ctx.clone().with_user_id(user.id);
        self.dispatcher.dispatch(&ctx, TYPE_EMAIL_SEND, &payload).await;

        info!(user_id = %user.id, "password reset requested");
        Ok(())
    }

    /// Sets the new password, burns every reset token of the user and
    /// revokes all their sessions, atomically.
    #[instrument(skip_all, fields(request_id = ?ctx.request_id()))]
    pub async fn execute_reset(
        &self,
        ctx: &CallContext,
        raw: &str,
        new_password: &str,
    ) -> Result<(), AppError> {
        let found = ctx
            .bounded(self.resets.get_by_hash(&tokens::hash(raw)))
            .await?;
        let record = ensure_redeemable(found, AppError::InvalidResetToken, OffsetDateTime::now_utc())?;

        let new_hash = self.passwords.hash(new_password.to_string()).await?;
        let (user_id, token_id) = (record.user_id, record.id);

        let revoked = self
            .tx
            .run(ctx, move |s| {
                Box::pin(async move {
                    if !s.password_resets.mark_used(token_id).await? {
                        return Err(AppError::TokenAlreadyUsed);
                    }
                    s.users.update_password_hash(user_id, &new_hash).await?;
                    s.password_resets.invalidate_all_for_user(user_id).await?;
                    Ok(s.sessions.revoke_all_for_user(user_id).await?)
                })
            })
            .await?;

        info!(user_id = %user_id, sessions_revoked = revoked, "password reset completed");
        Ok(())
    }
}
