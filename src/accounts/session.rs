use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::password::Passwords;
use super::tokens::{self, IssuedToken, TOKEN_BYTES};
use crate::context::CallContext;
use crate::db::{tx::TxManager, SessionTokens, Stores, TokenRecord, User, UserStore};
use crate::error::AppError;

/// Login, logout and bearer token validation.
pub struct SessionService {
    users: Arc<dyn UserStore>,
    sessions: SessionTokens,
    tx: TxManager,
    passwords: Passwords,
    ttl: Duration,
}

impl SessionService {
    pub fn new(stores: &Stores, tx: TxManager, passwords: Passwords, ttl: Duration) -> Self {
        Self {
            users: stores.users.clone(),
            sessions: stores.sessions.clone(),
            tx,
            passwords,
            ttl,
        }
    }

    /// Unknown email, overdue account and wrong password all fail the same way.
    #[instrument(skip_all, fields(request_id = ?ctx.request_id()))]
    pub async fn login(
        &self,
        ctx: &CallContext,
        email: &str,
        password: &str,
    ) -> Result<(User, IssuedToken), AppError> {
        let now = OffsetDateTime::now_utc();
        let found = ctx.bounded(self.users.get_by_email(email)).await?;
        let Some(mut user) = found.filter(|u| !deletion_overdue(u, now)) else {
            self.passwords.verify_dummy(password.to_string()).await;
            warn!("login for unknown email");
            return Err(AppError::InvalidCredentials);
        };

        let ok = self
            .passwords
            .verify(password.to_string(), user.password_hash.clone())
            .await?;
        if !ok {
            warn!(user_id = %user.id, "login with wrong password");
            return Err(AppError::InvalidCredentials);
        }

        // Cancelling a pending deletion and issuing the session commit together.
        let cancel = user.deletion_scheduled_at.is_some();
        let raw = tokens::generate(TOKEN_BYTES)?;
        let token_hash = tokens::hash(&raw);
        let expires_at = OffsetDateTime::now_utc() + self.ttl;
        let user_id = user.id;
        let record = self
            .tx
            .run(ctx, move |s| {
                Box::pin(async move {
                    if cancel {
                        s.users.cancel_deletion(user_id).await?;
                    }
                    Ok(s.sessions.create(user_id, &token_hash, expires_at).await?)
                })
            })
            .await?;

        if cancel {
            user.deletion_scheduled_at = None;
            info!(user_id = %user.id, "pending account deletion cancelled by login");
        }
        info!(user_id = %user.id, token_id = %record.id, "user logged in");
        Ok((user, IssuedToken { raw, record }))
    }

    /// Issues a session without a password check, right after registration.
    pub async fn create_for_user(
        &self,
        ctx: &CallContext,
        user_id: Uuid,
    ) -> Result<IssuedToken, AppError> {
        self.issue(ctx, user_id).await
    }

    async fn issue(&self, ctx: &CallContext, user_id: Uuid) -> Result<IssuedToken, AppError> {
        let raw = tokens::generate(TOKEN_BYTES)?;
        let expires_at = OffsetDateTime::now_utc() + self.ttl;
        let record = ctx
            .bounded(self.sessions.create(user_id, &tokens::hash(&raw), expires_at))
            .await?;
        debug!(user_id = %user_id, token_id = %record.id, "session issued");
        Ok(IssuedToken { raw, record })
    }

    /// Idempotent: an unknown or already revoked token is not an error.
    #[instrument(skip_all, fields(request_id = ?ctx.request_id(), user_id = ?ctx.user_id()))]
    pub async fn logout(&self, ctx: &CallContext, raw: &str) -> Result<(), AppError> {
        let revoked = ctx
            .bounded(self.sessions.revoke_by_hash(&tokens::hash(raw)))
            .await?;
        info!(revoked, "logout");
        Ok(())
    }

    pub async fn validate(&self, ctx: &CallContext, raw: &str) -> Result<TokenRecord, AppError> {
        let record = ctx
            .bounded(self.sessions.get_by_hash(&tokens::hash(raw)))
            .await?
            .ok_or(AppError::InvalidToken)?;
        if record.is_consumed() {
            return Err(AppError::TokenRevoked);
        }
        if record.is_expired_at(OffsetDateTime::now_utc()) {
            return Err(AppError::TokenExpired);
        }
        Ok(record)
    }
}

fn deletion_overdue(user: &User, now: OffsetDateTime) -> bool {
    user.deletion_scheduled_at.is_some_and(|at| at <= now)
}
