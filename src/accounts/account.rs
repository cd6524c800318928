use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::password::Passwords;
use crate::context::CallContext;
use crate::db::{tx::TxManager, Stores, UniqueViolation, User, UserStore};
use crate::error::AppError;
use crate::tasks::email::{EmailPayload, TEMPLATE_ACCOUNT_DELETION, TYPE_EMAIL_SEND};
use crate::tasks::TaskDispatcher;

const DAY_SECS: u64 = 24 * 60 * 60;

/// Registration, profile lookup and the timed deletion workflow.
pub struct AccountService {
    users: Arc<dyn UserStore>,
    tx: TxManager,
    dispatcher: TaskDispatcher,
    passwords: Passwords,
    deletion_grace: Duration,
}

impl AccountService {
    pub fn new(
        stores: &Stores,
        tx: TxManager,
        dispatcher: TaskDispatcher,
        passwords: Passwords,
        deletion_grace: Duration,
    ) -> Self {
        Self {
            users: stores.users.clone(),
            tx,
            dispatcher,
            passwords,
            deletion_grace,
        }
    }

    #[instrument(skip_all, fields(request_id = ?ctx.request_id()))]
    pub async fn register(
        &self,
        ctx: &CallContext,
        name: &str,
        email: &str,
        password: &str,
    ) -> Result<User, AppError> {
        if ctx.bounded(self.users.email_exists(email)).await? {
            warn!("registration with taken email");
            return Err(AppError::EmailAlreadyExists);
        }

        let hash = self.passwords.hash(password.to_string()).await?;
        let user = match ctx.within(self.users.create(name, email, &hash)).await? {
            Ok(user) => user,
            Err(e) if e.downcast_ref::<UniqueViolation>().is_some() => {
                warn!("registration lost race on unique email");
                return Err(AppError::EmailAlreadyExists);
            }
            Err(e) => return Err(e.into()),
        };

        info!(user_id = %user.id, "user registered");
        Ok(user)
    }

    pub async fn get(&self, ctx: &CallContext, user_id: Uuid) -> Result<User, AppError> {
        ctx.bounded(self.users.get_by_id(user_id))
            .await?
            .ok_or(AppError::UserNotFound)
    }

    /// Sets the purge deadline and signs the user out everywhere. Logging in
    /// before the deadline cancels it.
    ///
    /// The deadline is written with a conditional update, so of two concurrent
    /// calls only one schedules and the other gets `DeletionAlreadyScheduled`.
    #[instrument(skip_all, fields(request_id = ?ctx.request_id(), user_id = %user_id))]
    pub async fn schedule_deletion(
        &self,
        ctx: &CallContext,
        user_id: Uuid,
    ) -> Result<OffsetDateTime, AppError> {
        let grace = self.deletion_grace;
        let (user, scheduled_at, revoked) = self
            .tx
            .run(ctx, move |s| {
                Box::pin(async move {
                    let user = s
                        .users
                        .get_by_id(user_id)
                        .await?
                        .ok_or(AppError::UserNotFound)?;
                    let at = OffsetDateTime::now_utc() + grace;
                    if !s.users.schedule_deletion(user_id, at).await? {
                        return Err(AppError::DeletionAlreadyScheduled);
                    }
                    let revoked = s.sessions.revoke_all_for_user(user_id).await?;
                    Ok((user, at, revoked))
                })
            })
            .await?;

        let payload = EmailPayload::new(
            &user.email,
            "Your account is scheduled for deletion",
            TEMPLATE_ACCOUNT_DELETION,
        )
        .with("name", user.name.clone())
        .with("scheduled_at", scheduled_at.date().to_string())
        .with("days_left", grace.as_secs() / DAY_SECS);
        let ctx = ctx.clone().with_user_id(user_id);
        self.dispatcher.dispatch(&ctx, TYPE_EMAIL_SEND, &payload).await;

        info!(%scheduled_at, sessions_revoked = revoked, "account deletion scheduled");
        Ok(scheduled_at)
    }
}
