use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

#[cfg(test)]
pub mod memory;
pub mod postgres;
pub mod tx;

/// Account record.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,                          // argon2 PHC string, never exposed
    pub email_verified_at: Option<OffsetDateTime>,
    pub deletion_scheduled_at: Option<OffsetDateTime>,  // purge deadline, cleared by login
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl User {
    pub fn is_email_verified(&self) -> bool {
        self.email_verified_at.is_some()
    }
}

/// The three persisted token kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Session,
    PasswordReset,
    EmailVerification,
}

impl TokenKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TokenKind::Session => "session",
            TokenKind::PasswordReset => "password_reset",
            TokenKind::EmailVerification => "email_verification",
        }
    }

    pub(crate) fn table(self) -> &'static str {
        match self {
            TokenKind::Session => "auth_tokens",
            TokenKind::PasswordReset => "password_resets",
            TokenKind::EmailVerification => "email_verifications",
        }
    }

    /// Column holding the terminal lifecycle timestamp.
    pub(crate) fn marker_column(self) -> &'static str {
        match self {
            TokenKind::Session => "revoked_at",
            TokenKind::PasswordReset | TokenKind::EmailVerification => "used_at",
        }
    }
}

/// Stored form of any token kind. Only the hash of the secret is kept.
#[derive(Debug, Clone, FromRow)]
pub struct TokenRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    // Row columns the services never read back; the in-memory store matches on them.
    #[allow(dead_code)]
    pub token_hash: String,
    pub expires_at: OffsetDateTime,
    /// `revoked_at` for sessions, `used_at` for single-use kinds.
    pub consumed_at: Option<OffsetDateTime>,
    #[allow(dead_code)]
    pub created_at: OffsetDateTime,
}

impl TokenRecord {
    pub fn is_consumed(&self) -> bool {
        self.consumed_at.is_some()
    }

    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        self.expires_at <= now
    }
}

/// Returned (inside `anyhow::Error`) when an insert hits a unique constraint.
#[derive(Debug, Error)]
#[error("unique constraint violated: {0}")]
pub struct UniqueViolation(pub &'static str);

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn create(&self, name: &str, email: &str, password_hash: &str) -> anyhow::Result<User>;
    async fn get_by_id(&self, id: Uuid) -> anyhow::Result<Option<User>>;
    async fn get_by_email(&self, email: &str) -> anyhow::Result<Option<User>>;
    async fn update_password_hash(&self, id: Uuid, password_hash: &str) -> anyhow::Result<()>;
    async fn mark_email_verified(&self, id: Uuid) -> anyhow::Result<()>;
    async fn email_exists(&self, email: &str) -> anyhow::Result<bool>;
    /// Sets the deadline only when none is pending. Returns whether it was set.
    async fn schedule_deletion(&self, id: Uuid, at: OffsetDateTime) -> anyhow::Result<bool>;
    async fn cancel_deletion(&self, id: Uuid) -> anyhow::Result<()>;
    /// Hard-deletes every account whose deletion deadline has passed.
    async fn purge_overdue(&self) -> anyhow::Result<u64>;
}

/// Persistence for one token kind.
///
/// "Consume" means revoke for sessions and mark used for single-use kinds.
/// The conditional variants only touch rows that are not consumed yet and
/// report whether anything changed.
#[async_trait]
pub trait TokenStore: Send + Sync {
    fn kind(&self) -> TokenKind;
    async fn create(
        &self,
        user_id: Uuid,
        token_hash: &str,
        expires_at: OffsetDateTime,
    ) -> anyhow::Result<TokenRecord>;
    async fn get_by_hash(&self, token_hash: &str) -> anyhow::Result<Option<TokenRecord>>;
    async fn consume(&self, id: Uuid) -> anyhow::Result<bool>;
    async fn consume_by_hash(&self, token_hash: &str) -> anyhow::Result<bool>;
    async fn consume_all_for_user(&self, user_id: Uuid) -> anyhow::Result<u64>;
    async fn purge_expired_or_consumed(&self) -> anyhow::Result<u64>;
}

/// Session tokens: revocable, many per user.
#[derive(Clone)]
pub struct SessionTokens(Arc<dyn TokenStore>);

impl SessionTokens {
    pub fn new(store: Arc<dyn TokenStore>) -> Self {
        debug_assert_eq!(store.kind(), TokenKind::Session);
        Self(store)
    }

    pub async fn create(
        &self,
        user_id: Uuid,
        token_hash: &str,
        expires_at: OffsetDateTime,
    ) -> anyhow::Result<TokenRecord> {
        self.0.create(user_id, token_hash, expires_at).await
    }

    pub async fn get_by_hash(&self, token_hash: &str) -> anyhow::Result<Option<TokenRecord>> {
        self.0.get_by_hash(token_hash).await
    }

    #[cfg(test)]
    pub async fn revoke(&self, id: Uuid) -> anyhow::Result<bool> {
        self.0.consume(id).await
    }

    pub async fn revoke_by_hash(&self, token_hash: &str) -> anyhow::Result<bool> {
        self.0.consume_by_hash(token_hash).await
    }

    pub async fn revoke_all_for_user(&self, user_id: Uuid) -> anyhow::Result<u64> {
        self.0.consume_all_for_user(user_id).await
    }

    pub async fn purge_expired_or_revoked(&self) -> anyhow::Result<u64> {
        self.0.purge_expired_or_consumed().await
    }
}

/// Password-reset and email-verification tokens: consumed at most once.
#[derive(Clone)]
pub struct SingleUseTokens(Arc<dyn TokenStore>);

impl SingleUseTokens {
    pub fn new(store: Arc<dyn TokenStore>) -> Self {
        debug_assert_ne!(store.kind(), TokenKind::Session);
        Self(store)
    }

    pub async fn create(
        &self,
        user_id: Uuid,
        token_hash: &str,
        expires_at: OffsetDateTime,
    ) -> anyhow::Result<TokenRecord> {
        self.0.create(user_id, token_hash, expires_at).await
    }

    pub async fn get_by_hash(&self, token_hash: &str) -> anyhow::Result<Option<TokenRecord>> {
        self.0.get_by_hash(token_hash).await
    }

    /// Returns false when the token was already used.
    pub async fn mark_used(&self, id: Uuid) -> anyhow::Result<bool> {
        self.0.consume(id).await
    }

    pub async fn invalidate_all_for_user(&self, user_id: Uuid) -> anyhow::Result<u64> {
        self.0.consume_all_for_user(user_id).await
    }

    pub async fn purge_expired_or_used(&self) -> anyhow::Result<u64> {
        self.0.purge_expired_or_consumed().await
    }
}

/// One handle per store, either pool-backed or bound to a transaction.
#[derive(Clone)]
pub struct Stores {
    pub users: Arc<dyn UserStore>,
    pub sessions: SessionTokens,
    pub password_resets: SingleUseTokens,
    pub email_verifications: SingleUseTokens,
}

#[async_trait]
pub trait Database: Send + Sync {
    /// Stores that run each statement on their own.
    fn stores(&self) -> Stores;
    async fn begin(&self) -> anyhow::Result<Box<dyn Transaction>>;
}

#[async_trait]
pub trait Transaction: Send + Sync {
    /// Stores bound to this transaction.
    fn stores(&self) -> &Stores;
    async fn commit(self: Box<Self>) -> anyhow::Result<()>;
    async fn rollback(self: Box<Self>) -> anyhow::Result<()>;
}
