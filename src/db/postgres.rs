use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use sqlx::{
    postgres::{PgArguments, PgRow},
    query::{Query, QueryAs},
    FromRow, PgPool, Postgres,
};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    Database, SessionTokens, SingleUseTokens, Stores, TokenKind, TokenRecord, TokenStore,
    Transaction, UniqueViolation, User, UserStore,
};

const USER_COLUMNS: &str = "id, name, email, password_hash, email_verified_at, \
                            deletion_scheduled_at, created_at, updated_at";

type SharedTx = Arc<Mutex<Option<sqlx::Transaction<'static, Postgres>>>>;

/// Where a store sends its statements.
#[derive(Clone)]
enum PgConn {
    Pool(PgPool),
    Tx(SharedTx),
}

impl PgConn {
    async fn fetch_optional<O>(
        &self,
        query: QueryAs<'_, Postgres, O, PgArguments>,
    ) -> sqlx::Result<Option<O>>
    where
        O: for<'r> FromRow<'r, PgRow> + Send + Unpin + 'static,
    {
        match self {
            PgConn::Pool(pool) => query.fetch_optional(pool).await,
            PgConn::Tx(tx) => {
                let mut guard = tx.lock().await;
                let conn = guard.as_mut().ok_or_else(finished)?;
                query.fetch_optional(&mut **conn).await
            }
        }
    }

    async fn fetch_one<O>(&self, query: QueryAs<'_, Postgres, O, PgArguments>) -> sqlx::Result<O>
    where
        O: for<'r> FromRow<'r, PgRow> + Send + Unpin + 'static,
    {
        match self {
            PgConn::Pool(pool) => query.fetch_one(pool).await,
            PgConn::Tx(tx) => {
                let mut guard = tx.lock().await;
                let conn = guard.as_mut().ok_or_else(finished)?;
                query.fetch_one(&mut **conn).await
            }
        }
    }

    async fn execute(&self, query: Query<'_, Postgres, PgArguments>) -> sqlx::Result<u64> {
        let result = match self {
            PgConn::Pool(pool) => query.execute(pool).await?,
            PgConn::Tx(tx) => {
                let mut guard = tx.lock().await;
                let conn = guard.as_mut().ok_or_else(finished)?;
                query.execute(&mut **conn).await?
            }
        };
        Ok(result.rows_affected())
    }
}

fn finished() -> sqlx::Error {
    sqlx::Error::Protocol("transaction already finished".into())
}

fn stores_on(conn: PgConn) -> Stores {
    let tokens = |kind| PgTokenStore {
        kind,
        conn: conn.clone(),
    };
    Stores {
        users: Arc::new(PgUserStore { conn: conn.clone() }),
        sessions: SessionTokens::new(Arc::new(tokens(TokenKind::Session))),
        password_resets: SingleUseTokens::new(Arc::new(tokens(TokenKind::PasswordReset))),
        email_verifications: SingleUseTokens::new(Arc::new(tokens(TokenKind::EmailVerification))),
    }
}

/// Postgres-backed [`Database`].
#[derive(Clone)]
pub struct PgDatabase {
    pool: PgPool,
}

impl PgDatabase {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Database for PgDatabase {
    fn stores(&self) -> Stores {
        stores_on(PgConn::Pool(self.pool.clone()))
    }

    async fn begin(&self) -> anyhow::Result<Box<dyn Transaction>> {
        let tx = self.pool.begin().await.context("begin tx")?;
        let shared: SharedTx = Arc::new(Mutex::new(Some(tx)));
        Ok(Box::new(PgTransaction {
            stores: stores_on(PgConn::Tx(shared.clone())),
            inner: shared,
        }))
    }
}

struct PgTransaction {
    inner: SharedTx,
    stores: Stores,
}

#[async_trait]
impl Transaction for PgTransaction {
    fn stores(&self) -> &Stores {
        &self.stores
    }

    async fn commit(self: Box<Self>) -> anyhow::Result<()> {
        let tx = self.inner.lock().await.take().context("transaction already finished")?;
        tx.commit().await.context("commit tx")
    }

    async fn rollback(self: Box<Self>) -> anyhow::Result<()> {
        let tx = self.inner.lock().await.take().context("transaction already finished")?;
        tx.rollback().await.context("rollback tx")
    }
}

struct PgUserStore {
    conn: PgConn,
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn create(&self, name: &str, email: &str, password_hash: &str) -> anyhow::Result<User> {
        let sql = format!(
            "INSERT INTO users (id, name, email, password_hash) VALUES ($1, $2, $3, $4) \
             RETURNING {USER_COLUMNS}"
        );
        let query = sqlx::query_as::<_, User>(&sql)
            .bind(Uuid::new_v4())
            .bind(name)
            .bind(email)
            .bind(password_hash);
        match self.conn.fetch_one(query).await {
            Ok(user) => Ok(user),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(UniqueViolation("users.email").into())
            }
            Err(e) => Err(anyhow::Error::new(e).context("insert user")),
        }
    }

    async fn get_by_id(&self, id: Uuid) -> anyhow::Result<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        let query = sqlx::query_as::<_, User>(&sql).bind(id);
        self.conn.fetch_optional(query).await.context("get user by id")
    }

    async fn get_by_email(&self, email: &str) -> anyhow::Result<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE email = $1");
        let query = sqlx::query_as::<_, User>(&sql).bind(email);
        self.conn.fetch_optional(query).await.context("get user by email")
    }

    async fn update_password_hash(&self, id: Uuid, password_hash: &str) -> anyhow::Result<()> {
        let query = sqlx::query(
            r#"
            UPDATE users SET password_hash = $2, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(password_hash);
        self.conn.execute(query).await.context("update password hash")?;
        Ok(())
    }

    async fn mark_email_verified(&self, id: Uuid) -> anyhow::Result<()> {
        let query = sqlx::query(
            r#"
            UPDATE users SET email_verified_at = now(), updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id);
        self.conn.execute(query).await.context("mark email verified")?;
        Ok(())
    }

    async fn email_exists(&self, email: &str) -> anyhow::Result<bool> {
        let query = sqlx::query_as::<_, (bool,)>(
            "SELECT EXISTS (SELECT 1 FROM users WHERE email = $1)",
        )
        .bind(email);
        let (exists,) = self.conn.fetch_one(query).await.context("check email exists")?;
        Ok(exists)
    }

    async fn schedule_deletion(&self, id: Uuid, at: OffsetDateTime) -> anyhow::Result<bool> {
        let query = sqlx::query(
            r#"
            UPDATE users SET deletion_scheduled_at = $2, updated_at = now()
            WHERE id = $1 AND deletion_scheduled_at IS NULL
            "#,
        )
        .bind(id)
        .bind(at);
        let affected = self.conn.execute(query).await.context("schedule deletion")?;
        Ok(affected > 0)
    }

    async fn cancel_deletion(&self, id: Uuid) -> anyhow::Result<()> {
        let query = sqlx::query(
            r#"
            UPDATE users SET deletion_scheduled_at = NULL, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id);
        self.conn.execute(query).await.context("cancel deletion")?;
        Ok(())
    }

    async fn purge_overdue(&self) -> anyhow::Result<u64> {
        let query = sqlx::query(
            r#"
            DELETE FROM users
            WHERE deletion_scheduled_at IS NOT NULL AND deletion_scheduled_at < $1
            "#,
        )
        .bind(OffsetDateTime::now_utc());
        self.conn.execute(query).await.context("purge overdue users")
    }
}

struct PgTokenStore {
    kind: TokenKind,
    conn: PgConn,
}

impl PgTokenStore {
    fn returning(&self) -> String {
        format!(
            "id, user_id, token_hash, expires_at, {} AS consumed_at, created_at",
            self.kind.marker_column()
        )
    }
}

#[async_trait]
impl TokenStore for PgTokenStore {
    fn kind(&self) -> TokenKind {
        self.kind
    }

    async fn create(
        &self,
        user_id: Uuid,
        token_hash: &str,
        expires_at: OffsetDateTime,
    ) -> anyhow::Result<TokenRecord> {
        let sql = format!(
            "INSERT INTO {} (id, user_id, token_hash, expires_at) VALUES ($1, $2, $3, $4) \
             RETURNING {}",
            self.kind.table(),
            self.returning()
        );
        let query = sqlx::query_as::<_, TokenRecord>(&sql)
            .bind(Uuid::new_v4())
            .bind(user_id)
            .bind(token_hash)
            .bind(expires_at);
        match self.conn.fetch_one(query).await {
            Ok(record) => Ok(record),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(UniqueViolation("token_hash").into())
            }
            Err(e) => Err(anyhow::Error::new(e).context(format!("insert {}", self.kind.as_str()))),
        }
    }

    async fn get_by_hash(&self, token_hash: &str) -> anyhow::Result<Option<TokenRecord>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE token_hash = $1",
            self.returning(),
            self.kind.table()
        );
        let query = sqlx::query_as::<_, TokenRecord>(&sql).bind(token_hash);
        self.conn
            .fetch_optional(query)
            .await
            .with_context(|| format!("get {} by hash", self.kind.as_str()))
    }

    async fn consume(&self, id: Uuid) -> anyhow::Result<bool> {
        let marker = self.kind.marker_column();
        let sql = format!(
            "UPDATE {} SET {marker} = now() WHERE id = $1 AND {marker} IS NULL",
            self.kind.table()
        );
        let affected = self
            .conn
            .execute(sqlx::query(&sql).bind(id))
            .await
            .with_context(|| format!("consume {}", self.kind.as_str()))?;
        Ok(affected > 0)
    }

    async fn consume_by_hash(&self, token_hash: &str) -> anyhow::Result<bool> {
        let marker = self.kind.marker_column();
        let sql = format!(
            "UPDATE {} SET {marker} = now() WHERE token_hash = $1 AND {marker} IS NULL",
            self.kind.table()
        );
        let affected = self
            .conn
            .execute(sqlx::query(&sql).bind(token_hash))
            .await
            .with_context(|| format!("consume {} by hash", self.kind.as_str()))?;
        Ok(affected > 0)
    }

    async fn consume_all_for_user(&self, user_id: Uuid) -> anyhow::Result<u64> {
        let marker = self.kind.marker_column();
        let sql = format!(
            "UPDATE {} SET {marker} = now() WHERE user_id = $1 AND {marker} IS NULL",
            self.kind.table()
        );
        self.conn
            .execute(sqlx::query(&sql).bind(user_id))
            .await
            .with_context(|| format!("consume all {} for user", self.kind.as_str()))
    }

    async fn purge_expired_or_consumed(&self) -> anyhow::Result<u64> {
        let sql = format!(
            "DELETE FROM {} WHERE expires_at <= $1 OR {} IS NOT NULL",
            self.kind.table(),
            self.kind.marker_column()
        );
        self.conn
            .execute(sqlx::query(&sql).bind(OffsetDateTime::now_utc()))
            .await
            .with_context(|| format!("purge {}", self.kind.as_str()))
    }
}
