//! In-memory [`Database`] for tests.
//!
//! Unbound stores write straight to the shared state. A transaction works on
//! a private copy and records every write as a replayable op; commit replays
//! the journal onto the shared state, rollback drops it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    Database, SessionTokens, SingleUseTokens, Stores, TokenKind, TokenRecord, TokenStore,
    Transaction, UniqueViolation, User, UserStore,
};

#[derive(Clone, Default)]
struct MemState {
    users: HashMap<Uuid, User>,
    tokens: HashMap<TokenKind, HashMap<Uuid, TokenRecord>>,
}

impl MemState {
    fn tokens_mut(&mut self, kind: TokenKind) -> &mut HashMap<Uuid, TokenRecord> {
        self.tokens.entry(kind).or_default()
    }

    fn token_iter(&self, kind: TokenKind) -> impl Iterator<Item = &TokenRecord> {
        self.tokens.get(&kind).into_iter().flat_map(|m| m.values())
    }
}

type Op = Box<dyn Fn(&mut MemState) + Send + Sync>;

struct TxState {
    working: MemState,
    journal: Vec<Op>,
}

#[derive(Clone)]
enum Target {
    Direct(Arc<Mutex<MemState>>),
    Tx(Arc<Mutex<TxState>>),
}

#[derive(Clone)]
struct Shared {
    target: Target,
    faults: Arc<Mutex<HashSet<String>>>,
}

impl Shared {
    fn check(&self, op: &str) -> anyhow::Result<()> {
        if self.faults.lock().unwrap().contains(op) {
            anyhow::bail!("injected failure: {op}");
        }
        Ok(())
    }

    fn read<R>(&self, f: impl FnOnce(&MemState) -> R) -> R {
        match &self.target {
            Target::Direct(state) => f(&*state.lock().unwrap()),
            Target::Tx(tx) => f(&tx.lock().unwrap().working),
        }
    }

    fn write<R>(&self, op: impl Fn(&mut MemState) -> R + Send + Sync + 'static) -> R {
        match &self.target {
            Target::Direct(state) => op(&mut *state.lock().unwrap()),
            Target::Tx(tx) => {
                let mut tx = tx.lock().unwrap();
                let out = op(&mut tx.working);
                tx.journal.push(Box::new(move |s| {
                    let _ = op(s);
                }));
                out
            }
        }
    }

    fn stores(&self) -> Stores {
        let tokens = |kind| {
            Arc::new(MemTokenStore {
                kind,
                shared: self.clone(),
            })
        };
        Stores {
            users: Arc::new(MemUserStore {
                shared: self.clone(),
            }),
            sessions: SessionTokens::new(tokens(TokenKind::Session)),
            password_resets: SingleUseTokens::new(tokens(TokenKind::PasswordReset)),
            email_verifications: SingleUseTokens::new(tokens(TokenKind::EmailVerification)),
        }
    }
}

/// Shared in-memory state plus fault injection switches.
#[derive(Clone, Default)]
pub struct MemoryDatabase {
    state: Arc<Mutex<MemState>>,
    faults: Arc<Mutex<HashSet<String>>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call of `op` (e.g. `"users.update_password_hash"`) fail.
    pub fn fail_on(&self, op: &str) {
        self.faults.lock().unwrap().insert(op.to_string());
    }

    pub fn clear_faults(&self) {
        self.faults.lock().unwrap().clear();
    }

    pub fn user(&self, id: Uuid) -> Option<User> {
        self.state.lock().unwrap().users.get(&id).cloned()
    }

    pub fn tokens_for(&self, kind: TokenKind, user_id: Uuid) -> Vec<TokenRecord> {
        let state = self.state.lock().unwrap();
        let mut out: Vec<_> = state
            .token_iter(kind)
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        out.sort_by_key(|t| t.created_at);
        out
    }

    pub fn token_count(&self, kind: TokenKind) -> usize {
        self.state.lock().unwrap().token_iter(kind).count()
    }

    fn shared(&self) -> Shared {
        Shared {
            target: Target::Direct(self.state.clone()),
            faults: self.faults.clone(),
        }
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    fn stores(&self) -> Stores {
        self.shared().stores()
    }

    async fn begin(&self) -> anyhow::Result<Box<dyn Transaction>> {
        self.shared().check("tx.begin")?;
        let working = self.state.lock().unwrap().clone();
        let shared = Shared {
            target: Target::Tx(Arc::new(Mutex::new(TxState {
                working,
                journal: Vec::new(),
            }))),
            faults: self.faults.clone(),
        };
        Ok(Box::new(MemTransaction {
            stores: shared.stores(),
            shared,
            base: self.state.clone(),
        }))
    }
}

struct MemTransaction {
    stores: Stores,
    shared: Shared,
    base: Arc<Mutex<MemState>>,
}

#[async_trait]
impl Transaction for MemTransaction {
    fn stores(&self) -> &Stores {
        &self.stores
    }

    async fn commit(self: Box<Self>) -> anyhow::Result<()> {
        self.shared.check("tx.commit")?;
        let Target::Tx(tx) = &self.shared.target else {
            anyhow::bail!("not a transaction");
        };
        let journal = std::mem::take(&mut tx.lock().unwrap().journal);
        let mut base = self.base.lock().unwrap();
        for op in &journal {
            op(&mut *base);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> anyhow::Result<()> {
        self.shared.check("tx.rollback")?;
        Ok(())
    }
}

struct MemUserStore {
    shared: Shared,
}

#[async_trait]
impl UserStore for MemUserStore {
    async fn create(&self, name: &str, email: &str, password_hash: &str) -> anyhow::Result<User> {
        self.shared.check("users.create")?;
        let now = OffsetDateTime::now_utc();
        let user = User {
            id: Uuid::new_v4(),
            name: name.to_string(),
            email: email.to_string(),
            password_hash: password_hash.to_string(),
            email_verified_at: None,
            deletion_scheduled_at: None,
            created_at: now,
            updated_at: now,
        };
        let record = user.clone();
        self.shared.write(move |s| {
            if s.users.values().any(|u| u.email == record.email) {
                return Err(UniqueViolation("users.email"));
            }
            s.users.insert(record.id, record.clone());
            Ok(())
        })?;
        Ok(user)
    }

    async fn get_by_id(&self, id: Uuid) -> anyhow::Result<Option<User>> {
        self.shared.check("users.get_by_id")?;
        Ok(self.shared.read(|s| s.users.get(&id).cloned()))
    }

    async fn get_by_email(&self, email: &str) -> anyhow::Result<Option<User>> {
        self.shared.check("users.get_by_email")?;
        Ok(self
            .shared
            .read(|s| s.users.values().find(|u| u.email == email).cloned()))
    }

    async fn update_password_hash(&self, id: Uuid, password_hash: &str) -> anyhow::Result<()> {
        self.shared.check("users.update_password_hash")?;
        let hash = password_hash.to_string();
        self.shared.write(move |s| {
            if let Some(u) = s.users.get_mut(&id) {
                u.password_hash = hash.clone();
                u.updated_at = OffsetDateTime::now_utc();
            }
        });
        Ok(())
    }

    async fn mark_email_verified(&self, id: Uuid) -> anyhow::Result<()> {
        self.shared.check("users.mark_email_verified")?;
        let now = OffsetDateTime::now_utc();
        self.shared.write(move |s| {
            if let Some(u) = s.users.get_mut(&id) {
                u.email_verified_at = Some(now);
                u.updated_at = now;
            }
        });
        Ok(())
    }

    async fn email_exists(&self, email: &str) -> anyhow::Result<bool> {
        self.shared.check("users.email_exists")?;
        Ok(self.shared.read(|s| s.users.values().any(|u| u.email == email)))
    }

    async fn schedule_deletion(&self, id: Uuid, at: OffsetDateTime) -> anyhow::Result<bool> {
        self.shared.check("users.schedule_deletion")?;
        Ok(self.shared.write(move |s| match s.users.get_mut(&id) {
            Some(u) if u.deletion_scheduled_at.is_none() => {
                u.deletion_scheduled_at = Some(at);
                true
            }
            _ => false,
        }))
    }

    async fn cancel_deletion(&self, id: Uuid) -> anyhow::Result<()> {
        self.shared.check("users.cancel_deletion")?;
        self.shared.write(move |s| {
            if let Some(u) = s.users.get_mut(&id) {
                u.deletion_scheduled_at = None;
            }
        });
        Ok(())
    }

    async fn purge_overdue(&self) -> anyhow::Result<u64> {
        self.shared.check("users.purge_overdue")?;
        let now = OffsetDateTime::now_utc();
        Ok(self.shared.write(move |s| {
            let overdue: Vec<Uuid> = s
                .users
                .values()
                .filter(|u| u.deletion_scheduled_at.is_some_and(|at| at < now))
                .map(|u| u.id)
                .collect();
            for id in &overdue {
                s.users.remove(id);
                for tokens in s.tokens.values_mut() {
                    tokens.retain(|_, t| t.user_id != *id);
                }
            }
            overdue.len() as u64
        }))
    }
}

struct MemTokenStore {
    kind: TokenKind,
    shared: Shared,
}

impl MemTokenStore {
    fn check(&self, op: &str) -> anyhow::Result<()> {
        self.shared.check(&format!("{}.{op}", self.kind.as_str()))
    }
}

#[async_trait]
impl TokenStore for MemTokenStore {
    fn kind(&self) -> TokenKind {
        self.kind
    }

    async fn create(
        &self,
        user_id: Uuid,
        token_hash: &str,
        expires_at: OffsetDateTime,
    ) -> anyhow::Result<TokenRecord> {
        self.check("create")?;
        let record = TokenRecord {
            id: Uuid::new_v4(),
            user_id,
            token_hash: token_hash.to_string(),
            expires_at,
            consumed_at: None,
            created_at: OffsetDateTime::now_utc(),
        };
        let kind = self.kind;
        let stored = record.clone();
        self.shared.write(move |s| {
            let tokens = s.tokens_mut(kind);
            if tokens.values().any(|t| t.token_hash == stored.token_hash) {
                return Err(UniqueViolation("token_hash"));
            }
            tokens.insert(stored.id, stored.clone());
            Ok(())
        })?;
        Ok(record)
    }

    async fn get_by_hash(&self, token_hash: &str) -> anyhow::Result<Option<TokenRecord>> {
        self.check("get_by_hash")?;
        Ok(self.shared.read(|s| {
            s.token_iter(self.kind)
                .find(|t| t.token_hash == token_hash)
                .cloned()
        }))
    }

    async fn consume(&self, id: Uuid) -> anyhow::Result<bool> {
        self.check("consume")?;
        let kind = self.kind;
        let now = OffsetDateTime::now_utc();
        Ok(self.shared.write(move |s| match s.tokens_mut(kind).get_mut(&id) {
            Some(t) if t.consumed_at.is_none() => {
                t.consumed_at = Some(now);
                true
            }
            _ => false,
        }))
    }

    async fn consume_by_hash(&self, token_hash: &str) -> anyhow::Result<bool> {
        self.check("consume_by_hash")?;
        let kind = self.kind;
        let hash = token_hash.to_string();
        let now = OffsetDateTime::now_utc();
        Ok(self.shared.write(move |s| {
            match s
                .tokens_mut(kind)
                .values_mut()
                .find(|t| t.token_hash == hash && t.consumed_at.is_none())
            {
                Some(t) => {
                    t.consumed_at = Some(now);
                    true
                }
                None => false,
            }
        }))
    }

    async fn consume_all_for_user(&self, user_id: Uuid) -> anyhow::Result<u64> {
        self.check("consume_all_for_user")?;
        let kind = self.kind;
        let now = OffsetDateTime::now_utc();
        Ok(self.shared.write(move |s| {
            let mut n = 0;
            for t in s.tokens_mut(kind).values_mut() {
                if t.user_id == user_id && t.consumed_at.is_none() {
                    t.consumed_at = Some(now);
                    n += 1;
                }
            }
            n
        }))
    }

    async fn purge_expired_or_consumed(&self) -> anyhow::Result<u64> {
        self.check("purge")?;
        let kind = self.kind;
        let now = OffsetDateTime::now_utc();
        Ok(self.shared.write(move |s| {
            let tokens = s.tokens_mut(kind);
            let before = tokens.len();
            tokens.retain(|_, t| t.consumed_at.is_none() && t.expires_at > now);
            (before - tokens.len()) as u64
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    #[tokio::test]
    async fn transaction_writes_are_invisible_until_commit() {
        let db = MemoryDatabase::new();
        let tx = db.begin().await.unwrap();
        let user = tx.stores().users.create("Ann", "ann@example.com", "h").await.unwrap();

        assert!(db.stores().users.get_by_id(user.id).await.unwrap().is_none());
        assert!(tx.stores().users.get_by_id(user.id).await.unwrap().is_some());

        tx.commit().await.unwrap();
        assert!(db.stores().users.get_by_id(user.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn rollback_discards_writes() {
        let db = MemoryDatabase::new();
        let user = db.stores().users.create("Bo", "bo@example.com", "h").await.unwrap();

        let tx = db.begin().await.unwrap();
        tx.stores().users.update_password_hash(user.id, "new").await.unwrap();
        tx.rollback().await.unwrap();

        assert_eq!(db.user(user.id).unwrap().password_hash, "h");
    }

    #[tokio::test]
    async fn duplicate_email_is_a_unique_violation() {
        let db = MemoryDatabase::new();
        db.stores().users.create("A", "a@example.com", "h").await.unwrap();
        let err = db.stores().users.create("A2", "a@example.com", "h").await.unwrap_err();
        assert!(err.downcast_ref::<UniqueViolation>().is_some());
    }

    #[tokio::test]
    async fn consume_is_conditional() {
        let db = MemoryDatabase::new();
        let stores = db.stores();
        let exp = OffsetDateTime::now_utc() + Duration::hours(1);
        let rec = stores.password_resets.create(Uuid::new_v4(), "hash", exp).await.unwrap();

        assert!(stores.password_resets.mark_used(rec.id).await.unwrap());
        assert!(!stores.password_resets.mark_used(rec.id).await.unwrap());
    }

    #[tokio::test]
    async fn schedule_deletion_only_sets_once() {
        let db = MemoryDatabase::new();
        let users = db.stores().users;
        let user = users.create("Cy", "cy@example.com", "h").await.unwrap();
        let first = OffsetDateTime::now_utc() + Duration::days(30);

        assert!(users.schedule_deletion(user.id, first).await.unwrap());
        assert!(!users
            .schedule_deletion(user.id, first + Duration::days(1))
            .await
            .unwrap());
        assert_eq!(db.user(user.id).unwrap().deletion_scheduled_at, Some(first));
        assert!(!users.schedule_deletion(Uuid::new_v4(), first).await.unwrap());
    }

    #[tokio::test]
    async fn faults_are_named_per_kind() {
        let db = MemoryDatabase::new();
        db.fail_on("session.purge");
        let stores = db.stores();
        assert!(stores.sessions.purge_expired_or_revoked().await.is_err());
        assert!(stores.password_resets.purge_expired_or_used().await.is_ok());
    }
}
