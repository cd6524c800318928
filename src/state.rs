use std::sync::Arc;

use crate::accounts::{
    account::AccountService, email_verification::EmailVerificationService,
    password::Passwords, password_reset::PasswordResetService, session::SessionService,
};
use crate::config::AppConfig;
use crate::db::{tx::TxManager, Database};
use crate::reporting::ErrorReporter;
use crate::tasks::{cleanup::CleanupJob, TaskDispatcher, TaskOptions, TaskQueue};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub accounts: Arc<AccountService>,
    pub sessions: Arc<SessionService>,
    pub password_resets: Arc<PasswordResetService>,
    pub email_verifications: Arc<EmailVerificationService>,
    pub cleanup: CleanupJob,
}

impl AppState {
    /// Wires every service on top of the given backends.
    pub fn from_parts(
        config: Arc<AppConfig>,
        db: Arc<dyn Database>,
        queue: Arc<dyn TaskQueue>,
        reporter: Arc<dyn ErrorReporter>,
    ) -> anyhow::Result<Self> {
        let stores = db.stores();
        let passwords = Passwords::new(&config.auth.password)?;
        let tx = TxManager::new(db, reporter.clone());
        let dispatcher = TaskDispatcher::new(
            queue,
            reporter.clone(),
            TaskOptions::from(&config.worker),
        );
        let auth = &config.auth;

        Ok(Self {
            accounts: Arc::new(AccountService::new(
                &stores,
                tx.clone(),
                dispatcher.clone(),
                passwords.clone(),
                auth.deletion_grace,
            )),
            sessions: Arc::new(SessionService::new(
                &stores,
                tx.clone(),
                passwords.clone(),
                auth.session_ttl(),
            )),
            password_resets: Arc::new(PasswordResetService::new(
                &stores,
                tx.clone(),
                dispatcher.clone(),
                passwords,
                auth.password_reset_ttl,
                config.base_url.clone(),
            )),
            email_verifications: Arc::new(EmailVerificationService::new(
                &stores,
                tx,
                dispatcher,
                auth.email_verification_ttl,
                config.base_url.clone(),
            )),
            cleanup: CleanupJob::new(stores, reporter),
            config,
        })
    }

    /// State on in-memory backends, plus handles to inspect them.
    #[cfg(test)]
    pub fn fake() -> (Self, Fakes) {
        Self::fake_with(|_| {})
    }

    #[cfg(test)]
    pub fn fake_with(tweak: impl FnOnce(&mut AppConfig)) -> (Self, Fakes) {
        use crate::db::memory::MemoryDatabase;
        use crate::reporting::testing::CapturingReporter;
        use crate::tasks::testing::MemoryQueue;

        let mut config = crate::config::test_config();
        tweak(&mut config);
        let config = Arc::new(config);
        let db = MemoryDatabase::new();
        let queue = Arc::new(MemoryQueue::default());
        let reporter = Arc::new(CapturingReporter::default());

        let state = Self::from_parts(
            config.clone(),
            Arc::new(db.clone()),
            queue.clone(),
            reporter.clone(),
        )
        .expect("fake state");
        (
            state,
            Fakes {
                config,
                db,
                queue,
                reporter,
            },
        )
    }
}

#[cfg(test)]
pub struct Fakes {
    pub config: Arc<AppConfig>,
    pub db: crate::db::memory::MemoryDatabase,
    pub queue: Arc<crate::tasks::testing::MemoryQueue>,
    pub reporter: Arc<crate::reporting::testing::CapturingReporter>,
}

#[cfg(test)]
impl Fakes {
    pub fn stores(&self) -> crate::db::Stores {
        self.db.stores()
    }

    pub async fn register(
        &self,
        state: &AppState,
        name: &str,
        email: &str,
        password: &str,
    ) -> crate::db::User {
        state
            .accounts
            .register(&crate::context::CallContext::background(), name, email, password)
            .await
            .expect("register")
    }

    pub fn last_email(&self) -> crate::tasks::email::EmailPayload {
        let payload = self.queue.last_payload().expect("an email was dispatched");
        serde_json::from_value(payload).expect("email payload")
    }

    /// Raw token carried in the `?token=` query of a link in the last email.
    pub fn token_from_last_email(&self, link_key: &str) -> String {
        let mail = self.last_email();
        let link = mail.data[link_key].as_str().expect("link").to_string();
        link.split_once("token=").expect("token param").1.to_string()
    }
}
