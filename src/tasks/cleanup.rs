use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use serde_json::json;
use tokio::time::MissedTickBehavior;
use tracing::{info, instrument};

use crate::db::Stores;
use crate::reporting::ErrorReporter;

/// Rows removed by one cleanup run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub sessions: u64,
    pub password_resets: u64,
    pub email_verifications: u64,
    pub users: u64,
}

/// Periodic purge of dead tokens and overdue accounts.
#[derive(Clone)]
pub struct CleanupJob {
    stores: Stores,
    reporter: Arc<dyn ErrorReporter>,
}

impl CleanupJob {
    pub fn new(stores: Stores, reporter: Arc<dyn ErrorReporter>) -> Self {
        Self { stores, reporter }
    }

    /// Runs the four purges in order and stops at the first failure.
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> anyhow::Result<CleanupReport> {
        let mut report = CleanupReport::default();
        report.sessions = self
            .stores
            .sessions
            .purge_expired_or_revoked()
            .await
            .context("purge sessions")?;
        report.password_resets = self
            .stores
            .password_resets
            .purge_expired_or_used()
            .await
            .context("purge password resets")?;
        report.email_verifications = self
            .stores
            .email_verifications
            .purge_expired_or_used()
            .await
            .context("purge email verifications")?;
        report.users = self
            .stores
            .users
            .purge_overdue()
            .await
            .context("purge overdue users")?;

        info!(
            sessions = report.sessions,
            password_resets = report.password_resets,
            email_verifications = report.email_verifications,
            users = report.users,
            "cleanup finished"
        );
        Ok(report)
    }

    /// Runs forever, once per `every`. A failed run is reported and the next
    /// tick tries again.
    pub async fn run_every(self, every: Duration) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(e) = self.run_once().await {
                self.reporter.capture(&e, &json!({ "job": "cleanup" }));
            }
        }
    }
}
