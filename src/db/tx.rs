use std::panic::{resume_unwind, AssertUnwindSafe};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::json;
use tracing::debug;

use super::{Database, Stores, Transaction};
use crate::context::CallContext;
use crate::error::AppError;
use crate::reporting::ErrorReporter;

/// Runs units of work atomically across all stores.
#[derive(Clone)]
pub struct TxManager {
    db: Arc<dyn Database>,
    reporter: Arc<dyn ErrorReporter>,
}

impl TxManager {
    pub fn new(db: Arc<dyn Database>, reporter: Arc<dyn ErrorReporter>) -> Self {
        Self { db, reporter }
    }

    /// Begins a transaction, hands `work` the bound stores and commits when it
    /// returns `Ok`. Any error, deadline expiry or panic rolls back; a panic is
    /// resumed after the rollback. A failed rollback is reported, and the
    /// original error is still the one returned.
    ///
    /// `work` must only capture owned values:
    ///
    /// ```ignore
    /// tx.run(&ctx, move |s| Box::pin(async move {
    ///     s.users.cancel_deletion(user_id).await?;
    ///     Ok(())
    /// })).await?;
    /// ```
    pub async fn run<T, F>(&self, ctx: &CallContext, work: F) -> Result<T, AppError>
    where
        T: Send,
        F: for<'t> FnOnce(&'t Stores) -> BoxFuture<'t, Result<T, AppError>> + Send,
    {
        let tx = ctx.bounded(self.db.begin()).await?;

        let outcome = ctx
            .within(AssertUnwindSafe(work(tx.stores())).catch_unwind())
            .await;

        match outcome {
            Ok(Ok(Ok(value))) => {
                ctx.bounded(tx.commit()).await?;
                debug!("transaction committed");
                Ok(value)
            }
            Ok(Ok(Err(err))) => {
                self.rollback(tx, err.code()).await;
                Err(err)
            }
            Ok(Err(panic)) => {
                self.rollback(tx, "PANIC").await;
                resume_unwind(panic)
            }
            Err(deadline) => {
                self.rollback(tx, deadline.code()).await;
                Err(deadline)
            }
        }
    }

    async fn rollback(&self, tx: Box<dyn Transaction>, cause: &str) {
        debug!(cause, "rolling back transaction");
        if let Err(e) = tx.rollback().await {
            self.reporter
                .capture(&e, &json!({ "operation": "rollback", "cause": cause }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryDatabase;
    use crate::reporting::testing::CapturingReporter;
    use std::time::Duration;

    fn manager() -> (MemoryDatabase, Arc<CapturingReporter>, TxManager) {
        let db = MemoryDatabase::new();
        let reporter = Arc::new(CapturingReporter::default());
        let tx = TxManager::new(Arc::new(db.clone()), reporter.clone());
        (db, reporter, tx)
    }

    #[tokio::test]
    async fn commits_on_success() {
        let (db, _, tx) = manager();
        let ctx = CallContext::background();
        let user = tx
            .run(&ctx, |s| {
                Box::pin(async move { Ok(s.users.create("Cy", "cy@example.com", "h").await?) })
            })
            .await
            .unwrap();
        assert!(db.user(user.id).is_some());
    }

    #[tokio::test]
    async fn domain_error_rolls_back_everything() {
        let (db, _, tx) = manager();
        let ctx = CallContext::background();
        let res: Result<(), AppError> = tx
            .run(&ctx, |s| {
                Box::pin(async move {
                    s.users.create("Di", "di@example.com", "h").await?;
                    Err(AppError::DeletionAlreadyScheduled)
                })
            })
            .await;
        assert!(matches!(res, Err(AppError::DeletionAlreadyScheduled)));
        assert!(db.stores().users.get_by_email("di@example.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_rollback_is_reported_without_masking() {
        let (db, reporter, tx) = manager();
        db.fail_on("tx.rollback");
        let ctx = CallContext::background();
        let res: Result<(), AppError> = tx
            .run(&ctx, |_| Box::pin(async move { Err(AppError::UserNotFound) }))
            .await;
        assert!(matches!(res, Err(AppError::UserNotFound)));
        let captured = reporter.captured();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].1["cause"], "USER_NOT_FOUND");
    }

    #[tokio::test]
    async fn panic_rolls_back_and_resumes() {
        let (db, _, tx) = manager();
        let handle = tokio::spawn(async move {
            let ctx = CallContext::background();
            let _: Result<(), AppError> = tx
                .run(&ctx, |s| {
                    Box::pin(async move {
                        s.users.create("Ed", "ed@example.com", "h").await?;
                        panic!("boom");
                    })
                })
                .await;
        });
        let err = handle.await.unwrap_err();
        assert!(err.is_panic());
        assert!(db.stores().users.get_by_email("ed@example.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn deadline_rolls_back() {
        let (db, _, tx) = manager();
        let ctx = CallContext::background().with_timeout(Duration::from_millis(20));
        let res: Result<(), AppError> = tx
            .run(&ctx, |s| {
                Box::pin(async move {
                    s.users.create("Flo", "flo@example.com", "h").await?;
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                })
            })
            .await;
        assert!(matches!(res, Err(AppError::DeadlineExceeded)));
        assert!(db.stores().users.get_by_email("flo@example.com").await.unwrap().is_none());
    }
}
