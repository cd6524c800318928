use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use crate::error::AppError;

/// Request-scoped values threaded explicitly through every service call.
///
/// The context is immutable: the `with_*` builders return a new value.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    request_id: Option<String>,
    user_id: Option<Uuid>,
    deadline: Option<Instant>,
}

impl CallContext {
    /// A context with no identifiers and no deadline, used by background jobs.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_user_id(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    pub fn user_id(&self) -> Option<Uuid> {
        self.user_id
    }

    #[cfg(test)]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Runs `fut` until the deadline, if any.
    pub async fn within<F: Future>(&self, fut: F) -> Result<F::Output, AppError> {
        match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, fut)
                .await
                .map_err(|_| AppError::DeadlineExceeded),
            None => Ok(fut.await),
        }
    }

    /// Like [`within`](Self::within) for fallible futures, flattening both errors.
    pub async fn bounded<T, E, F>(&self, fut: F) -> Result<T, AppError>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<AppError>,
    {
        self.within(fut).await?.map_err(Into::into)
    }
}
