use serde_json::Value;
use tracing::error;

/// Sink for failures that are deliberately not returned to the caller.
pub trait ErrorReporter: Send + Sync {
    fn capture(&self, err: &anyhow::Error, context: &Value);
}

/// Reports by logging at error level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn capture(&self, err: &anyhow::Error, context: &Value) {
        error!(error = ?err, context = %context, "captured error");
    }
}
