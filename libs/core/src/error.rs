use std::fmt;

use thiserror::Error;

pub type CoreResult<T> = Result<T, CoreError>;

/// Coded error carried across library boundaries.
///
/// The `code` is a stable machine-readable identifier (`ig_send_failed`,
/// `store_unavailable`, ...); `retry_after_ms` is a hint for callers that
/// want to retry transport failures.
#[derive(Debug, Error)]
pub struct CoreError {
    pub code: String,
    pub message: String,
    pub retry_after_ms: Option<u64>,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl CoreError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retry_after_ms: None,
            source: None,
        }
    }

    pub fn with_retry(mut self, retry_after_ms: Option<u64>) -> Self {
        self.retry_after_ms = retry_after_ms;
        self
    }

    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Transport-level failure that is safe to retry.
    pub fn transport(err: reqwest::Error) -> Self {
        Self::new("ig_transport", err.to_string())
            .with_retry(Some(1_000))
            .with_source(err)
    }

    pub fn is_retryable(&self) -> bool {
        self.retry_after_ms.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_code_and_message() {
        let err = CoreError::new("ig_send_failed", "status=400");
        assert_eq!(err.to_string(), "ig_send_failed: status=400");
        assert!(!err.is_retryable());
    }

    #[test]
    fn retry_hint_marks_error_retryable() {
        let err = CoreError::new("ig_transport", "timed out").with_retry(Some(500));
        assert!(err.is_retryable());
        assert_eq!(err.retry_after_ms, Some(500));
    }
}
