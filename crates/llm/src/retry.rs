//! Retry wrapper for chat calls.
//!
//! Retryable failures (rate limit, timeout, 5xx) are repeated with
//! exponential back-off up to a bounded attempt count; permanent failures
//! (auth, bad request) and cancellation fail fast.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::client::{Completion, CompletionRequest, LlmClient};
use crate::error::LlmError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Back-off before attempt `n` (1-based): base × 2^(n−1), capped.
    fn delay_before(&self, attempt: u32) -> Duration {
        let factor = 1u32 << (attempt.saturating_sub(1)).min(8);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Wraps any [`LlmClient`] with the retry policy and an optional
/// cancellation token checked between attempts.
pub struct RetryingClient<C> {
    inner: C,
    policy: RetryPolicy,
    cancel: Option<CancelToken>,
}

impl<C> RetryingClient<C> {
    pub fn new(inner: C, policy: RetryPolicy) -> Self {
        Self { inner, policy, cancel: None }
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    fn cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelToken::is_cancelled)
    }
}

#[async_trait]
impl<C: LlmClient> LlmClient for RetryingClient<C> {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, LlmError> {
        let mut last_error = None;

        for attempt in 1..=self.policy.max_attempts {
            if self.cancelled() {
                return Err(LlmError::Cancelled);
            }
            if attempt > 1 {
                let delay = self.policy.delay_before(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "backing off before retry");
                tokio::time::sleep(delay).await;
                if self.cancelled() {
                    return Err(LlmError::Cancelled);
                }
            }

            match self.inner.complete(request.clone()).await {
                Ok(completion) => return Ok(completion),
                Err(error) if error.retryable() => {
                    warn!(attempt, %error, "retryable llm failure");
                    last_error = Some(error);
                }
                Err(error) => return Err(error),
            }
        }

        Err(last_error.unwrap_or(LlmError::Unknown { status: None, message: "retries exhausted".to_string() }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::client::{ContentBlock, StopReason, Usage};

    /// Fails with the queued errors, then succeeds.
    struct FlakyClient {
        errors: Mutex<Vec<LlmError>>,
        calls: AtomicU32,
    }

    impl FlakyClient {
        fn new(errors: Vec<LlmError>) -> Self {
            Self { errors: Mutex::new(errors), calls: AtomicU32::new(0) }
        }
    }

    #[async_trait]
    impl LlmClient for FlakyClient {
        async fn complete(&self, _request: CompletionRequest) -> Result<Completion, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.errors.lock().unwrap().pop();
            match next {
                Some(error) => Err(error),
                None => Ok(Completion {
                    content: vec![ContentBlock::Text { text: "ok".into() }],
                    stop_reason: StopReason::EndTurn,
                    usage: Usage::default(),
                }),
            }
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let inner = FlakyClient::new(vec![
            LlmError::RateLimit { status: Some(429) },
            LlmError::Timeout { secs: 1 },
        ]);
        let client = RetryingClient::new(inner, fast_policy());

        let completion = client.complete(CompletionRequest::from_prompt("hi")).await.unwrap();
        assert_eq!(crate::extract_text(&completion), "ok");
        assert_eq!(client.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_fail_fast() {
        // Errors pop LIFO: rate limit first, then the auth failure.
        let inner = FlakyClient::new(vec![
            LlmError::Authentication { status: Some(401) },
            LlmError::RateLimit { status: Some(429) },
        ]);
        let client = RetryingClient::new(inner, fast_policy());

        let error = client.complete(CompletionRequest::from_prompt("hi")).await.unwrap_err();
        assert!(matches!(error, LlmError::Authentication { .. }));
        // One real attempt plus no retries after the auth failure.
        assert_eq!(client.inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_the_last_error() {
        let inner = FlakyClient::new(vec![
            LlmError::Timeout { secs: 1 },
            LlmError::Timeout { secs: 1 },
            LlmError::Timeout { secs: 1 },
            LlmError::Timeout { secs: 1 },
        ]);
        let client = RetryingClient::new(inner, fast_policy());

        let error = client.complete(CompletionRequest::from_prompt("hi")).await.unwrap_err();
        assert!(matches!(error, LlmError::Timeout { .. }));
        assert_eq!(client.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancellation_short_circuits() {
        let token = CancelToken::new();
        token.cancel();
        let inner = FlakyClient::new(vec![]);
        let client = RetryingClient::new(inner, fast_policy()).with_cancel(token);

        let error = client.complete(CompletionRequest::from_prompt("hi")).await.unwrap_err();
        assert!(matches!(error, LlmError::Cancelled));
        assert_eq!(client.inner.calls.load(Ordering::SeqCst), 0);
    }
}
