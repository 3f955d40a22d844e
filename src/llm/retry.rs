//! Retry policy for provider calls: exponential backoff with jitter, error
//! classification, and the streaming to non-streaming fallback.

use crate::config::RetryConfig;
use crate::error::{LlmCallError, LlmErrorKind, TransportMode};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Statuses worth another attempt
pub const RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

pub fn is_retryable_status(status: u16) -> bool {
    RETRYABLE_STATUSES.contains(&status)
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub stream_failures_before_fallback: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            stream_failures_before_fallback: config.stream_failures_before_fallback,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter_ratio: config.jitter_ratio.clamp(0.0, 1.0),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retrying after `attempt` (1-based), without jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let delay = self.base_delay.saturating_mul(1u32 << exponent);
        delay.min(self.max_delay)
    }

    /// Backoff plus a random extra of up to `jitter_ratio` of it, capped at `max_delay`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let backoff = self.backoff(attempt);
        if self.jitter_ratio <= 0.0 || backoff.is_zero() {
            return backoff;
        }
        let extra = backoff.mul_f64(rand::thread_rng().gen_range(0.0..=self.jitter_ratio));
        (backoff + extra).min(self.max_delay)
    }

    /// Transport for the next attempt given the streaming failures seen so far
    pub fn transport_for(&self, stream_failures: u32, supports_streaming: bool) -> TransportMode {
        if supports_streaming && stream_failures < self.stream_failures_before_fallback {
            TransportMode::Streaming
        } else {
            TransportMode::NonStreaming
        }
    }
}

/// What the retry loop tells a single attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptPlan {
    /// 1-based attempt number
    pub attempt: u32,
    pub transport: TransportMode,
}

/// Failure of a single attempt, before retry classification
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptError {
    pub kind: LlmErrorKind,
    pub status: Option<u16>,
    pub request_id: Option<String>,
    pub message: String,
}

impl AttemptError {
    pub fn new(kind: LlmErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            request_id: None,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::Timeout, message)
    }

    pub fn malformed_stream(message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::MalformedStream, message)
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::InvalidResponse, message)
    }

    pub fn http_status(status: u16, request_id: Option<String>, message: impl Into<String>) -> Self {
        Self {
            kind: LlmErrorKind::Status,
            status: Some(status),
            request_id,
            message: message.into(),
        }
    }

    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            LlmErrorKind::Timeout
        } else if err.is_decode() || err.is_body() {
            LlmErrorKind::MalformedStream
        } else {
            LlmErrorKind::Connection
        };
        Self {
            kind,
            status: err.status().map(|s| s.as_u16()),
            request_id: None,
            message: err.to_string(),
        }
    }

    pub fn with_request_id(mut self, request_id: Option<String>) -> Self {
        if self.request_id.is_none() {
            self.request_id = request_id;
        }
        self
    }

    pub fn is_retryable(&self) -> bool {
        match self.kind {
            LlmErrorKind::Timeout | LlmErrorKind::MalformedStream => true,
            LlmErrorKind::Status => self.status.map(is_retryable_status).unwrap_or(false),
            _ => false,
        }
    }

    pub fn into_call_error(self, attempts: u32, transport: TransportMode) -> LlmCallError {
        LlmCallError {
            kind: self.kind,
            status: self.status,
            request_id: self.request_id,
            attempts,
            transport,
            message: self.message,
        }
    }
}

/// Run `attempt` until it succeeds, fails with a non-retryable error, or the budget runs out
pub async fn call_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    supports_streaming: bool,
    mut attempt: F,
) -> Result<T, LlmCallError>
where
    F: FnMut(AttemptPlan) -> Fut,
    Fut: Future<Output = Result<T, AttemptError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut stream_failures = 0u32;
    let mut number = 1u32;

    loop {
        let transport = policy.transport_for(stream_failures, supports_streaming);
        debug!("{} attempt {}/{} via {}", label, number, max_attempts, transport);

        let err = match attempt(AttemptPlan {
            attempt: number,
            transport,
        })
        .await
        {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if transport == TransportMode::Streaming {
            stream_failures += 1;
        }

        if !err.is_retryable() || number >= max_attempts {
            return Err(err.into_call_error(number, transport));
        }

        let delay = policy.delay_for(number);
        warn!(
            "{} attempt {}/{} via {} failed ({}, status={:?}): {}; retrying in {}ms",
            label,
            number,
            max_attempts,
            transport,
            err.kind.as_str(),
            err.status,
            err.message,
            delay.as_millis()
        );
        sleep(delay).await;
        number += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn fast_policy(max_attempts: u32, stream_failures: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            stream_failures_before_fallback: stream_failures,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter_ratio: 0.0,
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(1000));
        assert_eq!(policy.backoff(2), Duration::from_millis(2000));
        assert_eq!(policy.backoff(3), Duration::from_millis(4000));
        assert_eq!(policy.backoff(10), Duration::from_millis(30_000));
        let jittered = policy.delay_for(2);
        assert!(jittered >= Duration::from_millis(2000));
        assert!(jittered <= Duration::from_millis(2500));
    }

    #[test]
    fn test_classification() {
        assert!(AttemptError::timeout("t").is_retryable());
        assert!(AttemptError::malformed_stream("m").is_retryable());
        for status in RETRYABLE_STATUSES {
            assert!(AttemptError::http_status(status, None, "x").is_retryable());
        }
        assert!(!AttemptError::http_status(400, None, "bad").is_retryable());
        assert!(!AttemptError::http_status(401, None, "auth").is_retryable());
        assert!(!AttemptError::invalid_response("x").is_retryable());
    }

    #[test]
    fn test_stream_fallback_after_failures() {
        let seen = RefCell::new(Vec::new());
        let result: Result<&str, _> = tokio_test::block_on(call_with_retry(
            &fast_policy(5, 2),
            "test",
            true,
            |plan| {
                seen.borrow_mut().push(plan.transport);
                let outcome = if plan.attempt < 4 {
                    Err(AttemptError::malformed_stream("cut off"))
                } else {
                    Ok("done")
                };
                async move { outcome }
            },
        ));
        assert_eq!(result.unwrap(), "done");
        assert_eq!(
            *seen.borrow(),
            vec![
                TransportMode::Streaming,
                TransportMode::Streaming,
                TransportMode::NonStreaming,
                TransportMode::NonStreaming,
            ]
        );
    }

    #[test]
    fn test_budget_exhaustion_reports_summary() {
        let err = tokio_test::block_on(call_with_retry(
            &fast_policy(3, 1),
            "test",
            true,
            |_plan| async {
                Err::<(), _>(AttemptError::http_status(
                    503,
                    Some("req_1".to_string()),
                    "unavailable",
                ))
            },
        ))
        .unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(err.status, Some(503));
        assert_eq!(err.transport, TransportMode::NonStreaming);
        assert_eq!(err.request_id.as_deref(), Some("req_1"));
    }

    #[test]
    fn test_non_retryable_stops_immediately() {
        let calls = RefCell::new(0);
        let err = tokio_test::block_on(call_with_retry(
            &fast_policy(5, 2),
            "test",
            false,
            |_plan| {
                *calls.borrow_mut() += 1;
                async { Err::<(), _>(AttemptError::http_status(400, None, "bad request")) }
            },
        ))
        .unwrap_err();
        assert_eq!(*calls.borrow(), 1);
        assert_eq!(err.attempts, 1);
        assert_eq!(err.transport, TransportMode::NonStreaming);
    }
}
