//! Bounded retries with exponential backoff around a stage's transform.

use std::time::Duration;

use rand::Rng;

use crate::envelope::Envelope;
use crate::error::{RetryExhausted, TransformError};
use crate::transform::Transform;

/// Per-stage retry settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Invocations allowed before the item is dead-lettered
    pub max_attempts: u32,
    /// Delay after the first failure; doubles after each further failure
    pub base_backoff: Duration,
    /// Upper bound on any single delay
    pub max_backoff: Duration,
    /// Pick a uniformly random delay in `[0, backoff]` instead of the full backoff
    pub jitter: bool,
    /// Per-attempt deadline; an expired attempt counts as a failure
    pub timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(30),
            jitter: false,
            timeout: None,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries and never sleeps.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_backoff: Duration::ZERO,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_base_backoff(mut self, base_backoff: Duration) -> Self {
        self.base_backoff = base_backoff;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Delay to wait after failed attempt `attempt_index` (zero-based).
    fn delay_after(&self, attempt_index: u32) -> Duration {
        let delay = backoff_duration(attempt_index, self.base_backoff, self.max_backoff);
        if self.jitter && !delay.is_zero() {
            let ms = delay.as_millis() as u64;
            Duration::from_millis(rand::thread_rng().gen_range(0..=ms))
        } else {
            delay
        }
    }
}

/// Calculate exponential backoff for a given attempt.
///
/// Uses `base * 2^attempt`, capped at `cap`.
pub fn backoff_duration(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(cap).min(cap)
}

/// Run `transform` on `envelope` until it succeeds or the policy gives up.
///
/// The budget is `max_attempts` in total, counted from `meta.attempts`:
/// an envelope resumed after a restart only gets the attempts it has left,
/// and backoff grows with its overall attempt number. An envelope that
/// arrives with nothing left fails without invoking the transform. The
/// caller owns dead-letter routing of the returned error.
pub async fn execute(
    stage: &str,
    transform: &dyn Transform,
    envelope: &mut Envelope,
    policy: &RetryPolicy,
) -> Result<(), RetryExhausted> {
    let resumed_at = envelope.meta().attempts();
    if resumed_at >= policy.max_attempts {
        let err = TransformError::AttemptsSpent {
            attempts: resumed_at,
            max_attempts: policy.max_attempts,
        };
        return Err(RetryExhausted {
            stage: stage.to_string(),
            attempts: 0,
            history: vec![err.to_string()],
            last: err,
        });
    }

    let mut history = Vec::new();

    loop {
        envelope.meta_mut().attempts += 1;
        let attempt = envelope.meta().attempts();

        let result = match policy.timeout {
            Some(limit) => match tokio::time::timeout(limit, transform.apply(envelope)).await {
                Ok(result) => result,
                Err(_) => Err(TransformError::Timeout {
                    stage: stage.to_string(),
                    timeout: limit,
                }),
            },
            None => transform.apply(envelope).await,
        };

        let err = match result {
            Ok(()) => {
                if !history.is_empty() {
                    tracing::debug!(
                        "{} succeeded for {} on attempt {}",
                        stage,
                        envelope.id().short(12),
                        attempt
                    );
                }
                return Ok(());
            }
            Err(e) => e,
        };

        history.push(err.to_string());

        if attempt >= policy.max_attempts {
            return Err(RetryExhausted {
                stage: stage.to_string(),
                attempts: attempt - resumed_at,
                last: err,
                history,
            });
        }

        let delay = policy.delay_after(attempt - 1);
        tracing::warn!(
            "{} attempt {}/{} failed for {}: {} (retrying in {:?})",
            stage,
            attempt,
            policy.max_attempts,
            envelope.id().short(12),
            err,
            delay
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Payload;
    use crate::transform::from_fn;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(max_attempts)
            .with_base_backoff(Duration::from_millis(1))
    }

    #[test]
    fn test_backoff_exponential() {
        let base = Duration::from_millis(1000);
        let cap = Duration::from_secs(30);
        assert_eq!(backoff_duration(0, base, cap), Duration::from_millis(1000));
        assert_eq!(backoff_duration(1, base, cap), Duration::from_millis(2000));
        assert_eq!(backoff_duration(2, base, cap), Duration::from_millis(4000));
        assert_eq!(backoff_duration(3, base, cap), Duration::from_millis(8000));
    }

    #[test]
    fn test_backoff_capped() {
        let cap = Duration::from_secs(30);
        assert_eq!(backoff_duration(10, Duration::from_secs(1), cap), cap);
        assert_eq!(backoff_duration(40, Duration::from_secs(1), cap), cap);
    }

    #[test]
    fn test_jitter_stays_within_backoff() {
        let policy = RetryPolicy {
            jitter: true,
            base_backoff: Duration::from_millis(100),
            ..RetryPolicy::default()
        };
        for _ in 0..50 {
            assert!(policy.delay_after(1) <= Duration::from_millis(200));
        }
    }

    #[tokio::test]
    async fn test_always_failing_transform_invoked_max_attempts_times() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let t = from_fn(move |_: &mut Envelope| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(TransformError::failed("always"))
        });

        let mut env = Envelope::new("x", Payload::Empty);
        let err = execute("s", &t, &mut env, &fast_policy(4)).await.unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(err.attempts, 4);
        assert_eq!(err.history.len(), 4);
        assert_eq!(env.meta().attempts(), 4);
    }

    #[tokio::test]
    async fn test_succeeds_on_second_attempt() {
        let t = from_fn(|env: &mut Envelope| {
            if env.meta().attempts() < 2 {
                Err(TransformError::failed("first try"))
            } else {
                Ok(())
            }
        });
        let mut env = Envelope::new("x", Payload::Empty);
        execute("s", &t, &mut env, &fast_policy(2)).await.unwrap();
        assert_eq!(env.meta().attempts(), 2);
    }

    #[tokio::test]
    async fn test_attempts_resume_from_envelope() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let t = from_fn(move |_: &mut Envelope| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(TransformError::failed("no"))
        });
        let mut env = Envelope::new("x", Payload::Empty);
        env.meta_mut().attempts = 1;

        let err = execute("s", &t, &mut env, &fast_policy(2)).await.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.attempts, 1);
        assert_eq!(env.meta().attempts(), 2);
    }

    #[tokio::test]
    async fn test_spent_budget_fails_without_invoking() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let t = from_fn(move |_: &mut Envelope| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let mut env = Envelope::new("x", Payload::Empty);
        env.meta_mut().attempts = 3;

        let err = execute("s", &t, &mut env, &fast_policy(3)).await.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(err.attempts, 0);
        assert!(matches!(
            err.last,
            TransformError::AttemptsSpent {
                attempts: 3,
                max_attempts: 3
            }
        ));
        assert_eq!(env.meta().attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_continues_from_resumed_attempt() {
        let t = from_fn(|_: &mut Envelope| Err(TransformError::failed("no")));
        let policy = RetryPolicy::default()
            .with_max_attempts(4)
            .with_base_backoff(Duration::from_millis(100));
        let mut env = Envelope::new("x", Payload::Empty);
        env.meta_mut().attempts = 2;

        let start = tokio::time::Instant::now();
        execute("s", &t, &mut env, &policy).await.unwrap_err();
        // Attempt 3 fails and waits 100ms * 2^2; attempt 4 is the last.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(400));
        assert!(elapsed < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_last_error_is_carried() {
        let calls = AtomicU32::new(0);
        let t = from_fn(move |_: &mut Envelope| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            Err(TransformError::failed(format!("failure {n}")))
        });
        let mut env = Envelope::new("x", Payload::Empty);
        let err = execute("s", &t, &mut env, &fast_policy(3)).await.unwrap_err();
        assert_eq!(err.last.to_string(), "failure 2");
        assert_eq!(err.history, vec!["failure 0", "failure 1", "failure 2"]);
    }

    struct Sleepy;

    #[async_trait::async_trait]
    impl Transform for Sleepy {
        async fn apply(&self, _: &mut Envelope) -> Result<(), TransformError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let policy = fast_policy(2).with_timeout(Duration::from_millis(10));
        let mut env = Envelope::new("x", Payload::Empty);
        let err = execute("slow", &Sleepy, &mut env, &policy).await.unwrap_err();
        assert!(matches!(err.last, TransformError::Timeout { .. }));
        assert_eq!(err.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_sleeps_between_attempts() {
        let t = from_fn(|_: &mut Envelope| Err(TransformError::failed("no")));
        let policy = RetryPolicy::default()
            .with_max_attempts(3)
            .with_base_backoff(Duration::from_millis(100));
        let mut env = Envelope::new("x", Payload::Empty);

        let start = tokio::time::Instant::now();
        execute("s", &t, &mut env, &policy).await.unwrap_err();
        // 100ms after the first failure, 200ms after the second, none after the last.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_millis(400));
    }
}
