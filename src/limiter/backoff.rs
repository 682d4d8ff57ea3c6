//! Adaptive pacing for the inference service.
//!
//! Fresh calls only keep a minimum spacing from the previous call. Retries
//! after a throttle wait for the escalated delay, with jitter so that
//! concurrent jobs do not retry in lockstep. One clean success resets the
//! delay to the floor.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Static backoff settings.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Minimum spacing between consecutive fresh calls.
    pub min_interval: Duration,
    pub floor: Duration,
    pub ceiling: Duration,
    pub multiplier: f64,
    /// Symmetric jitter fraction applied to retry waits (0.1 = ±10%).
    pub jitter: f64,
    /// Total attempts per inference request, including the first.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(350),
            floor: Duration::from_secs(5),
            ceiling: Duration::from_secs(120),
            multiplier: 2.0,
            jitter: 0.1,
            max_attempts: 3,
        }
    }
}

#[derive(Debug)]
struct BackoffState {
    current_delay: Duration,
    consecutive_throttles: u32,
    last_success: Option<DateTime<Utc>>,
    last_call: Option<Instant>,
}

/// Backoff state as reported on the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct BackoffSnapshot {
    pub current_delay_secs: f64,
    pub consecutive_throttles: u32,
    pub last_success: Option<DateTime<Utc>>,
    pub max_attempts: u32,
}

pub struct AdaptiveBackoff {
    policy: BackoffPolicy,
    state: Mutex<BackoffState>,
    pacing: tokio::sync::Mutex<()>,
}

impl AdaptiveBackoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        let state = BackoffState {
            current_delay: policy.floor,
            consecutive_throttles: 0,
            last_success: None,
            last_call: None,
        };

        Self {
            policy,
            state: Mutex::new(state),
            pacing: tokio::sync::Mutex::new(()),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.policy.max_attempts
    }

    /// Escalated delay the next retry will wait for (before jitter).
    pub fn current_delay(&self) -> Duration {
        self.lock_state().current_delay
    }

    pub fn consecutive_throttles(&self) -> u32 {
        self.lock_state().consecutive_throttles
    }

    /// Suspend before an inference call. Returns how long the caller waited.
    pub async fn wait_before_call(&self, is_retry: bool) -> Duration {
        if is_retry {
            let delay = self.jittered(self.current_delay());
            warn!(
                "Inference throttled, backing off for {:.1}s",
                delay.as_secs_f64()
            );
            tokio::time::sleep(delay).await;
            self.lock_state().last_call = Some(Instant::now());
            return delay;
        }

        let _pace = self.pacing.lock().await;
        let wait = self
            .lock_state()
            .last_call
            .map(|last| self.policy.min_interval.saturating_sub(last.elapsed()))
            .unwrap_or_default();

        if !wait.is_zero() {
            debug!(wait_ms = wait.as_millis() as u64, "Pacing inference call");
            tokio::time::sleep(wait).await;
        }
        self.lock_state().last_call = Some(Instant::now());
        wait
    }

    /// Feed back the outcome of a call.
    pub fn record_result(&self, success: bool, was_throttled: bool) {
        let mut state = self.lock_state();

        if was_throttled {
            state.consecutive_throttles += 1;
            // First throttle of a streak retries at the floor.
            if state.consecutive_throttles > 1 {
                state.current_delay = self.escalate(state.current_delay);
            }
            debug!(
                throttles = state.consecutive_throttles,
                delay_secs = state.current_delay.as_secs_f64(),
                "Inference throttle recorded"
            );
        } else if success {
            if state.consecutive_throttles > 0 {
                info!(
                    "Inference call succeeded after {} throttles, resetting backoff",
                    state.consecutive_throttles
                );
            }
            state.consecutive_throttles = 0;
            state.current_delay = self.policy.floor;
            state.last_success = Some(Utc::now());
        }
    }

    pub fn snapshot(&self) -> BackoffSnapshot {
        let state = self.lock_state();
        BackoffSnapshot {
            current_delay_secs: state.current_delay.as_secs_f64(),
            consecutive_throttles: state.consecutive_throttles,
            last_success: state.last_success,
            max_attempts: self.policy.max_attempts,
        }
    }

    fn escalate(&self, delay: Duration) -> Duration {
        let next = delay.as_secs_f64() * self.policy.multiplier;
        Duration::from_secs_f64(next.min(self.policy.ceiling.as_secs_f64()))
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.policy.jitter <= 0.0 {
            return delay.min(self.policy.ceiling);
        }
        let offset: f64 = rand::rng().random_range(-1.0..=1.0);
        let secs = delay.as_secs_f64() * (1.0 + self.policy.jitter * offset);
        Duration::from_secs_f64(secs.clamp(0.0, self.policy.ceiling.as_secs_f64()))
    }

    fn lock_state(&self) -> MutexGuard<'_, BackoffState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: f64) -> BackoffPolicy {
        BackoffPolicy {
            jitter,
            ..BackoffPolicy::default()
        }
    }

    #[test]
    fn test_delay_escalates_and_caps_at_ceiling() {
        let backoff = AdaptiveBackoff::new(policy(0.1));
        let mut previous = backoff.current_delay();
        assert_eq!(previous, Duration::from_secs(5));

        for _ in 0..12 {
            backoff.record_result(false, true);
            let delay = backoff.current_delay();
            assert!(delay >= previous);
            assert!(delay <= Duration::from_secs(120));
            previous = delay;
        }
        assert_eq!(previous, Duration::from_secs(120));
        assert_eq!(backoff.consecutive_throttles(), 12);
    }

    #[test]
    fn test_streak_sequence_doubles_from_floor() {
        let backoff = AdaptiveBackoff::new(policy(0.0));
        let observed: Vec<u64> = (0..4)
            .map(|_| {
                backoff.record_result(false, true);
                backoff.current_delay().as_secs()
            })
            .collect();
        assert_eq!(observed, vec![5, 10, 20, 40]);
    }

    #[test]
    fn test_success_resets_to_floor() {
        let backoff = AdaptiveBackoff::new(policy(0.1));
        for _ in 0..4 {
            backoff.record_result(false, true);
        }
        assert!(backoff.current_delay() > Duration::from_secs(5));

        backoff.record_result(true, false);
        assert_eq!(backoff.current_delay(), Duration::from_secs(5));
        assert_eq!(backoff.consecutive_throttles(), 0);
        assert!(backoff.snapshot().last_success.is_some());
    }

    #[test]
    fn test_plain_failure_keeps_delay() {
        let backoff = AdaptiveBackoff::new(policy(0.0));
        backoff.record_result(false, true);
        backoff.record_result(false, true);
        let before = backoff.current_delay();

        backoff.record_result(false, false);
        assert_eq!(backoff.current_delay(), before);
        assert_eq!(backoff.consecutive_throttles(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_calls_keep_min_interval() {
        let backoff = AdaptiveBackoff::new(policy(0.0));
        let start = Instant::now();

        assert_eq!(backoff.wait_before_call(false).await, Duration::ZERO);
        backoff.wait_before_call(false).await;
        backoff.wait_before_call(false).await;

        assert!(start.elapsed() >= Duration::from_millis(700));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_waits_current_delay_within_jitter() {
        let backoff = AdaptiveBackoff::new(policy(0.1));
        backoff.record_result(false, true);
        backoff.record_result(false, true);

        let start = Instant::now();
        let waited = backoff.wait_before_call(true).await;

        assert!(waited >= Duration::from_secs(9));
        assert!(waited <= Duration::from_secs(11));
        assert!(start.elapsed() >= waited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_wait_never_exceeds_ceiling() {
        let backoff = AdaptiveBackoff::new(BackoffPolicy {
            jitter: 0.5,
            ..BackoffPolicy::default()
        });
        for _ in 0..10 {
            backoff.record_result(false, true);
        }

        let waited = backoff.wait_before_call(true).await;
        assert!(waited <= Duration::from_secs(120));
    }
}
