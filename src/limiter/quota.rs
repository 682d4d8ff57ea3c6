//! Sliding-window quota limiter for the telemetry API.
//!
//! A reservation is granted only when every configured window has headroom.
//! When a window is full the caller sleeps until the timestamp that blocks it
//! leaves the window, then checks again. Reservations never fail.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// At most `limit` requests inside any span of `duration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaWindow {
    pub limit: usize,
    pub duration: Duration,
}

impl QuotaWindow {
    pub fn new(limit: usize, duration: Duration) -> Self {
        Self { limit, duration }
    }
}

/// Usage of one window, reported on the health endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowUsage {
    pub window_secs: f64,
    pub limit: usize,
    pub used: usize,
    /// Human-readable `used/limit`.
    pub capacity: String,
}

/// Process-wide pacing primitive shared by every job.
pub struct QuotaLimiter {
    windows: Vec<QuotaWindow>,
    longest: Duration,
    /// Grant times, oldest first. Pruned to the longest window on access.
    timestamps: Mutex<VecDeque<Instant>>,
    /// Keeps waiters in arrival order.
    turnstile: tokio::sync::Mutex<()>,
}

impl QuotaLimiter {
    /// Create a limiter over the given windows.
    ///
    /// Limits are expected to be validated by the configuration layer; a zero
    /// limit is treated as one so a misconfigured window cannot stall forever.
    pub fn new(windows: Vec<QuotaWindow>) -> Self {
        let windows: Vec<QuotaWindow> = windows
            .into_iter()
            .map(|w| QuotaWindow::new(w.limit.max(1), w.duration))
            .collect();
        let longest = windows
            .iter()
            .map(|w| w.duration)
            .max()
            .unwrap_or_default();

        Self {
            windows,
            longest,
            timestamps: Mutex::new(VecDeque::new()),
            turnstile: tokio::sync::Mutex::new(()),
        }
    }

    /// Wait until a slot is free in every window, then record one usage.
    pub async fn reserve(&self) {
        let _turn = self.turnstile.lock().await;

        loop {
            let wait = {
                let mut stamps = self.lock_stamps();
                let now = Instant::now();
                self.prune(&mut stamps, now);

                match self.required_wait(&stamps, now) {
                    None => {
                        stamps.push_back(now);
                        return;
                    }
                    Some(wait) => wait,
                }
            };

            debug!(
                wait_ms = wait.as_millis() as u64,
                "Telemetry quota window full, pacing request"
            );
            tokio::time::sleep(wait).await;
        }
    }

    /// Current usage of every window.
    pub fn snapshot(&self) -> Vec<WindowUsage> {
        let mut stamps = self.lock_stamps();
        let now = Instant::now();
        self.prune(&mut stamps, now);

        self.windows
            .iter()
            .map(|window| {
                let used = stamps.len() - Self::window_start(&stamps, window, now);
                WindowUsage {
                    window_secs: window.duration.as_secs_f64(),
                    limit: window.limit,
                    used,
                    capacity: format!("{}/{}", used, window.limit),
                }
            })
            .collect()
    }

    fn lock_stamps(&self) -> MutexGuard<'_, VecDeque<Instant>> {
        self.timestamps
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn prune(&self, stamps: &mut VecDeque<Instant>, now: Instant) {
        while let Some(&oldest) = stamps.front() {
            if now.saturating_duration_since(oldest) >= self.longest {
                stamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// Index of the first timestamp still inside `window`.
    fn window_start(stamps: &VecDeque<Instant>, window: &QuotaWindow, now: Instant) -> usize {
        stamps.partition_point(|ts| now.saturating_duration_since(*ts) >= window.duration)
    }

    /// How long until every window has headroom, or `None` if it has now.
    fn required_wait(&self, stamps: &VecDeque<Instant>, now: Instant) -> Option<Duration> {
        let mut wait: Option<Duration> = None;

        for window in &self.windows {
            let start = Self::window_start(stamps, window, now);
            let used = stamps.len() - start;
            if used < window.limit {
                continue;
            }

            // Dropping this timestamp out of the window brings usage to limit - 1.
            let blocking = stamps[start + used - window.limit];
            let until = (blocking + window.duration).saturating_duration_since(now);
            wait = Some(wait.map_or(until, |w| w.max(until)));
        }

        wait
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio_test::{assert_pending, assert_ready};

    fn dual(per_second: usize, per_two_minutes: usize) -> QuotaLimiter {
        QuotaLimiter::new(vec![
            QuotaWindow::new(per_second, Duration::from_secs(1)),
            QuotaWindow::new(per_two_minutes, Duration::from_secs(120)),
        ])
    }

    /// Counts grants inside `(t - duration, t]` for every grant `t`.
    fn max_in_window(grants: &[Instant], duration: Duration) -> usize {
        grants
            .iter()
            .map(|&t| {
                grants
                    .iter()
                    .filter(|&&g| g <= t && t.saturating_duration_since(g) < duration)
                    .count()
            })
            .max()
            .unwrap_or(0)
    }

    async fn reserve_concurrently(limiter: Arc<QuotaLimiter>, n: usize) -> Vec<Instant> {
        let handles: Vec<_> = (0..n)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move {
                    limiter.reserve().await;
                    Instant::now()
                })
            })
            .collect();

        let mut grants = Vec::with_capacity(n);
        for handle in handles {
            grants.push(handle.await.unwrap());
        }
        grants.sort();
        grants
    }

    #[tokio::test(start_paused = true)]
    async fn test_grants_immediately_with_headroom() {
        let limiter = dual(20, 100);
        let start = Instant::now();
        for _ in 0..20 {
            limiter.reserve().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_is_paced_by_short_window() {
        let limiter = Arc::new(dual(20, 200));
        let start = Instant::now();

        let grants = reserve_concurrently(Arc::clone(&limiter), 50).await;

        // 20 at t=0, 20 at t=1s, 10 at t=2s.
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert!(max_in_window(&grants, Duration::from_secs(1)) <= 20);
        assert!(max_in_window(&grants, Duration::from_secs(120)) <= 200);
        assert_eq!(grants.len(), 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_window_blocks_until_oldest_expires() {
        let limiter = Arc::new(QuotaLimiter::new(vec![
            QuotaWindow::new(5, Duration::from_secs(1)),
            QuotaWindow::new(8, Duration::from_secs(10)),
        ]));
        let start = Instant::now();

        let grants = reserve_concurrently(Arc::clone(&limiter), 10).await;

        assert!(grants[8].duration_since(start) >= Duration::from_secs(10));
        assert!(max_in_window(&grants, Duration::from_secs(1)) <= 5);
        assert!(max_in_window(&grants, Duration::from_secs(10)) <= 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reserve_pending_when_window_full() {
        let limiter = QuotaLimiter::new(vec![QuotaWindow::new(2, Duration::from_secs(1))]);

        let mut first = tokio_test::task::spawn(limiter.reserve());
        assert_ready!(first.poll());
        drop(first);
        limiter.reserve().await;

        let mut third = tokio_test::task::spawn(limiter.reserve());
        assert_pending!(third.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_reports_usage_and_expiry() {
        let limiter = dual(20, 100);
        for _ in 0..3 {
            limiter.reserve().await;
        }

        let usage = limiter.snapshot();
        assert_eq!(usage.len(), 2);
        assert_eq!(usage[0].used, 3);
        assert_eq!(usage[0].capacity, "3/20");
        assert_eq!(usage[1].capacity, "3/100");

        tokio::time::advance(Duration::from_millis(1500)).await;
        let usage = limiter.snapshot();
        assert_eq!(usage[0].used, 0);
        assert_eq!(usage[1].used, 3);
    }

    #[test]
    fn test_zero_limit_is_clamped() {
        let limiter = QuotaLimiter::new(vec![QuotaWindow::new(0, Duration::from_secs(1))]);
        assert_eq!(limiter.windows[0].limit, 1);
    }
}
