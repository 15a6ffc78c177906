//! Bounded exponential-backoff polling.
//!
//! Used both to wait for a new endpoint to become routable and to wait for
//! a deleted resource group to disappear; only the probe differs.
//!
//! Schedule: sleep `initial_wait` once (skipped when zero), then probe.
//! After the n-th failed probe sleep `base_delay * 2^n` and probe again,
//! up to `max_attempts` probes in total. No sleep follows the last probe.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

/// Result of a polling run. Exhaustion is a value, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The probe returned true on this attempt.
    Ready { attempts: u32 },
    /// Every attempt failed.
    Exhausted { attempts: u32 },
}

impl PollOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, PollOutcome::Ready { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            PollOutcome::Ready { attempts } | PollOutcome::Exhausted { attempts } => *attempts,
        }
    }
}

/// Backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Poller {
    initial_wait: Duration,
    max_attempts: u32,
    base_delay: Duration,
}

impl Poller {
    /// A poller backing off in whole seconds (`2^n` s after attempt n).
    pub fn new(initial_wait: Duration, max_attempts: u32) -> Self {
        Self {
            initial_wait,
            max_attempts: max_attempts.max(1),
            base_delay: Duration::from_secs(1),
        }
    }

    /// Scale the backoff unit.
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Sleep following the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    /// Longest a run can take before reporting exhaustion.
    pub fn worst_case(&self) -> Duration {
        (1..self.max_attempts).fold(self.initial_wait, |total, attempt| {
            total.saturating_add(self.delay_after(attempt))
        })
    }

    /// Probe until `probe` returns true or the attempts run out.
    ///
    /// `what` names the condition being waited on, for logging.
    pub async fn poll_until<F, Fut>(&self, what: &str, mut probe: F) -> PollOutcome
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        if !self.initial_wait.is_zero() {
            debug!(%what, wait = ?self.initial_wait, "waiting before first poll");
            tokio::time::sleep(self.initial_wait).await;
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            if probe().await {
                debug!(%what, attempt, "poll condition met");
                return PollOutcome::Ready { attempts: attempt };
            }

            if attempt >= self.max_attempts {
                warn!(%what, attempts = attempt, "gave up polling");
                return PollOutcome::Exhausted { attempts: attempt };
            }

            let delay = self.delay_after(attempt);
            debug!(%what, attempt, ?delay, "poll condition not met, backing off");
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;

    #[test]
    fn delay_doubles_per_attempt() {
        let poller = Poller::new(Duration::from_secs(20), 6);
        let delays: Vec<u64> = (1..6).map(|a| poller.delay_after(a).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 32]);
    }

    #[test]
    fn worst_case_sums_schedule() {
        let poller = Poller::new(Duration::from_secs(20), 6);
        // 20 + 2 + 4 + 8 + 16 + 32
        assert_eq!(poller.worst_case(), Duration::from_secs(82));
    }

    #[test]
    fn zero_attempts_clamped_to_one() {
        let poller = Poller::new(Duration::ZERO, 0);
        assert_eq!(poller.max_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let poller = Poller::new(Duration::from_secs(20), 6);
        let probe_times = Arc::new(Mutex::new(Vec::new()));
        let start = Instant::now();

        let times = probe_times.clone();
        let outcome = poller
            .poll_until("never", move || {
                let times = times.clone();
                async move {
                    times.lock().unwrap().push(start.elapsed());
                    false
                }
            })
            .await;

        assert_eq!(outcome, PollOutcome::Exhausted { attempts: 6 });
        let times = probe_times.lock().unwrap();
        assert_eq!(times.len(), 6);

        let secs: Vec<u64> = times.iter().map(|d| d.as_secs()).collect();
        assert_eq!(secs, vec![20, 22, 26, 34, 50, 82]);

        let gaps: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();
        assert!(gaps.windows(2).all(|g| g[1] > g[0]), "schedule must grow: {gaps:?}");
        assert_eq!(start.elapsed(), Duration::from_secs(82));
    }

    #[tokio::test(start_paused = true)]
    async fn returns_ready_on_matching_attempt() {
        let poller = Poller::new(Duration::from_secs(20), 6);
        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();

        let counter = calls.clone();
        let outcome = poller
            .poll_until("third time", move || {
                let counter = counter.clone();
                async move { counter.fetch_add(1, Ordering::SeqCst) + 1 == 3 }
            })
            .await;

        assert_eq!(outcome, PollOutcome::Ready { attempts: 3 });
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(26));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_initial_wait_probes_immediately() {
        let poller = Poller::new(Duration::ZERO, 3);
        let start = Instant::now();
        let outcome = poller.poll_until("now", || async { true }).await;
        assert!(outcome.is_ready());
        assert_eq!(outcome.attempts(), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn base_delay_scales_schedule() {
        let poller = Poller::new(Duration::ZERO, 3).with_base_delay(Duration::from_millis(10));
        let start = Instant::now();
        let outcome = poller.poll_until("never", || async { false }).await;
        assert_eq!(outcome, PollOutcome::Exhausted { attempts: 3 });
        // 20ms + 40ms
        assert_eq!(start.elapsed(), Duration::from_millis(60));
    }
}
