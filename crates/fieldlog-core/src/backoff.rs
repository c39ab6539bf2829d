// ABOUTME: Exponential backoff with jitter for sync retries, plus the per-job retry bookkeeping.
// ABOUTME: The delay computation is a pure function of the attempt count and a jitter sample.

use serde::{Deserialize, Serialize};

/// Retry policy for the sync queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    /// Fraction of the delay added or removed at random, in `[0, 1)`.
    pub jitter_factor: f64,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 5_000,
            multiplier: 2.0,
            max_delay_ms: 300_000,
            jitter_factor: 0.2,
            max_attempts: 10,
        }
    }
}

impl BackoffPolicy {
    /// Delay before the next attempt, without jitter:
    /// `min(base * multiplier^(attempts-1), max)`.
    pub fn base_delay(&self, attempts: u32) -> u64 {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.base_delay_ms as f64 * self.multiplier.powi(exponent);
        if !raw.is_finite() || raw >= self.max_delay_ms as f64 {
            self.max_delay_ms
        } else {
            raw as u64
        }
    }

    /// Delay with jitter applied. `sample` is a uniform value in `[0, 1]`;
    /// 0 maps to `-jitter`, 1 to `+jitter`.
    pub fn delay_ms(&self, attempts: u32, sample: f64) -> u64 {
        let base = self.base_delay(attempts) as f64;
        let sample = sample.clamp(0.0, 1.0);
        let factor = 1.0 + self.jitter_factor * (2.0 * sample - 1.0);
        (base * factor).max(0.0).round() as u64
    }

    /// Delay with a random jitter sample.
    pub fn jittered_delay(&self, attempts: u32) -> u64 {
        self.delay_ms(attempts, fastrand::f64())
    }

    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

/// Retry bookkeeping for one queued job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryMeta {
    pub attempts: u32,
    pub last_attempt: u64,
    pub next_retry: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl RetryMeta {
    /// Record a failed attempt at `now_ms` and schedule the next one.
    /// `attempts` is capped at the policy maximum.
    pub fn record_failure(
        previous: Option<&RetryMeta>,
        policy: &BackoffPolicy,
        now_ms: u64,
        sample: f64,
        error: impl Into<String>,
    ) -> Self {
        let attempts = previous
            .map_or(0, |m| m.attempts)
            .saturating_add(1)
            .min(policy.max_attempts.max(1));
        let delay = policy.delay_ms(attempts, sample);
        Self {
            attempts,
            last_attempt: now_ms,
            next_retry: now_ms.saturating_add(delay),
            last_error: Some(error.into()),
        }
    }

    pub fn is_due(&self, now_ms: u64) -> bool {
        self.next_retry <= now_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            base_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter_factor: 0.25,
            max_attempts: 8,
        }
    }

    #[test]
    fn base_delay_grows_exponentially_until_capped() {
        let p = policy();
        let delays: Vec<u64> = (1..=7).map(|a| p.base_delay(a)).collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000]);
    }

    #[test]
    fn zero_attempts_behaves_like_first() {
        assert_eq!(policy().base_delay(0), 1_000);
    }

    #[test]
    fn base_delay_is_non_decreasing() {
        let p = policy();
        let mut previous = 0;
        for attempts in 1..=64 {
            let d = p.base_delay(attempts);
            assert!(d >= previous, "delay dropped at attempt {attempts}");
            previous = d;
        }
        assert_eq!(previous, p.max_delay_ms);
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        assert_eq!(policy().base_delay(u32::MAX), 30_000);
    }

    #[test]
    fn jitter_stays_within_bounds_once_capped() {
        let p = policy();
        let cap = p.max_delay_ms as f64;
        let low = (cap * (1.0 - p.jitter_factor)) as u64;
        let high = (cap * (1.0 + p.jitter_factor)) as u64;

        assert_eq!(p.delay_ms(20, 0.0), low);
        assert_eq!(p.delay_ms(20, 1.0), high);
        assert_eq!(p.delay_ms(20, 0.5), p.max_delay_ms);
        for _ in 0..1_000 {
            let d = p.jittered_delay(20);
            assert!((low..=high).contains(&d), "{d} outside [{low}, {high}]");
        }
    }

    #[test]
    fn record_failure_increments_and_caps_attempts() {
        let p = policy();
        let mut meta = RetryMeta::record_failure(None, &p, 10_000, 0.5, "HTTP 500");
        assert_eq!(meta.attempts, 1);
        assert_eq!(meta.next_retry, 11_000);
        assert!(!meta.is_due(10_500));
        assert!(meta.is_due(11_000));

        for _ in 0..20 {
            meta = RetryMeta::record_failure(Some(&meta), &p, 10_000, 0.5, "HTTP 500");
        }
        assert_eq!(meta.attempts, p.max_attempts);
        assert!(p.is_exhausted(meta.attempts));
        assert_eq!(meta.last_error.as_deref(), Some("HTTP 500"));
    }
}
