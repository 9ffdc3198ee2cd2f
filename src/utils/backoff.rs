//! Exponential backoff helpers.

use rand::Rng;
use std::time::Duration;

/// Backoff schedule for reopening engine connections: 100ms, 400ms, 1.6s,
/// each jittered +/-20%.
pub fn connect_backoff(attempt: u32) -> Duration {
    let base_ms = 100u64.saturating_mul(4u64.saturating_pow(attempt));
    jitter_pct(Duration::from_millis(base_ms), 0.2)
}

/// Full-jitter exponential backoff for task retries, capped at 10s.
pub fn task_retry_backoff(attempt: u32) -> Duration {
    let cap_ms = 10_000u64;
    let base_ms = 500u64
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(cap_ms);
    let ms = rand::thread_rng().gen_range(0..=base_ms);
    Duration::from_millis(ms)
}

/// Apply a symmetric percentage jitter to a duration.
pub fn jitter_pct(base: Duration, pct: f64) -> Duration {
    let factor = rand::thread_rng().gen_range(1.0 - pct..=1.0 + pct);
    Duration::from_millis((base.as_millis() as f64 * factor) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_backoff_grows_geometrically() {
        for attempt in 0..3 {
            let d = connect_backoff(attempt);
            let base = 100u64 * 4u64.pow(attempt);
            let lo = (base as f64 * 0.8) as u64;
            let hi = (base as f64 * 1.2) as u64;
            assert!(
                (lo..=hi).contains(&(d.as_millis() as u64)),
                "attempt {}: {:?} outside [{}ms, {}ms]",
                attempt,
                d,
                lo,
                hi
            );
        }
    }

    #[test]
    fn task_retry_backoff_is_capped() {
        for attempt in 0..16 {
            assert!(task_retry_backoff(attempt) <= Duration::from_secs(10));
        }
    }
}
