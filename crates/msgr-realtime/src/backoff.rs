//! Reconnect backoff and malformed-frame rate limiting.

use std::collections::VecDeque;
use std::time::Duration;

use msgr_core::EngineConfig;
use rand::Rng;
use tokio::time::Instant;

/// Exponential backoff with downward jitter.
///
/// `delay(n) = min(base * factor^n, max) * (1 - jitter * u)` with `u`
/// uniform in `[0, 1)`. With `factor >= 2` and `jitter < 0.5` every
/// uncapped delay is strictly larger than the one before it.
#[derive(Debug, Clone)]
pub struct Backoff {
    base_ms: u64,
    max_ms: u64,
    factor: f64,
    jitter: f64,
    attempt: u32,
}

impl Backoff {
    pub fn new(base_ms: u64, max_ms: u64, factor: f64, jitter: f64) -> Self {
        Self {
            base_ms,
            max_ms,
            factor,
            jitter: jitter.clamp(0.0, 0.49),
            attempt: 0,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.backoff_base_ms,
            config.backoff_max_ms,
            config.backoff_factor,
            config.backoff_jitter,
        )
    }

    /// Upper bound for attempt `n` before jitter.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let raw = self.base_ms as f64 * self.factor.powi(attempt.min(64) as i32);
        Duration::from_millis(raw.min(self.max_ms as f64) as u64)
    }

    pub fn next_delay(&mut self) -> Duration {
        let u: f64 = rand::thread_rng().gen();
        self.next_delay_with(u)
    }

    /// Same as [`next_delay`](Self::next_delay) with the random draw supplied.
    pub fn next_delay_with(&mut self, u: f64) -> Duration {
        let ceiling = self.ceiling(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        ceiling.mul_f64(1.0 - self.jitter * u.clamp(0.0, 1.0))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// Counts malformed frames in a sliding window.
#[derive(Debug)]
pub struct MalformedWindow {
    window: Duration,
    threshold: u32,
    hits: VecDeque<Instant>,
}

impl MalformedWindow {
    pub fn new(window: Duration, threshold: u32) -> Self {
        Self {
            window,
            threshold,
            hits: VecDeque::new(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.malformed_window(), config.malformed_threshold)
    }

    /// Record one malformed frame. Returns true once the count within the
    /// window exceeds the threshold.
    pub fn record(&mut self, now: Instant) -> bool {
        while let Some(&oldest) = self.hits.front() {
            if now.duration_since(oldest) > self.window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
        self.hits.push_back(now);
        self.hits.len() as u32 > self.threshold
    }

    pub fn clear(&mut self) {
        self.hits.clear();
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ceiling_grows_then_caps() {
        let backoff = Backoff::new(1_000, 60_000, 2.0, 0.3);
        assert_eq!(backoff.ceiling(0), Duration::from_secs(1));
        assert_eq!(backoff.ceiling(3), Duration::from_secs(8));
        assert_eq!(backoff.ceiling(6), Duration::from_secs(60));
        assert_eq!(backoff.ceiling(40), Duration::from_secs(60));
    }

    #[test]
    fn test_worst_case_jitter_still_increases() {
        let mut backoff = Backoff::new(1_000, 60_000, 2.0, 0.3);
        let mut last = Duration::ZERO;
        // Alternate best and worst draws; each delay must still exceed the last.
        for i in 0..6 {
            let u = if i % 2 == 0 { 0.0 } else { 0.999 };
            let delay = backoff.next_delay_with(u);
            assert!(delay > last, "{:?} <= {:?}", delay, last);
            assert!(delay <= backoff.ceiling(i));
            last = delay;
        }
        assert_eq!(backoff.attempt(), 6);
    }

    #[test]
    fn test_random_delays_within_bounds() {
        let mut backoff = Backoff::new(500, 4_000, 2.0, 0.25);
        for n in 0..10 {
            let delay = backoff.next_delay();
            let ceiling = backoff.ceiling(n);
            assert!(delay <= ceiling);
            assert!(delay >= ceiling.mul_f64(0.75));
        }
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert!(backoff.next_delay() <= Duration::from_millis(500));
    }

    #[test]
    fn test_malformed_window() {
        let start = Instant::now();
        let mut window = MalformedWindow::new(Duration::from_secs(60), 2);
        assert!(!window.record(start));
        assert!(!window.record(start + Duration::from_secs(1)));
        assert!(window.record(start + Duration::from_secs(2)));

        // Old hits fall out of the window.
        window.clear();
        assert!(!window.record(start));
        assert!(!window.record(start + Duration::from_secs(30)));
        assert!(!window.record(start + Duration::from_secs(90)));
        assert_eq!(window.len(), 2);
    }
}
