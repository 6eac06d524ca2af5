// SPDX-License-Identifier: GPL-3.0-only

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with jitter.
///
/// Each `next_delay` returns the current duration with jitter applied, then multiplies the
/// duration by `factor` until `steps` multiplications have happened. After that the
/// duration stays constant.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    duration: Duration,
    factor: f64,
    jitter: f64,
    steps: u32,
    remaining: u32,
}

impl Backoff {
    pub fn new(base: Duration, factor: f64, jitter: f64, steps: u32) -> Self {
        Self {
            base,
            duration: base,
            factor,
            jitter,
            steps,
            remaining: steps,
        }
    }

    /// Read-failure backoff of the mount listener: 10s, factor 5, 10% jitter, four steps
    pub fn mount_listener() -> Self {
        Self::new(Duration::from_secs(10), 5.0, 0.1, 4)
    }

    pub fn next_delay(&mut self) -> Duration {
        let current = self.duration;
        if self.remaining > 0 {
            self.remaining -= 1;
            self.duration = current.mul_f64(self.factor);
        }
        self.with_jitter(current)
    }

    pub fn reset(&mut self) {
        self.duration = self.base;
        self.remaining = self.steps;
    }

    fn with_jitter(&self, duration: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return duration;
        }
        let spread: f64 = rand::thread_rng().gen_range(0.0..=self.jitter);
        duration + duration.mul_f64(spread)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_then_caps_without_jitter() {
        let mut backoff = Backoff::new(Duration::from_secs(10), 5.0, 0.0, 4);
        let delays: Vec<u64> = (0..6).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![10, 50, 250, 1250, 6250, 6250]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(10));
    }

    #[test]
    fn jitter_stays_within_bound() {
        let mut backoff = Backoff::mount_listener();
        for _ in 0..20 {
            backoff.reset();
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_secs(10));
            assert!(delay <= Duration::from_secs(11));
        }
    }
}
