//! Exponential-decay rate estimator used by the File Installer's progress
//! reporting: exponential decay, half-life 250 ms.

use std::time::Instant;

const HALF_LIFE_MILLIS: f64 = 250.0;

/// Tracks bytes/sec with a 250ms half-life decay, plus a running total.
#[derive(Debug, Clone)]
pub struct RateEstimator {
    rate_bytes_per_sec: f64,
    total_bytes: u64,
    last_sample: Option<Instant>,
}

impl Default for RateEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl RateEstimator {
    /// Construct a fresh estimator with zero rate and zero bytes received.
    pub fn new() -> Self {
        RateEstimator {
            rate_bytes_per_sec: 0.0,
            total_bytes: 0,
            last_sample: None,
        }
    }

    /// Record `n` newly-received bytes at `now`.
    pub fn sample(&mut self, n: usize, now: Instant) {
        self.total_bytes += n as u64;
        let instant_rate = match self.last_sample {
            None => 0.0,
            Some(prev) => {
                let elapsed_millis = now.duration_since(prev).as_secs_f64() * 1000.0;
                if elapsed_millis <= 0.0 {
                    self.rate_bytes_per_sec
                } else {
                    n as f64 / (elapsed_millis / 1000.0)
                }
            }
        };
        // decay = 0.5 ^ (elapsed / half_life); on the very first sample we
        // have nothing to decay, so seed the rate directly.
        match self.last_sample {
            None => self.rate_bytes_per_sec = instant_rate,
            Some(prev) => {
                let elapsed_millis = now.duration_since(prev).as_secs_f64() * 1000.0;
                let decay = 0.5f64.powf(elapsed_millis / HALF_LIFE_MILLIS);
                self.rate_bytes_per_sec =
                    self.rate_bytes_per_sec * decay + instant_rate * (1.0 - decay);
            }
        }
        self.last_sample = Some(now);
    }

    /// Current smoothed rate in bytes/sec.
    pub fn rate_bytes_per_sec(&self) -> f64 {
        self.rate_bytes_per_sec
    }

    /// Total bytes received so far.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }
}

/// A point-in-time progress snapshot, surfaced over the exec session's
/// side channel (not published on the Event Bus — see DESIGN.md for why).
#[derive(Debug, Clone, serde::Serialize)]
pub struct Progress {
    /// Total bytes received so far.
    pub received_bytes: u64,
    /// Smoothed receive rate in bytes/sec.
    pub rate_bytes_per_sec: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn rate_converges_toward_steady_throughput() {
        let mut est = RateEstimator::new();
        let start = Instant::now();
        let mut t = start;
        for _ in 0..50 {
            t += Duration::from_millis(50);
            est.sample(5_000, t); // 100,000 bytes/sec steady state
        }
        assert!(est.rate_bytes_per_sec() > 50_000.0);
        assert_eq!(est.total_bytes(), 250_000);
    }

    #[test]
    fn first_sample_seeds_rate_without_division_by_zero() {
        let mut est = RateEstimator::new();
        est.sample(100, Instant::now());
        assert_eq!(est.rate_bytes_per_sec(), 0.0);
        assert_eq!(est.total_bytes(), 100);
    }
}
