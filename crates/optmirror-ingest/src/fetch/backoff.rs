//! Exponential retry delays

use rand::distributions::{DistIter, Uniform};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

/// An iterator over exponential wait durations.
///
/// For the `i`-th element and bounds `min_backoff` and `max_backoff` this yields
/// `min(max_backoff, 2^i * min_backoff + rand_i)` where `rand_i` is drawn uniformly from
/// `[0, max_jitter]`.
#[derive(Debug)]
pub struct ExponentialBackoff<R> {
    min_backoff: Duration,
    max_backoff: Duration,
    sequence_index: u32,
    jitter: DistIter<Uniform<u64>, R, u64>,
}

impl ExponentialBackoff<StdRng> {
    pub fn new(min_backoff: Duration, max_backoff: Duration, max_jitter: Duration) -> Self {
        Self::new_with_rng(min_backoff, max_backoff, max_jitter, StdRng::from_entropy())
    }

    pub fn new_with_seed(
        min_backoff: Duration,
        max_backoff: Duration,
        max_jitter: Duration,
        seed: u64,
    ) -> Self {
        Self::new_with_rng(min_backoff, max_backoff, max_jitter, StdRng::seed_from_u64(seed))
    }
}

impl<R: Rng> ExponentialBackoff<R> {
    pub fn new_with_rng(
        min_backoff: Duration,
        max_backoff: Duration,
        max_jitter: Duration,
        rng: R,
    ) -> Self {
        let max_jitter_ms = u64::try_from(max_jitter.as_millis()).unwrap_or(u64::MAX);
        Self {
            min_backoff,
            max_backoff,
            sequence_index: 0,
            jitter: rng.sample_iter(Uniform::new_inclusive(0, max_jitter_ms)),
        }
    }

    /// Returns the next delay and advances the sequence
    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.checked_pow(self.sequence_index).unwrap_or(u32::MAX);
        let delay = self
            .min_backoff
            .saturating_mul(factor)
            .saturating_add(self.random_offset())
            .min(self.max_backoff);

        self.sequence_index = self.sequence_index.saturating_add(1);
        delay
    }

    fn random_offset(&mut self) -> Duration {
        Duration::from_millis(self.jitter.next().unwrap_or(0))
    }
}

impl<R: Rng> Iterator for ExponentialBackoff<R> {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_delay())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_double_until_capped() {
        let delays: Vec<_> = ExponentialBackoff::new_with_seed(
            Duration::from_secs(1),
            Duration::from_secs(10),
            Duration::ZERO,
            42,
        )
        .take(6)
        .collect();

        let secs: Vec<u64> = delays.iter().map(Duration::as_secs).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 10, 10]);
    }

    #[test]
    fn test_jitter_is_bounded() {
        let min = Duration::from_millis(100);
        let jitter = Duration::from_millis(50);
        let mut backoff = ExponentialBackoff::new_with_seed(min, Duration::from_secs(60), jitter, 7);

        let first = backoff.next_delay();
        assert!(first >= min && first <= min + jitter);
    }

    #[test]
    fn test_zero_bounds_never_wait() {
        let mut backoff = ExponentialBackoff::new(Duration::ZERO, Duration::ZERO, Duration::ZERO);
        assert!(backoff.by_ref().take(20).all(|d| d.is_zero()));
    }

    #[test]
    fn test_long_sequences_saturate() {
        let mut backoff = ExponentialBackoff::new_with_seed(
            Duration::from_secs(1),
            Duration::from_secs(300),
            Duration::ZERO,
            1,
        );
        assert_eq!(backoff.nth(100), Some(Duration::from_secs(300)));
    }
}
