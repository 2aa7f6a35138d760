//! Delay generation for staying under external throttling.
//!
//! The scheduler only hands out durations. Sleeping (and cutting a sleep
//! short on cancellation) is the orchestrator's job.

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::infra::config::duration_secs;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    #[serde(rename = "min_delay_secs", with = "duration_secs")]
    pub min_delay: Duration,
    #[serde(rename = "max_delay_secs", with = "duration_secs")]
    pub max_delay: Duration,
    /// Tasks per batch; 0 disables batch pauses.
    pub batch_size: usize,
    #[serde(rename = "batch_min_delay_secs", with = "duration_secs")]
    pub batch_min_delay: Duration,
    #[serde(rename = "batch_max_delay_secs", with = "duration_secs")]
    pub batch_max_delay: Duration,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(10),
            batch_size: 3,
            batch_min_delay: Duration::from_secs(5),
            batch_max_delay: Duration::from_secs(60),
        }
    }
}

impl PacingConfig {
    /// No pauses at all.
    pub fn none() -> Self {
        Self {
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            batch_size: 0,
            batch_min_delay: Duration::ZERO,
            batch_max_delay: Duration::ZERO,
        }
    }

    /// Fixed delays, mostly useful for tests.
    pub fn fixed(task_delay: Duration, batch_size: usize, batch_delay: Duration) -> Self {
        Self {
            min_delay: task_delay,
            max_delay: task_delay,
            batch_size,
            batch_min_delay: batch_delay,
            batch_max_delay: batch_delay,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        const CEILING: Duration = Duration::from_secs(24 * 60 * 60);
        for (name, value) in [
            ("max_delay_secs", self.max_delay),
            ("batch_max_delay_secs", self.batch_max_delay),
        ] {
            if value > CEILING {
                return Err(format!("pacing.{name} must not exceed one day"));
            }
        }
        Ok(())
    }
}

/// Produces randomized inter-task and inter-batch delays.
pub struct RateScheduler<R = StdRng> {
    config: PacingConfig,
    rng: R,
}

impl RateScheduler<StdRng> {
    pub fn new(config: PacingConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Reproducible delays for a given seed.
    pub fn seeded(config: PacingConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }
}

impl<R: RngCore> RateScheduler<R> {
    pub fn with_rng(mut config: PacingConfig, rng: R) -> Self {
        // Inverted bounds are a config slip, not a reason to fail a run
        if config.min_delay > config.max_delay {
            std::mem::swap(&mut config.min_delay, &mut config.max_delay);
        }
        if config.batch_min_delay > config.batch_max_delay {
            std::mem::swap(&mut config.batch_min_delay, &mut config.batch_max_delay);
        }
        Self { config, rng }
    }

    pub fn config(&self) -> &PacingConfig {
        &self.config
    }

    /// Delay before the task at `index`. The first task starts immediately.
    pub fn task_delay(&mut self, index: usize) -> Option<Duration> {
        if index == 0 {
            return None;
        }
        let (min, max) = (self.config.min_delay, self.config.max_delay);
        Some(self.uniform(min, max))
    }

    /// Extra pause once `completed` tasks are done, every `batch_size` tasks,
    /// as long as there is still work left out of `total`.
    pub fn batch_delay(&mut self, completed: usize, total: usize) -> Option<Duration> {
        let size = self.config.batch_size;
        if size == 0 || completed == 0 || completed >= total || completed % size != 0 {
            return None;
        }
        let (min, max) = (self.config.batch_min_delay, self.config.batch_max_delay);
        Some(self.uniform(min, max))
    }

    fn uniform(&mut self, min: Duration, max: Duration) -> Duration {
        let lo = min.as_nanos().min(u64::MAX as u128) as u64;
        let hi = max.as_nanos().min(u64::MAX as u128) as u64;
        Duration::from_nanos(self.rng.gen_range(lo..=hi))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PacingConfig {
        PacingConfig {
            min_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(10),
            batch_size: 10,
            batch_min_delay: Duration::from_secs(30),
            batch_max_delay: Duration::from_secs(60),
        }
    }

    #[test]
    fn first_task_has_no_delay() {
        let mut scheduler = RateScheduler::seeded(config(), 7);
        assert_eq!(scheduler.task_delay(0), None);
        assert!(scheduler.task_delay(1).is_some());
    }

    #[test]
    fn task_delays_stay_in_bounds() {
        let mut scheduler = RateScheduler::seeded(config(), 42);
        for index in 1..500 {
            let delay = scheduler.task_delay(index).unwrap();
            assert!(delay >= Duration::from_secs(5) && delay <= Duration::from_secs(10));
        }
    }

    #[test]
    fn batch_delays_stay_in_bounds() {
        let mut scheduler = RateScheduler::seeded(config(), 42);
        for batch in 1..100 {
            let delay = scheduler.batch_delay(batch * 10, usize::MAX).unwrap();
            assert!(delay >= Duration::from_secs(30) && delay <= Duration::from_secs(60));
        }
    }

    #[test]
    fn twelve_tasks_get_one_batch_pause_after_the_tenth() {
        let mut scheduler = RateScheduler::seeded(config(), 1);
        let pauses: Vec<usize> = (1..=12)
            .filter(|&done| scheduler.batch_delay(done, 12).is_some())
            .collect();
        assert_eq!(pauses, vec![10]);
    }

    #[test]
    fn no_batch_pause_after_the_last_task() {
        let mut scheduler = RateScheduler::seeded(config(), 1);
        assert_eq!(scheduler.batch_delay(10, 10), None);
        assert_eq!(scheduler.batch_delay(20, 20), None);
        assert!(scheduler.batch_delay(10, 20).is_some());
    }

    #[test]
    fn zero_batch_size_disables_batch_pauses() {
        let mut scheduler = RateScheduler::seeded(PacingConfig::none(), 1);
        assert!((1..50).all(|done| scheduler.batch_delay(done, 100).is_none()));
    }

    #[test]
    fn same_seed_same_delays() {
        let mut a = RateScheduler::seeded(config(), 99);
        let mut b = RateScheduler::seeded(config(), 99);
        for index in 1..20 {
            assert_eq!(a.task_delay(index), b.task_delay(index));
        }
    }

    #[test]
    fn inverted_bounds_are_swapped() {
        let inverted = PacingConfig {
            min_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(5),
            ..config()
        };
        let scheduler = RateScheduler::seeded(inverted, 3);
        assert_eq!(scheduler.config().min_delay, Duration::from_secs(5));
        assert_eq!(scheduler.config().max_delay, Duration::from_secs(10));
    }

    #[test]
    fn fixed_config_is_exact() {
        let mut scheduler =
            RateScheduler::seeded(PacingConfig::fixed(Duration::from_secs(2), 3, Duration::from_secs(9)), 5);
        assert_eq!(scheduler.task_delay(4), Some(Duration::from_secs(2)));
        assert_eq!(scheduler.batch_delay(3, 4), Some(Duration::from_secs(9)));
    }
}
