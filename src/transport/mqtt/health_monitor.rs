//! Pure health monitoring and backoff logic for the cloud link
//!
//! The reconnector evaluates connection health on every tick. Consecutive
//! unhealthy ticks double the retry interval; an interval that would exceed the
//! ceiling wraps back to the floor rather than saturating, so a long outage is
//! followed by a burst of quick probes instead of pinning at the ceiling.

use std::time::Duration;
use tracing::debug;

/// Minimum retry interval in milliseconds
pub const MIN_BACKOFF_MS: u64 = 1_000;
/// Maximum retry interval in milliseconds
pub const MAX_BACKOFF_MS: u64 = 120_000;

/// Floor and ceiling of the retry interval
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub floor_ms: u64,
    pub ceiling_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            floor_ms: MIN_BACKOFF_MS,
            ceiling_ms: MAX_BACKOFF_MS,
        }
    }
}

impl BackoffPolicy {
    /// Validate policy bounds (pure function)
    pub fn validate(&self) -> Result<(), String> {
        if self.floor_ms == 0 {
            return Err("backoff floor must be greater than 0".to_string());
        }
        if self.ceiling_ms < self.floor_ms {
            return Err(format!(
                "backoff ceiling {} is below floor {}",
                self.ceiling_ms, self.floor_ms
            ));
        }
        Ok(())
    }

    /// Next interval after a failed health check (pure function)
    pub fn next_interval(&self, current_ms: u64) -> u64 {
        let doubled = current_ms.saturating_mul(2);
        if doubled > self.ceiling_ms {
            self.floor_ms
        } else {
            doubled
        }
    }
}

/// Retry timing state owned by the reconnector
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    interval_ms: u64,
    last_attempt_ms: Option<u64>,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            interval_ms: policy.floor_ms,
            last_attempt_ms: None,
        }
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }

    pub fn last_attempt_ms(&self) -> Option<u64> {
        self.last_attempt_ms
    }

    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }

    /// Healthy tick: return to the floor
    pub fn on_healthy(&mut self) {
        self.interval_ms = self.policy.floor_ms;
    }

    /// Unhealthy tick: grow the interval and report whether an attempt is due
    pub fn on_unhealthy(&mut self, now_ms: u64) -> bool {
        self.interval_ms = self.policy.next_interval(self.interval_ms);
        debug!(interval_ms = self.interval_ms, "Connection unhealthy");
        self.attempt_due(now_ms)
    }

    /// An attempt is due when none was made yet or the interval has elapsed
    pub fn attempt_due(&self, now_ms: u64) -> bool {
        match self.last_attempt_ms {
            None => true,
            Some(last) => now_ms.saturating_sub(last) > self.interval_ms,
        }
    }

    pub fn record_attempt(&mut self, now_ms: u64) {
        self.last_attempt_ms = Some(now_ms);
    }
}

/// Settings for the connected-status poll
///
/// Connected status may lag briefly after a send, so an unhealthy verdict is
/// only reached after several spaced reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthProbe {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for HealthProbe {
    fn default() -> Self {
        Self {
            attempts: 10,
            delay: Duration::from_millis(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_backoff_default_policy() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.floor_ms, 1_000);
        assert_eq!(policy.ceiling_ms, 120_000);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_seven_failures_wrap_to_floor() {
        let mut backoff = Backoff::new(BackoffPolicy::default());
        assert_eq!(backoff.interval_ms(), 1_000);

        let observed: Vec<u64> = (0..7)
            .map(|_| {
                backoff.on_unhealthy(0);
                backoff.interval_ms()
            })
            .collect();

        assert_eq!(
            observed,
            vec![2_000, 4_000, 8_000, 16_000, 32_000, 64_000, 1_000]
        );
    }

    #[test]
    fn test_healthy_resets_interval() {
        let mut backoff = Backoff::new(BackoffPolicy::default());
        for _ in 0..4 {
            backoff.on_unhealthy(0);
        }
        assert_eq!(backoff.interval_ms(), 16_000);

        backoff.on_healthy();
        assert_eq!(backoff.interval_ms(), 1_000);
    }

    #[test]
    fn test_first_attempt_always_due() {
        let mut backoff = Backoff::new(BackoffPolicy::default());
        assert!(backoff.on_unhealthy(0));
    }

    #[test]
    fn test_attempt_waits_for_interval() {
        let mut backoff = Backoff::new(BackoffPolicy::default());
        assert!(backoff.on_unhealthy(10_000));
        backoff.record_attempt(10_000);

        // interval is now 4000: not due at +4000, due strictly after
        assert!(!backoff.on_unhealthy(14_000));
        assert_eq!(backoff.interval_ms(), 4_000);
        assert!(backoff.attempt_due(14_001));
    }

    #[test]
    fn test_validate_policy() {
        let zero_floor = BackoffPolicy {
            floor_ms: 0,
            ceiling_ms: 10,
        };
        assert!(zero_floor.validate().is_err());

        let inverted = BackoffPolicy {
            floor_ms: 500,
            ceiling_ms: 100,
        };
        assert!(inverted.validate().is_err());
    }

    proptest! {
        #[test]
        fn prop_interval_doubles_or_wraps(failures in 1usize..200) {
            let policy = BackoffPolicy::default();
            let mut backoff = Backoff::new(policy);
            let mut previous = backoff.interval_ms();

            for _ in 0..failures {
                backoff.on_unhealthy(0);
                let current = backoff.interval_ms();
                if previous * 2 > policy.ceiling_ms {
                    prop_assert_eq!(current, policy.floor_ms);
                } else {
                    prop_assert_eq!(current, previous * 2);
                }
                prop_assert!(current <= policy.ceiling_ms);
                previous = current;
            }
        }

        #[test]
        fn prop_healthy_always_resets(failures in 0usize..50, floor in 1u64..5_000, factor in 1u64..200) {
            let policy = BackoffPolicy { floor_ms: floor, ceiling_ms: floor * factor };
            let mut backoff = Backoff::new(policy);
            for _ in 0..failures {
                backoff.on_unhealthy(0);
            }
            backoff.on_healthy();
            prop_assert_eq!(backoff.interval_ms(), floor);
        }
    }
}
