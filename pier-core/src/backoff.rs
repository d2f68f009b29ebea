// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Pier Service Contributors

//! Exponential backoff for crash restarts.
//!
//! The delay for attempt `n` is `first * factor^n`, clamped to `max`. The
//! base is derived from the attempt number alone, so delays never drift.

use std::time::Duration;

/// Retry backoff policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub first: Duration,
    /// Upper bound for any delay.
    pub max: Duration,
    /// Multiplicative growth factor (`>= 1.0`).
    pub factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            first: Duration::from_secs(1),
            max: Duration::from_secs(30),
            factor: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry `attempt` (0-indexed).
    pub fn next(&self, attempt: u32) -> Duration {
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);

        if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(first_ms: u64, max_ms: u64, factor: f64) -> BackoffPolicy {
        BackoffPolicy {
            first: Duration::from_millis(first_ms),
            max: Duration::from_millis(max_ms),
            factor,
        }
    }

    #[test]
    fn test_exponential_growth() {
        let p = policy(100, 30_000, 2.0);
        assert_eq!(p.next(0), Duration::from_millis(100));
        assert_eq!(p.next(1), Duration::from_millis(200));
        assert_eq!(p.next(2), Duration::from_millis(400));
        assert_eq!(p.next(3), Duration::from_millis(800));
    }

    #[test]
    fn test_clamped_to_max() {
        let p = policy(100, 1_000, 2.0);
        assert_eq!(p.next(10), Duration::from_secs(1));
        assert_eq!(p.next(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_first_exceeds_max() {
        let p = policy(10_000, 5_000, 2.0);
        assert_eq!(p.next(0), Duration::from_secs(5));
    }

    #[test]
    fn test_constant_factor() {
        let p = policy(500, 30_000, 1.0);
        for attempt in 0..5 {
            assert_eq!(p.next(attempt), Duration::from_millis(500));
        }
    }
}
