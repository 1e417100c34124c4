//! Retry backoff strategies.
//!
//! A strategy maps a 1-based attempt number to a non-negative delay.
//! Jitter, when configured, is symmetric: `delay ± delay·ratio·rand()`.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

/// Attempt-number → delay.
///
/// # Example
///
/// ```ignore
/// let strategy = BackoffStrategy::exponential(
///     Duration::from_millis(200),
///     2.0,
///     Duration::from_secs(30),
/// );
/// assert_eq!(strategy.next_delay(1), Duration::from_millis(200));
/// assert_eq!(strategy.next_delay(3), Duration::from_millis(800));
/// ```
#[derive(Clone)]
pub enum BackoffStrategy {
    /// Constant delay with optional symmetric jitter ratio in `[0, 1]`.
    Fixed {
        delay: Duration,
        jitter: Option<f64>,
    },
    /// `base · factor^(attempt-1)`, clamped to `max_delay`, with optional
    /// symmetric jitter.
    Exponential {
        base: Duration,
        factor: f64,
        max_delay: Duration,
        jitter: Option<f64>,
    },
    /// Arbitrary pure function of the attempt number, clamped at zero.
    Custom(Arc<dyn Fn(u32) -> Duration + Send + Sync>),
}

impl BackoffStrategy {
    /// Constant delay.
    pub fn fixed(delay: Duration) -> Self {
        BackoffStrategy::Fixed {
            delay,
            jitter: None,
        }
    }

    /// Constant delay with jitter ratio in `[0, 1]`.
    pub fn fixed_with_jitter(delay: Duration, jitter: f64) -> Self {
        BackoffStrategy::Fixed {
            delay,
            jitter: Some(jitter),
        }
    }

    /// Exponential delay clamped to `max_delay`.
    pub fn exponential(base: Duration, factor: f64, max_delay: Duration) -> Self {
        BackoffStrategy::Exponential {
            base,
            factor,
            max_delay,
            jitter: None,
        }
    }

    /// Exponential delay with jitter ratio in `[0, 1]`.
    pub fn exponential_with_jitter(
        base: Duration,
        factor: f64,
        max_delay: Duration,
        jitter: f64,
    ) -> Self {
        BackoffStrategy::Exponential {
            base,
            factor,
            max_delay,
            jitter: Some(jitter),
        }
    }

    /// Custom strategy from a pure function of the attempt number.
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        BackoffStrategy::Custom(Arc::new(f))
    }

    /// Delay before the given 1-based attempt.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        match self {
            BackoffStrategy::Fixed { delay, jitter } => apply_jitter(*delay, *jitter),
            BackoffStrategy::Exponential {
                base,
                factor,
                max_delay,
                jitter,
            } => {
                let exp = attempt.saturating_sub(1).min(63);
                let raw = base.as_millis() as f64 * factor.max(0.0).powi(exp as i32);
                let clamped = raw.min(max_delay.as_millis() as f64).max(0.0);
                apply_jitter(Duration::from_millis(clamped as u64), *jitter)
            }
            BackoffStrategy::Custom(f) => (f.as_ref())(attempt),
        }
    }
}

fn apply_jitter(delay: Duration, jitter: Option<f64>) -> Duration {
    let Some(ratio) = jitter else {
        return delay;
    };
    let ratio = ratio.clamp(0.0, 1.0);
    if ratio == 0.0 || delay.is_zero() {
        return delay;
    }
    let spread: f64 = rand::thread_rng().gen_range(-1.0..=1.0);
    let millis = delay.as_millis() as f64 * (1.0 + ratio * spread);
    Duration::from_millis(millis.max(0.0) as u64)
}

impl std::fmt::Debug for BackoffStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackoffStrategy::Fixed { delay, jitter } => f
                .debug_struct("Fixed")
                .field("delay", delay)
                .field("jitter", jitter)
                .finish(),
            BackoffStrategy::Exponential {
                base,
                factor,
                max_delay,
                jitter,
            } => f
                .debug_struct("Exponential")
                .field("base", base)
                .field("factor", factor)
                .field("max_delay", max_delay)
                .field("jitter", jitter)
                .finish(),
            BackoffStrategy::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed() {
        let strategy = BackoffStrategy::fixed(Duration::from_millis(500));
        assert_eq!(strategy.next_delay(1), Duration::from_millis(500));
        assert_eq!(strategy.next_delay(7), Duration::from_millis(500));
    }

    #[test]
    fn test_exponential_growth_and_clamp() {
        let strategy = BackoffStrategy::exponential(
            Duration::from_millis(100),
            2.0,
            Duration::from_millis(1_000),
        );
        assert_eq!(strategy.next_delay(1), Duration::from_millis(100));
        assert_eq!(strategy.next_delay(2), Duration::from_millis(200));
        assert_eq!(strategy.next_delay(4), Duration::from_millis(800));
        // 100 * 2^4 = 1600, clamped.
        assert_eq!(strategy.next_delay(5), Duration::from_millis(1_000));
        assert_eq!(strategy.next_delay(20), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_stays_within_band() {
        let strategy =
            BackoffStrategy::fixed_with_jitter(Duration::from_millis(1_000), 0.5);
        for _ in 0..100 {
            let d = strategy.next_delay(1).as_millis();
            assert!((500..=1_500).contains(&d), "delay {d} out of band");
        }
    }

    #[test]
    fn test_custom_clamps_at_zero() {
        let strategy = BackoffStrategy::custom(|attempt| {
            Duration::from_millis(1_000u64.saturating_sub(attempt as u64 * 400))
        });
        assert_eq!(strategy.next_delay(1), Duration::from_millis(600));
        assert_eq!(strategy.next_delay(3), Duration::ZERO);
    }

    #[test]
    fn test_zero_jitter_ratio_is_exact() {
        let strategy = BackoffStrategy::fixed_with_jitter(Duration::from_millis(250), 0.0);
        assert_eq!(strategy.next_delay(1), Duration::from_millis(250));
    }

    #[test]
    fn test_debug_does_not_panic() {
        let custom = BackoffStrategy::custom(|_| Duration::ZERO);
        assert!(format!("{custom:?}").contains("Custom"));
    }
}
