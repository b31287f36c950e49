//! Backoff schedule for transient completion failures.
//!
//! The policy is pure bookkeeping: it decides whether a failed attempt is
//! retried and how long to wait first. The waiting itself happens in the
//! model call orchestrator, which owns the per-call timeout and cancellation.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the wait grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Doubles after every failed attempt.
    #[default]
    Exponential,
    /// Grows by `base_delay_ms` per failed attempt.
    Linear,
    /// Always `base_delay_ms`.
    Constant,
}

/// Randomization applied on top of the scheduled wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// Waits exactly the scheduled delay.
    None,
    /// Anywhere in `0..=scheduled`.
    #[default]
    Full,
    /// At least half of the scheduled wait.
    Equal,
    /// Between `base_delay_ms` and three times the previous wait, capped.
    Decorrelated,
}

/// Attempt ceiling and wait schedule of the model call orchestrator.
///
/// The `retry:` section of the engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempt ceiling, including the first attempt.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    /// Wait after the first failure, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound on any single wait, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Growth of the scheduled wait.
    #[serde(default)]
    pub backoff_strategy: BackoffStrategy,
    /// Randomization of the scheduled wait.
    #[serde(default)]
    pub jitter_strategy: JitterStrategy,
}

fn default_max_attempts() -> usize {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_strategy: BackoffStrategy::Exponential,
            jitter_strategy: JitterStrategy::Full,
        }
    }
}

impl RetryConfig {
    /// Three attempts, exponential backoff from one second, full jitter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempt ceiling, counting the first attempt.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Wait after the first failure.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay_ms: u64) -> Self {
        self.base_delay_ms = delay_ms;
        self
    }

    /// Cap on every wait.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay_ms: u64) -> Self {
        self.max_delay_ms = delay_ms;
        self
    }

    /// Replaces the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff_strategy = strategy;
        self
    }

    /// Replaces the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter_strategy = strategy;
        self
    }
}

/// The wait that preceded one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffRecord {
    /// Zero-based attempt index.
    pub attempt: usize,
    /// Delay given by the backoff strategy.
    #[serde(with = "duration_ms")]
    pub scheduled: Duration,
    /// Delay actually waited after jitter.
    #[serde(with = "duration_ms")]
    pub applied: Duration,
}

impl BackoffRecord {
    /// The record of a first attempt, which never waits.
    #[must_use]
    pub const fn immediate() -> Self {
        Self {
            attempt: 0,
            scheduled: Duration::ZERO,
            applied: Duration::ZERO,
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Attempt counter of one logical call.
#[derive(Debug, Default)]
pub struct RetryState {
    /// Attempts made so far.
    pub attempt: usize,
    previous_delay_ms: Option<u64>,
}

impl RetryState {
    /// State before the first attempt.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts an attempt about to be sent.
    pub fn begin_attempt(&mut self) {
        self.attempt += 1;
    }

    /// Delay before the attempt following failed attempt `failed` (zero-based),
    /// before jitter.
    #[must_use]
    pub fn scheduled_delay(failed: usize, config: &RetryConfig) -> Duration {
        let base = config.base_delay_ms;
        let max = config.max_delay_ms;
        let exponent = u32::try_from(failed).unwrap_or(u32::MAX);

        let delay = match config.backoff_strategy {
            BackoffStrategy::Exponential => base.saturating_mul(2u64.saturating_pow(exponent)),
            BackoffStrategy::Linear => base.saturating_mul(u64::from(exponent).saturating_add(1)),
            BackoffStrategy::Constant => base,
        };

        Duration::from_millis(delay.min(max))
    }

    /// Applies the configured jitter to a scheduled delay.
    pub fn jitter(&mut self, scheduled: Duration, config: &RetryConfig) -> Duration {
        let delay = u64::try_from(scheduled.as_millis()).unwrap_or(u64::MAX);
        let base = config.base_delay_ms;
        let max = config.max_delay_ms;

        let jittered = match config.jitter_strategy {
            JitterStrategy::None => delay,
            JitterStrategy::Full => {
                if delay == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=delay)
                }
            }
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half == 0 {
                    delay
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
            JitterStrategy::Decorrelated => {
                let prev = self.previous_delay_ms.unwrap_or(base);
                let upper = prev.saturating_mul(3).min(max);
                if upper <= base {
                    base.min(max)
                } else {
                    rand::thread_rng().gen_range(base..=upper)
                }
            }
        };
        self.previous_delay_ms = Some(jittered);

        Duration::from_millis(jittered)
    }

    /// Whether the ceiling is reached. A ceiling of zero still allows one attempt.
    #[must_use]
    pub fn is_exhausted(&self, config: &RetryConfig) -> bool {
        self.attempt >= config.max_attempts.max(1)
    }
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the recorded wait.
    Retry(BackoffRecord),
    /// The attempt ceiling is reached.
    GiveUp,
    /// The failure is not transient.
    NotRetryable,
}

/// Decides what follows a failed attempt.
#[must_use]
pub fn should_retry(state: &mut RetryState, config: &RetryConfig, transient: bool) -> RetryDecision {
    if !transient {
        return RetryDecision::NotRetryable;
    }
    if state.is_exhausted(config) {
        return RetryDecision::GiveUp;
    }

    let failed = state.attempt.saturating_sub(1);
    let scheduled = RetryState::scheduled_delay(failed, config);
    let applied = state.jitter(scheduled, config);

    RetryDecision::Retry(BackoffRecord {
        attempt: state.attempt,
        scheduled,
        applied,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_strategy_default() {
        assert_eq!(BackoffStrategy::default(), BackoffStrategy::Exponential);
    }

    #[test]
    fn test_jitter_strategy_default() {
        assert_eq!(JitterStrategy::default(), JitterStrategy::Full);
    }

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.base_delay_ms, 1000);
        assert_eq!(config.max_delay_ms, 30000);
    }

    #[test]
    fn test_retry_config_builder() {
        let config = RetryConfig::new()
            .with_max_attempts(5)
            .with_base_delay_ms(500)
            .with_max_delay_ms(10000)
            .with_backoff(BackoffStrategy::Linear)
            .with_jitter(JitterStrategy::None);

        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.base_delay_ms, 500);
        assert_eq!(config.backoff_strategy, BackoffStrategy::Linear);
        assert_eq!(config.jitter_strategy, JitterStrategy::None);
    }

    #[test]
    fn test_retry_config_yaml_defaults() {
        let config: RetryConfig = serde_yaml::from_str("max_attempts: 4\njitter_strategy: none\n").unwrap();
        assert_eq!(config.max_attempts, 4);
        assert_eq!(config.base_delay_ms, 1000);
        assert_eq!(config.backoff_strategy, BackoffStrategy::Exponential);
        assert_eq!(config.jitter_strategy, JitterStrategy::None);
    }

    #[test]
    fn test_retry_config_yaml_selects_strategies() {
        let config: RetryConfig = serde_yaml::from_str(
            "base_delay_ms: 100\nmax_delay_ms: 250\nbackoff_strategy: linear\njitter_strategy: decorrelated\n",
        )
        .unwrap();
        assert_eq!(config.backoff_strategy, BackoffStrategy::Linear);
        assert_eq!(config.jitter_strategy, JitterStrategy::Decorrelated);
        assert_eq!(RetryState::scheduled_delay(1, &config), Duration::from_millis(200));
        assert_eq!(RetryState::scheduled_delay(4, &config), Duration::from_millis(250));

        let constant: RetryConfig = serde_yaml::from_str("backoff_strategy: constant\n").unwrap();
        assert_eq!(RetryState::scheduled_delay(3, &constant), Duration::from_millis(1000));
    }

    #[test]
    fn test_scheduled_delay_exponential() {
        let config = RetryConfig::new().with_base_delay_ms(100);
        assert_eq!(RetryState::scheduled_delay(0, &config), Duration::from_millis(100));
        assert_eq!(RetryState::scheduled_delay(1, &config), Duration::from_millis(200));
        assert_eq!(RetryState::scheduled_delay(2, &config), Duration::from_millis(400));
    }

    #[test]
    fn test_scheduled_delay_linear_and_constant() {
        let linear = RetryConfig::new()
            .with_base_delay_ms(100)
            .with_backoff(BackoffStrategy::Linear);
        assert_eq!(RetryState::scheduled_delay(2, &linear), Duration::from_millis(300));

        let constant = RetryConfig::new()
            .with_base_delay_ms(100)
            .with_backoff(BackoffStrategy::Constant);
        assert_eq!(RetryState::scheduled_delay(5, &constant), Duration::from_millis(100));
    }

    #[test]
    fn test_scheduled_delay_capped_at_max() {
        let config = RetryConfig::new()
            .with_base_delay_ms(1000)
            .with_max_delay_ms(5000);
        assert_eq!(RetryState::scheduled_delay(10, &config), Duration::from_millis(5000));
        assert_eq!(RetryState::scheduled_delay(200, &config), Duration::from_millis(5000));
    }

    #[test]
    fn test_full_jitter_bounded() {
        let config = RetryConfig::new().with_jitter(JitterStrategy::Full);
        let mut state = RetryState::new();
        for _ in 0..20 {
            let applied = state.jitter(Duration::from_millis(100), &config);
            assert!(applied <= Duration::from_millis(100));
        }
    }

    #[test]
    fn test_equal_jitter_keeps_half() {
        let config = RetryConfig::new().with_jitter(JitterStrategy::Equal);
        let mut state = RetryState::new();
        for _ in 0..20 {
            let applied = state.jitter(Duration::from_millis(100), &config);
            assert!(applied >= Duration::from_millis(50));
            assert!(applied <= Duration::from_millis(100));
        }
    }

    #[test]
    fn test_decorrelated_jitter_within_cap() {
        let config = RetryConfig::new()
            .with_base_delay_ms(10)
            .with_max_delay_ms(50)
            .with_jitter(JitterStrategy::Decorrelated);
        let mut state = RetryState::new();
        for _ in 0..20 {
            let applied = state.jitter(Duration::from_millis(10), &config);
            assert!(applied >= Duration::from_millis(10));
            assert!(applied <= Duration::from_millis(50));
        }
    }

    #[test]
    fn test_should_retry_schedule() {
        let config = RetryConfig::new()
            .with_max_attempts(3)
            .with_base_delay_ms(100)
            .with_jitter(JitterStrategy::None);
        let mut state = RetryState::new();

        state.begin_attempt();
        let first = should_retry(&mut state, &config, true);
        assert_eq!(
            first,
            RetryDecision::Retry(BackoffRecord {
                attempt: 1,
                scheduled: Duration::from_millis(100),
                applied: Duration::from_millis(100),
            })
        );

        state.begin_attempt();
        let second = should_retry(&mut state, &config, true);
        assert!(matches!(second, RetryDecision::Retry(r) if r.scheduled == Duration::from_millis(200)));

        state.begin_attempt();
        assert_eq!(should_retry(&mut state, &config, true), RetryDecision::GiveUp);
    }

    #[test]
    fn test_should_retry_not_retryable() {
        let config = RetryConfig::new();
        let mut state = RetryState::new();
        state.begin_attempt();
        assert_eq!(should_retry(&mut state, &config, false), RetryDecision::NotRetryable);
    }

    #[test]
    fn test_zero_ceiling_allows_one_attempt() {
        let config = RetryConfig::new().with_max_attempts(0);
        let mut state = RetryState::new();
        assert!(!state.is_exhausted(&config));
        state.begin_attempt();
        assert!(state.is_exhausted(&config));
    }
}
