//! Reconnect backoff
//!
//! Nominal delay is `min(base * 2^attempt, ceiling)`. A uniform jitter of
//! `±jitter * nominal` is applied on top and the result clamped to the
//! ceiling, so many clients dropped at once do not retry in lockstep.
//! Across one run of failures the delay never shrinks: a jittered value
//! below the previous delay is raised to it.

use std::time::Duration;

/// Reconnection configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Jitter fraction in [0, 1)
    pub jitter: f64,
    /// Maximum consecutive failed attempts (None = unlimited)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before jitter for a zero-based attempt number
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Spread `nominal` by `sample` in [-1, 1], never exceeding the ceiling
    pub fn apply_jitter(&self, nominal: Duration, sample: f64) -> Duration {
        let nominal_ms = nominal.as_millis() as f64;
        let spread = nominal_ms * self.jitter * sample.clamp(-1.0, 1.0);
        let jittered = (nominal_ms + spread).max(0.0).round() as u64;
        Duration::from_millis(jittered).min(self.max_delay)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.base_delay.is_zero() {
            return Err("reconnect base delay must be positive".to_string());
        }
        if self.base_delay > self.max_delay {
            return Err(format!(
                "reconnect base delay {}ms exceeds ceiling {}ms",
                self.base_delay.as_millis(),
                self.max_delay.as_millis()
            ));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(format!("reconnect jitter {} must be in [0, 1)", self.jitter));
        }
        Ok(())
    }
}

/// Outcome of asking whether to retry
#[derive(Debug, Clone, PartialEq)]
pub enum ReconnectDecision {
    /// Retry as attempt number `attempt` (1-based) after `delay`
    Proceed { attempt: u32, delay: Duration },
    /// `max_attempts` consecutive failures already happened
    AbortMaxAttemptsExceeded,
}

/// Attempt counter driving [`ReconnectPolicy`]
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
    last_delay: Duration,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempt: 0,
            last_delay: Duration::ZERO,
        }
    }

    /// Failed cycles since the last successful connection
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Record one failed cycle and decide the next step
    pub fn next(&mut self) -> ReconnectDecision {
        let sample = fastrand::f64() * 2.0 - 1.0;
        self.next_with_sample(sample)
    }

    /// [`Backoff::next`] with an explicit jitter sample in [-1, 1]
    pub fn next_with_sample(&mut self, sample: f64) -> ReconnectDecision {
        if let Some(max_attempts) = self.policy.max_attempts {
            if self.attempt >= max_attempts {
                return ReconnectDecision::AbortMaxAttemptsExceeded;
            }
        }

        let nominal = self.policy.nominal_delay(self.attempt);
        let delay = self
            .policy
            .apply_jitter(nominal, sample)
            .max(self.last_delay)
            .min(self.policy.max_delay);
        self.attempt += 1;
        self.last_delay = delay;
        ReconnectDecision::Proceed {
            attempt: self.attempt,
            delay,
        }
    }

    /// Called on reaching Connected
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.last_delay = Duration::ZERO;
    }
}
