use std::time::Duration;

use hookguard_types::GuardError;

/// What a caller does when another caller holds the lease for its key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusyWait {
    /// Return [`Outcome::RetryLater`](hookguard_types::Outcome::RetryLater) at once.
    RetryLater,
    /// Sleep with capped exponential backoff, re-reading the record between
    /// sleeps, for at most `max_polls` rounds.
    Poll { initial_delay: Duration, max_delay: Duration, max_polls: u32 },
}

impl BusyWait {
    /// Delay before poll number `poll` (0-based), or `None` once polling is
    /// exhausted or disabled.
    pub fn delay(&self, poll: u32) -> Option<Duration> {
        match self {
            BusyWait::RetryLater => None,
            BusyWait::Poll { initial_delay, max_delay, max_polls } => {
                if poll >= *max_polls {
                    return None;
                }
                let factor = 1u32.checked_shl(poll).unwrap_or(u32::MAX);
                Some(initial_delay.saturating_mul(factor).min(*max_delay))
            }
        }
    }
}

/// Minimum spacing between a FAILED attempt and its retry.
///
/// The delay after `n` failed attempts is `base * 2^(n-1)`, capped at `max`.
/// A zero `base` makes retries immediate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBackoff {
    pub base: Duration,
    pub max: Duration,
}

impl RetryBackoff {
    pub const fn immediate() -> Self {
        RetryBackoff { base: Duration::ZERO, max: Duration::ZERO }
    }

    pub fn delay_after(&self, failed_attempts: u32) -> Duration {
        if failed_attempts == 0 || self.base.is_zero() {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(failed_attempts - 1).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// Per-call knobs for [`Guard`](crate::Guard).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardPolicy {
    /// How long a lease, and the PROCESSING marker written under it, is
    /// trusted. Must exceed the handler's worst-case duration unless
    /// `lease_renewal_enabled` is set.
    pub lease_ttl: Duration,
    /// Handler invocations allowed per key, including crash-recovered ones.
    pub max_attempts: u32,
    pub busy_wait: BusyWait,
    /// Renew the lease every `lease_ttl / 2` while the handler runs.
    pub lease_renewal_enabled: bool,
    /// Serve COMPLETE records before touching the lock.
    pub cached_fast_path: bool,
    pub retry_backoff: RetryBackoff,
}

impl Default for GuardPolicy {
    fn default() -> Self {
        GuardPolicy {
            lease_ttl: Duration::from_secs(300),
            max_attempts: 3,
            busy_wait: BusyWait::Poll {
                initial_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(1),
                max_polls: 10,
            },
            lease_renewal_enabled: false,
            cached_fast_path: true,
            retry_backoff: RetryBackoff::immediate(),
        }
    }
}

impl GuardPolicy {
    pub fn validate(&self) -> Result<(), GuardError> {
        if self.lease_ttl.is_zero() {
            return Err(GuardError::InvalidArgument("lease_ttl must be positive".into()));
        }
        if self.max_attempts == 0 {
            return Err(GuardError::InvalidArgument("max_attempts must be at least 1".into()));
        }
        if let BusyWait::Poll { initial_delay, max_delay, .. } = &self.busy_wait {
            if initial_delay.is_zero() || max_delay < initial_delay {
                return Err(GuardError::InvalidArgument(
                    "poll delays must satisfy 0 < initial_delay <= max_delay".into(),
                ));
            }
        }
        if self.retry_backoff.max < self.retry_backoff.base {
            return Err(GuardError::InvalidArgument(
                "retry_backoff max must not be below base".into(),
            ));
        }
        Ok(())
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_busy_wait(mut self, busy_wait: BusyWait) -> Self {
        self.busy_wait = busy_wait;
        self
    }

    pub fn with_lease_renewal(mut self, enabled: bool) -> Self {
        self.lease_renewal_enabled = enabled;
        self
    }

    pub fn with_cached_fast_path(mut self, enabled: bool) -> Self {
        self.cached_fast_path = enabled;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: RetryBackoff) -> Self {
        self.retry_backoff = backoff;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusyWaitMode {
    Poll,
    RetryLater,
}

/// File/env representation of [`GuardPolicy`]. Durations are milliseconds.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct PolicyConfig {
    pub lease_ttl_ms: u64,
    pub max_attempts: u32,
    pub busy_wait: BusyWaitMode,
    pub poll_initial_delay_ms: u64,
    pub poll_max_delay_ms: u64,
    pub max_polls: u32,
    pub lease_renewal: bool,
    pub cached_fast_path: bool,
    pub retry_backoff_base_ms: u64,
    pub retry_backoff_max_ms: u64,
}

impl TryFrom<PolicyConfig> for GuardPolicy {
    type Error = GuardError;

    fn try_from(c: PolicyConfig) -> Result<Self, Self::Error> {
        let busy_wait = match c.busy_wait {
            BusyWaitMode::RetryLater => BusyWait::RetryLater,
            BusyWaitMode::Poll => BusyWait::Poll {
                initial_delay: Duration::from_millis(c.poll_initial_delay_ms),
                max_delay: Duration::from_millis(c.poll_max_delay_ms),
                max_polls: c.max_polls,
            },
        };
        let policy = GuardPolicy {
            lease_ttl: Duration::from_millis(c.lease_ttl_ms),
            max_attempts: c.max_attempts,
            busy_wait,
            lease_renewal_enabled: c.lease_renewal,
            cached_fast_path: c.cached_fast_path,
            retry_backoff: RetryBackoff {
                base: Duration::from_millis(c.retry_backoff_base_ms),
                max: Duration::from_millis(c.retry_backoff_max_ms),
            },
        };
        policy.validate()?;
        Ok(policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        GuardPolicy::default().validate().unwrap();
    }

    #[test]
    fn zero_attempts_rejected() {
        let err = GuardPolicy::default().with_max_attempts(0).validate().unwrap_err();
        assert!(matches!(err, GuardError::InvalidArgument(_)));
    }

    #[test]
    fn zero_ttl_rejected() {
        let err = GuardPolicy::default().with_lease_ttl(Duration::ZERO).validate().unwrap_err();
        assert!(matches!(err, GuardError::InvalidArgument(_)));
    }

    #[test]
    fn poll_backoff_is_capped_and_bounded() {
        let w = BusyWait::Poll {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(35),
            max_polls: 4,
        };
        assert_eq!(w.delay(0), Some(Duration::from_millis(10)));
        assert_eq!(w.delay(1), Some(Duration::from_millis(20)));
        assert_eq!(w.delay(2), Some(Duration::from_millis(35)));
        assert_eq!(w.delay(3), Some(Duration::from_millis(35)));
        assert_eq!(w.delay(4), None);
        assert_eq!(BusyWait::RetryLater.delay(0), None);
    }

    #[test]
    fn retry_backoff_doubles() {
        let b = RetryBackoff { base: Duration::from_secs(1), max: Duration::from_secs(5) };
        assert_eq!(b.delay_after(0), Duration::ZERO);
        assert_eq!(b.delay_after(1), Duration::from_secs(1));
        assert_eq!(b.delay_after(2), Duration::from_secs(2));
        assert_eq!(b.delay_after(3), Duration::from_secs(4));
        assert_eq!(b.delay_after(4), Duration::from_secs(5));
        assert_eq!(b.delay_after(40), Duration::from_secs(5));
        assert_eq!(RetryBackoff::immediate().delay_after(3), Duration::ZERO);
    }

    #[test]
    fn config_converts() {
        let c = PolicyConfig {
            lease_ttl_ms: 30_000,
            max_attempts: 5,
            busy_wait: BusyWaitMode::RetryLater,
            poll_initial_delay_ms: 100,
            poll_max_delay_ms: 1_000,
            max_polls: 10,
            lease_renewal: true,
            cached_fast_path: false,
            retry_backoff_base_ms: 0,
            retry_backoff_max_ms: 0,
        };
        let p = GuardPolicy::try_from(c).unwrap();
        assert_eq!(p.lease_ttl, Duration::from_secs(30));
        assert_eq!(p.busy_wait, BusyWait::RetryLater);
        assert!(p.lease_renewal_enabled);
        assert!(!p.cached_fast_path);
    }
}
