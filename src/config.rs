//! Coordinator settings.
//!
//! Loading is left to the embedding process; the struct deserializes from
//! any serde format and every field has a default.

use {
    crate::{RangeError, RangeResult},
    serde::{Deserialize, Serialize},
    std::time::Duration,
};

/// How many per-replica calls of a fan-out must succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionPolicy {
    /// Every replica.
    #[default]
    All,
    /// More than half of the replicas.
    Majority,
    /// At least this many replicas (capped at the replica count).
    AtLeast(usize),
}

impl CompletionPolicy {
    /// Number of successes required out of `total` calls.
    pub fn required(&self, total: usize) -> usize {
        match *self {
            Self::All => total,
            Self::Majority => total / 2 + 1,
            Self::AtLeast(n) => n.min(total),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Window of a single per-replica call.
    pub rpc_timeout_ms: u64,

    /// First delay between two `PollFrozen` rounds.
    pub poll_initial_backoff_ms: u64,

    /// Upper bound of the poll delay.
    pub poll_max_backoff_ms: u64,

    /// Polls per replica before a freeze or thaw mismatch is escalated.
    pub max_polls: u32,

    /// Replicas that must confirm a freeze before a mutation proceeds.
    pub freeze_policy: CompletionPolicy,

    /// Replicas that must report a checksum for a check to conclude.
    pub checksum_policy: CompletionPolicy,

    /// Attempts of a whole mutation after retryable failures.
    pub max_mutation_retries: u32,

    pub retry_initial_backoff_ms: u64,

    pub retry_max_backoff_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            rpc_timeout_ms: 2_000,
            poll_initial_backoff_ms: 10,
            poll_max_backoff_ms: 500,
            max_polls: 20,
            freeze_policy: CompletionPolicy::All,
            checksum_policy: CompletionPolicy::All,
            max_mutation_retries: 5,
            retry_initial_backoff_ms: 20,
            retry_max_backoff_ms: 1_000,
        }
    }
}

impl CoordinatorConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// Window of one replica's freeze or thaw: the command plus every poll.
    pub fn freeze_window(&self) -> Duration {
        let per_poll = self.rpc_timeout_ms + self.poll_max_backoff_ms;
        Duration::from_millis(self.rpc_timeout_ms + per_poll * u64::from(self.max_polls))
    }

    /// Delays between freeze/thaw polls.
    pub fn poll_backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.poll_initial_backoff_ms),
            Duration::from_millis(self.poll_max_backoff_ms),
        )
    }

    /// Delays between mutation attempts.
    pub fn retry_backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.retry_initial_backoff_ms),
            Duration::from_millis(self.retry_max_backoff_ms),
        )
    }

    pub fn validate(&self) -> RangeResult<()> {
        if self.rpc_timeout_ms == 0 {
            return Err(RangeError::InvalidConfig("rpc_timeout_ms must be positive".into()));
        }
        if self.max_polls == 0 {
            return Err(RangeError::InvalidConfig("max_polls must be positive".into()));
        }
        if self.poll_initial_backoff_ms > self.poll_max_backoff_ms {
            return Err(RangeError::InvalidConfig(
                "poll_initial_backoff_ms exceeds poll_max_backoff_ms".into(),
            ));
        }
        if self.retry_initial_backoff_ms > self.retry_max_backoff_ms {
            return Err(RangeError::InvalidConfig(
                "retry_initial_backoff_ms exceeds retry_max_backoff_ms".into(),
            ));
        }
        for policy in [self.freeze_policy, self.checksum_policy] {
            if policy == CompletionPolicy::AtLeast(0) {
                return Err(RangeError::InvalidConfig(
                    "completion policy must require at least one replica".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Exponential delays, doubling up to a cap.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { next: initial, max }
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        Some(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_successes() {
        assert_eq!(CompletionPolicy::All.required(5), 5);
        assert_eq!(CompletionPolicy::Majority.required(5), 3);
        assert_eq!(CompletionPolicy::Majority.required(4), 3);
        assert_eq!(CompletionPolicy::AtLeast(2).required(5), 2);
        assert_eq!(CompletionPolicy::AtLeast(9).required(3), 3);
    }

    #[test]
    fn parse_partial_config() {
        let config: CoordinatorConfig = toml::from_str(
            r#"
rpc_timeout_ms = 250
max_polls = 3
freeze_policy = "majority"
checksum_policy = { at_least = 2 }
"#,
        )
        .unwrap();
        assert_eq!(config.rpc_timeout(), Duration::from_millis(250));
        assert_eq!(config.max_polls, 3);
        assert_eq!(config.freeze_policy, CompletionPolicy::Majority);
        assert_eq!(config.checksum_policy, CompletionPolicy::AtLeast(2));
        assert_eq!(config.max_mutation_retries, 5);
        config.validate().unwrap();
    }

    #[test]
    fn reject_invalid_config() {
        let config = CoordinatorConfig {
            max_polls: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_polls"));

        let config = CoordinatorConfig {
            checksum_policy: CompletionPolicy::AtLeast(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn backoff_doubles_to_cap() {
        let delays: Vec<_> = Backoff::new(Duration::from_millis(10), Duration::from_millis(50))
            .take(5)
            .map(|d| d.as_millis())
            .collect();
        assert_eq!(delays, vec![10, 20, 40, 50, 50]);
    }
}
