use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bound on shard count
pub const MAX_SHARDS: usize = 256;

/// Configuration for the atom store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Number of metadata shards, picked by the fingerprint's first byte
    pub shards: usize,

    /// Backoff used when a fingerprint is held in a transitional state
    pub retry: RetryPolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            shards: 16,
            retry: RetryPolicy::default(),
        }
    }
}

impl StoreConfig {
    /// Single shard, fast retries. Useful to force contention in tests.
    #[must_use]
    pub fn single_shard() -> Self {
        Self {
            shards: 1,
            retry: RetryPolicy {
                max_attempts: 64,
                base_delay_ms: 1,
                max_delay_ms: 5,
            },
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.shards == 0 || self.shards > MAX_SHARDS {
            return Err(format!(
                "shards must be between 1 and {MAX_SHARDS}, got {}",
                self.shards
            ));
        }
        self.retry.validate()
    }
}

/// Exponential backoff for concurrency conflicts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 16,
            base_delay_ms: 1,
            max_delay_ms: 100,
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("retry.max_attempts must be > 0".to_string());
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(format!(
                "retry.base_delay_ms ({}) must be <= retry.max_delay_ms ({})",
                self.base_delay_ms, self.max_delay_ms
            ));
        }
        Ok(())
    }

    /// Delay before retry number `attempt` (0-based), doubling up to the cap
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let millis = self
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(StoreConfig::default().validate().is_ok());
        assert!(StoreConfig::single_shard().validate().is_ok());
    }

    #[test]
    fn test_shard_bounds() {
        let zero = StoreConfig {
            shards: 0,
            ..StoreConfig::default()
        };
        assert!(zero.validate().is_err());

        let too_many = StoreConfig {
            shards: MAX_SHARDS + 1,
            ..StoreConfig::default()
        };
        assert!(too_many.validate().is_err());
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay_ms: 2,
            max_delay_ms: 20,
        };
        assert_eq!(policy.delay(0), Duration::from_millis(2));
        assert_eq!(policy.delay(1), Duration::from_millis(4));
        assert_eq!(policy.delay(3), Duration::from_millis(16));
        assert_eq!(policy.delay(4), Duration::from_millis(20));
        assert_eq!(policy.delay(60), Duration::from_millis(20));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: StoreConfig = serde_json::from_str(r#"{"shards": 4}"#).unwrap();
        assert_eq!(config.shards, 4);
        assert_eq!(config.retry, RetryPolicy::default());
    }
}
