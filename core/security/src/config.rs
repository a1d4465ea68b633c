//! Security subsystem configuration.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use veilvault_common::{Error, Result};

/// Rate-limit policy applied to authentication and recovery attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Attempts allowed inside one window.
    pub max_attempts: u32,
    /// Window length in seconds.
    pub window_secs: u64,
    /// Block length in seconds once the limit is exceeded.
    pub block_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            window_secs: 15 * 60,
            block_secs: 60 * 60,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::seconds(self.window_secs as i64)
    }

    pub fn block_duration(&self) -> Duration {
        Duration::seconds(self.block_secs as i64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub rate_limit: RateLimitConfig,
    /// Buffered events written to disk at once.
    pub event_flush_threshold: usize,
    /// Log size that triggers rotation.
    pub max_log_bytes: u64,
    /// Events kept in memory per profile for audit queries.
    pub max_events_in_memory: usize,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitConfig::default(),
            event_flush_threshold: 10,
            max_log_bytes: 10 * 1024 * 1024,
            max_events_in_memory: 1000,
        }
    }
}

impl SecurityConfig {
    pub fn validate(&self) -> Result<()> {
        let rl = &self.rate_limit;
        if rl.max_attempts == 0 {
            return Err(Error::InvalidInput("rate_limit.max_attempts must be at least 1".to_string()));
        }
        if rl.window_secs == 0 || rl.block_secs == 0 {
            return Err(Error::InvalidInput(
                "rate_limit window and block durations must be positive".to_string(),
            ));
        }
        // chrono durations are i64 milliseconds internally.
        if rl.window_secs > i64::MAX as u64 / 1000 || rl.block_secs > i64::MAX as u64 / 1000 {
            return Err(Error::InvalidInput("rate_limit duration too large".to_string()));
        }
        if self.event_flush_threshold == 0 {
            return Err(Error::InvalidInput("event_flush_threshold must be at least 1".to_string()));
        }
        if self.max_events_in_memory == 0 {
            return Err(Error::InvalidInput("max_events_in_memory must be at least 1".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SecurityConfig::default();
        assert_eq!(config.rate_limit.max_attempts, 5);
        assert_eq!(config.rate_limit.window(), Duration::minutes(15));
        assert_eq!(config.rate_limit.block_duration(), Duration::hours(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: SecurityConfig =
            serde_json::from_str(r#"{"rate_limit": {"max_attempts": 3}}"#).unwrap();
        assert_eq!(config.rate_limit.max_attempts, 3);
        assert_eq!(config.rate_limit.window_secs, 900);
        assert_eq!(config.event_flush_threshold, 10);
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let mut config = SecurityConfig::default();
        config.rate_limit.max_attempts = 0;
        assert!(config.validate().is_err());
    }
}
