//! Configuration types.
//!
//! Everything is read once at startup through the `from_env()` constructors
//! and is immutable afterwards.

use std::time::Duration;

use crate::decision::types::UrgencyLevel;
use crate::error::ConfigError;

/// Per-urgency dispatch delays.
///
/// Relative ordering (`high < medium < low`) is an operator convention and is
/// not checked. Each delay must lie in `0..=MAX_DELAY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayConfig {
    pub high: Duration,
    pub medium: Duration,
    pub low: Duration,
    pub loco: Duration,
    pub test: Duration,
}

impl Default for DelayConfig {
    fn default() -> Self {
        Self {
            high: Duration::from_secs(30),
            medium: Duration::from_secs(120),
            low: Duration::from_secs(300),
            loco: Duration::from_secs(5),
            test: Duration::from_secs(30),
        }
    }
}

impl DelayConfig {
    /// Longest accepted delay (one week).
    pub const MAX_DELAY: Duration = Duration::from_secs(7 * 24 * 60 * 60);

    /// Build from whole-second values, rejecting negatives and anything
    /// above [`MAX_DELAY`](Self::MAX_DELAY).
    pub fn from_secs(
        high: i64,
        medium: i64,
        low: i64,
        loco: i64,
        test: i64,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            high: delay_secs("REPLY_DELAY_HIGH", high)?,
            medium: delay_secs("REPLY_DELAY_MEDIUM", medium)?,
            low: delay_secs("REPLY_DELAY_LOW", low)?,
            loco: delay_secs("REPLY_DELAY_LOCO", loco)?,
            test: delay_secs("REPLY_DELAY_TEST", test)?,
        })
    }

    /// Load from `REPLY_DELAY_*`, falling back to the production defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Self::from_secs(
            env_i64("REPLY_DELAY_HIGH", defaults.high.as_secs() as i64)?,
            env_i64("REPLY_DELAY_MEDIUM", defaults.medium.as_secs() as i64)?,
            env_i64("REPLY_DELAY_LOW", defaults.low.as_secs() as i64)?,
            env_i64("REPLY_DELAY_LOCO", defaults.loco.as_secs() as i64)?,
            env_i64("REPLY_DELAY_TEST", defaults.test.as_secs() as i64)?,
        )
    }

    /// Delay for an urgency level.
    pub fn delay_for(&self, level: UrgencyLevel) -> Duration {
        match level {
            UrgencyLevel::High => self.high,
            UrgencyLevel::Medium => self.medium,
            UrgencyLevel::Low => self.low,
            UrgencyLevel::Loco => self.loco,
            UrgencyLevel::Test => self.test,
        }
    }
}

/// Deterministic fast-path triggers.
#[derive(Debug, Clone)]
pub struct TriggerConfig {
    /// Keywords that force the `loco` level (matched case-insensitively).
    pub keywords: Vec<String>,
    /// Sender user ids whose messages are classified as `test`.
    pub test_users: Vec<String>,
    /// Channel ids whose messages are classified as `test`.
    pub test_channels: Vec<String>,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            keywords: vec!["loco".to_string()],
            test_users: Vec::new(),
            test_channels: Vec::new(),
        }
    }
}

impl TriggerConfig {
    pub fn from_env() -> Self {
        let keywords = std::env::var("REPLY_TRIGGER_KEYWORDS")
            .map(|v| split_list(&v))
            .unwrap_or_else(|_| vec!["loco".to_string()]);
        Self {
            keywords: keywords.into_iter().map(|k| k.to_lowercase()).collect(),
            test_users: std::env::var("REPLY_TEST_USERS")
                .map(|v| split_list(&v))
                .unwrap_or_default(),
            test_channels: std::env::var("REPLY_TEST_CHANNELS")
                .map(|v| split_list(&v))
                .unwrap_or_default(),
        }
    }
}

/// The human the assistant stands in for. Used for prompt persona only.
#[derive(Debug, Clone)]
pub struct Principal {
    pub user_id: String,
    pub name: String,
    pub role: String,
    pub company: String,
}

impl Default for Principal {
    fn default() -> Self {
        Self {
            user_id: String::new(),
            name: "the principal".to_string(),
            role: "team member".to_string(),
            company: "the company".to_string(),
        }
    }
}

impl Principal {
    pub fn from_env() -> Result<Self, ConfigError> {
        let user_id = std::env::var("PRINCIPAL_USER_ID").map_err(|_| {
            ConfigError::MissingRequired {
                key: "PRINCIPAL_USER_ID".to_string(),
                hint: "Set it to the chat user id of the person being represented".to_string(),
            }
        })?;
        let defaults = Self::default();
        Ok(Self {
            user_id,
            name: std::env::var("PRINCIPAL_NAME").unwrap_or(defaults.name),
            role: std::env::var("PRINCIPAL_ROLE").unwrap_or(defaults.role),
            company: std::env::var("PRINCIPAL_COMPANY").unwrap_or(defaults.company),
        })
    }
}

/// Planner tuning knobs.
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    /// Upper bound on a single classify/generate call.
    pub capability_timeout: Duration,
    /// Channel messages fetched as context.
    pub channel_context_limit: usize,
    /// Principal messages fetched as style examples.
    pub principal_responses_limit: usize,
    /// Style examples kept after filtering.
    pub max_style_examples: usize,
    /// Upper bound on generated reply length, in chars.
    pub max_response_chars: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            capability_timeout: Duration::from_secs(20),
            channel_context_limit: 10,
            principal_responses_limit: 20,
            max_style_examples: 10,
            max_response_chars: 600,
        }
    }
}

impl PlannerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let timeout = env_i64(
            "REPLY_CAPABILITY_TIMEOUT_SECS",
            defaults.capability_timeout.as_secs() as i64,
        )?;
        if timeout <= 0 {
            return Err(ConfigError::InvalidValue {
                key: "REPLY_CAPABILITY_TIMEOUT_SECS".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        Ok(Self {
            capability_timeout: Duration::from_secs(timeout as u64),
            channel_context_limit: env_usize(
                "REPLY_CHANNEL_CONTEXT_LIMIT",
                defaults.channel_context_limit,
            )?,
            principal_responses_limit: env_usize(
                "REPLY_PRINCIPAL_RESPONSES_LIMIT",
                defaults.principal_responses_limit,
            )?,
            max_style_examples: defaults.max_style_examples,
            max_response_chars: env_usize("REPLY_MAX_RESPONSE_CHARS", defaults.max_response_chars)?,
        })
    }
}

fn delay_secs(key: &str, secs: i64) -> Result<Duration, ConfigError> {
    if secs < 0 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("delay must be non-negative, got {secs}"),
        });
    }
    let max = DelayConfig::MAX_DELAY.as_secs();
    if secs as u64 > max {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("delay must be at most {max} seconds, got {secs}"),
        });
    }
    Ok(Duration::from_secs(secs as u64))
}

fn env_i64(key: &str, default: i64) -> Result<i64, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected an integer, got '{raw}': {e}"),
        }),
        Err(_) => Ok(default),
    }
}

fn env_usize(key: &str, default: usize) -> Result<usize, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a non-negative integer, got '{raw}': {e}"),
        }),
        Err(_) => Ok(default),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn production_defaults() {
        let delays = DelayConfig::default();
        assert_eq!(delays.delay_for(UrgencyLevel::High), Duration::from_secs(30));
        assert_eq!(delays.delay_for(UrgencyLevel::Medium), Duration::from_secs(120));
        assert_eq!(delays.delay_for(UrgencyLevel::Low), Duration::from_secs(300));
        assert_eq!(delays.delay_for(UrgencyLevel::Loco), Duration::from_secs(5));
        assert_eq!(delays.delay_for(UrgencyLevel::Test), Duration::from_secs(30));
    }

    #[test]
    fn negative_delay_rejected() {
        let err = DelayConfig::from_secs(30, -1, 300, 5, 30).unwrap_err();
        match err {
            ConfigError::InvalidValue { key, .. } => assert_eq!(key, "REPLY_DELAY_MEDIUM"),
            other => panic!("Expected InvalidValue, got {other:?}"),
        }
    }

    #[test]
    fn oversized_delay_rejected() {
        let err = DelayConfig::from_secs(i64::MAX, 120, 300, 5, 30).unwrap_err();
        match err {
            ConfigError::InvalidValue { key, .. } => assert_eq!(key, "REPLY_DELAY_HIGH"),
            other => panic!("Expected InvalidValue, got {other:?}"),
        }

        let max = DelayConfig::MAX_DELAY.as_secs() as i64;
        let delays = DelayConfig::from_secs(30, 120, max, 5, 30).unwrap();
        assert_eq!(delays.low, DelayConfig::MAX_DELAY);
        assert!(DelayConfig::from_secs(30, 120, max + 1, 5, 30).is_err());
    }

    #[test]
    fn zero_delay_allowed_and_ordering_not_enforced() {
        let delays = DelayConfig::from_secs(600, 0, 10, 0, 0).unwrap();
        assert_eq!(delays.medium, Duration::ZERO);
        assert!(delays.high > delays.low);
    }

    #[test]
    fn split_list_trims_and_drops_empty() {
        assert_eq!(split_list(" a, b ,,c "), vec!["a", "b", "c"]);
        assert!(split_list("").is_empty());
    }
}
