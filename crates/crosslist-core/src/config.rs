//! Provider and dispatcher settings.
//!
//! Everything here is plain data: `serde` deserializable with defaults for
//! every field, validated once with `validate()`, then treated as read-only.
//! Durations are written as (fractional) seconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::retry::RetryPolicy;
use crate::ValidationError;

/// Per-provider resilience and credential settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub enabled: bool,
    pub retry: RetryPolicy,
    pub circuit_breaker: CircuitBreakerConfig,
    pub oauth: Option<OAuthSettings>,
    pub rate_limit: Option<RateLimit>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            retry: RetryPolicy::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            oauth: None,
            rate_limit: None,
        }
    }
}

impl ProviderSettings {
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_circuit_breaker(mut self, circuit_breaker: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = circuit_breaker;
        self
    }

    pub fn with_oauth(mut self, oauth: OAuthSettings) -> Self {
        self.oauth = Some(oauth);
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimit) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.retry.validate()?;
        self.circuit_breaker.validate()?;
        if let Some(rate_limit) = &self.rate_limit {
            rate_limit.validate()?;
        }
        Ok(())
    }
}

/// Token refresh settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthSettings {
    /// Refresh once the token has this much lifetime left or less.
    #[serde(with = "duration_secs")]
    pub refresh_threshold: Duration,
}

impl Default for OAuthSettings {
    fn default() -> Self {
        Self {
            refresh_threshold: Duration::from_secs(300),
        }
    }
}

/// Outbound request budget for one provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub requests_per_minute: u32,
    /// Requests allowed back-to-back; defaults to `requests_per_minute`.
    #[serde(default)]
    pub burst: Option<u32>,
}

impl RateLimit {
    pub const fn per_minute(requests_per_minute: u32) -> Self {
        Self {
            requests_per_minute,
            burst: None,
        }
    }

    pub const fn with_burst(mut self, burst: u32) -> Self {
        self.burst = Some(burst);
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.requests_per_minute == 0 {
            return Err(ValidationError::InvalidSetting {
                field: "rate_limit.requests_per_minute",
                reason: String::from("must be at least 1"),
            });
        }
        if self.burst == Some(0) {
            return Err(ValidationError::InvalidSetting {
                field: "rate_limit.burst",
                reason: String::from("must be at least 1 when set"),
            });
        }
        Ok(())
    }
}

/// Settings shared by every dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Upper bound on provider calls in flight across all dispatches.
    pub max_concurrency: usize,
    /// Deadline applied to dispatches that do not set their own.
    #[serde(with = "duration_secs::option")]
    pub default_deadline: Option<Duration>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 5,
            default_deadline: None,
        }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_concurrency == 0 {
            return Err(ValidationError::InvalidSetting {
                field: "dispatcher.max_concurrency",
                reason: String::from("must be at least 1"),
            });
        }
        if self.default_deadline == Some(Duration::ZERO) {
            return Err(ValidationError::InvalidSetting {
                field: "dispatcher.default_deadline",
                reason: String::from("must be positive when set"),
            });
        }
        Ok(())
    }
}

/// `serde` adapter storing a [`Duration`] as fractional seconds.
pub(crate) mod duration_secs {
    use std::time::Duration;

    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let seconds = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(seconds).map_err(|_| {
            D::Error::custom(format!("expected a non-negative number of seconds, got {seconds}"))
        })
    }

    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(duration) => super::serialize(duration, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            #[derive(Deserialize)]
            struct Seconds(#[serde(with = "super")] Duration);

            Option::<Seconds>::deserialize(deserializer).map(|value| value.map(|Seconds(d)| d))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_settings_fill_defaults() {
        let settings: ProviderSettings = serde_json::from_str(
            r#"{
                "retry": {"max_retries": 2, "backoff_factor": 1.5},
                "circuit_breaker": {"recovery_timeout": 30},
                "oauth": {}
            }"#,
        )
        .expect("valid settings");

        assert!(settings.enabled);
        assert_eq!(settings.retry.max_retries, 2);
        assert_eq!(settings.retry.backoff_factor, 1.5);
        assert_eq!(settings.circuit_breaker.failure_threshold, 5);
        assert_eq!(settings.circuit_breaker.recovery_timeout, Duration::from_secs(30));
        assert_eq!(
            settings.oauth.map(|oauth| oauth.refresh_threshold),
            Some(Duration::from_secs(300))
        );
        assert!(settings.rate_limit.is_none());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn dispatcher_config_parses_optional_deadline() {
        let config: DispatcherConfig =
            serde_json::from_str(r#"{"default_deadline": 2.5}"#).expect("valid config");
        assert_eq!(config.max_concurrency, 5);
        assert_eq!(config.default_deadline, Some(Duration::from_millis(2_500)));

        let config: DispatcherConfig = serde_json::from_str("{}").expect("valid config");
        assert_eq!(config.default_deadline, None);
    }

    #[test]
    fn negative_durations_are_rejected() {
        let result = serde_json::from_str::<OAuthSettings>(r#"{"refresh_threshold": -1}"#);
        assert!(result.is_err());
    }

    #[test]
    fn validation_reports_offending_field() {
        let config = DispatcherConfig {
            max_concurrency: 0,
            ..DispatcherConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ValidationError::InvalidSetting {
                field: "dispatcher.max_concurrency",
                ..
            })
        ));

        let settings = ProviderSettings::default().with_rate_limit(RateLimit::per_minute(0));
        assert!(settings.validate().is_err());
    }
}
