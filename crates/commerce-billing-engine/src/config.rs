//! Engine configuration.
//!
//! All schedules and budgets live here as plain immutable values handed to the engine at
//! construction. Nothing is read from global state after that.

use std::time::Duration;

/// Engine configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Path to the `RocksDB` data directory (default: "/data/commerce-billing").
    pub data_dir: String,

    /// Currency used when a caller does not name one (default: "usd").
    pub default_currency: String,

    /// Stamped on every emitted event (default: false).
    pub livemode: bool,

    /// Webhook delivery settings.
    pub webhook: WebhookConfig,

    /// Dunning schedule.
    pub dunning: DunningConfig,

    /// Timeout and retry policy for workflow activities.
    pub activity: ActivityOptions,
}

/// Webhook dispatcher settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookConfig {
    /// Per-request timeout.
    pub timeout: Duration,
    /// Delivery rounds before an event stops being retried.
    pub max_attempts: u32,
    /// How often the dispatcher polls when nothing wakes it.
    pub poll_interval: Duration,
    /// Delay before the first redelivery round.
    pub initial_backoff: Duration,
    /// Upper bound on the redelivery delay.
    pub max_backoff: Duration,
}

/// Dunning schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DunningConfig {
    /// Delay before each attempt, measured from the previous attempt.
    pub schedule: Vec<Duration>,
    /// Requested number of attempts.
    pub max_retries: u32,
}

/// Start-to-close timeout and retry policy for one activity.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityOptions {
    /// Timeout for a single attempt.
    pub start_to_close_timeout: Duration,
    /// Retries for infrastructure failures.
    pub retry: RetryPolicy,
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound on any delay.
    pub max_backoff: Duration,
    /// Growth factor between retries.
    pub backoff_multiplier: f64,
}

const HOUR: u64 = 60 * 60;

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: "/data/commerce-billing".into(),
            default_currency: "usd".into(),
            livemode: false,
            webhook: WebhookConfig::default(),
            dunning: DunningConfig::default(),
            activity: ActivityOptions::default(),
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_attempts: 5,
            poll_interval: Duration::from_secs(5),
            initial_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(HOUR),
        }
    }
}

impl Default for DunningConfig {
    fn default() -> Self {
        Self {
            schedule: vec![
                Duration::ZERO,
                Duration::from_secs(24 * HOUR),
                Duration::from_secs(72 * HOUR),
                Duration::from_secs(168 * HOUR),
            ],
            max_retries: 4,
        }
    }
}

impl Default for ActivityOptions {
    fn default() -> Self {
        Self {
            start_to_close_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables, falling back to the defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            data_dir: std::env::var("BILLING_DATA_DIR").unwrap_or(defaults.data_dir),
            default_currency: std::env::var("BILLING_DEFAULT_CURRENCY")
                .map(|c| c.trim().to_lowercase())
                .unwrap_or(defaults.default_currency),
            livemode: env_parse("BILLING_LIVEMODE").unwrap_or(defaults.livemode),
            webhook: WebhookConfig {
                timeout: env_parse("WEBHOOK_TIMEOUT_SECONDS")
                    .map_or(defaults.webhook.timeout, Duration::from_secs),
                max_attempts: env_parse("WEBHOOK_MAX_ATTEMPTS")
                    .unwrap_or(defaults.webhook.max_attempts),
                poll_interval: env_parse("WEBHOOK_POLL_INTERVAL_MS")
                    .map_or(defaults.webhook.poll_interval, Duration::from_millis),
                ..defaults.webhook
            },
            dunning: DunningConfig {
                schedule: std::env::var("DUNNING_SCHEDULE_HOURS")
                    .ok()
                    .and_then(|s| parse_hours(&s))
                    .unwrap_or(defaults.dunning.schedule),
                max_retries: env_parse("DUNNING_MAX_RETRIES")
                    .unwrap_or(defaults.dunning.max_retries),
            },
            activity: ActivityOptions {
                start_to_close_timeout: env_parse("ACTIVITY_TIMEOUT_SECONDS")
                    .map_or(defaults.activity.start_to_close_timeout, Duration::from_secs),
                retry: RetryPolicy {
                    max_attempts: env_parse("ACTIVITY_MAX_ATTEMPTS")
                        .unwrap_or(defaults.activity.retry.max_attempts),
                    ..defaults.activity.retry
                },
            },
        }
    }

    /// Replace the default currency.
    #[must_use]
    pub fn with_default_currency(mut self, currency: impl Into<String>) -> Self {
        self.default_currency = currency.into().to_lowercase();
        self
    }

    /// Replace the livemode flag.
    #[must_use]
    pub fn with_livemode(mut self, livemode: bool) -> Self {
        self.livemode = livemode;
        self
    }

    /// Replace the webhook settings.
    #[must_use]
    pub fn with_webhook(mut self, webhook: WebhookConfig) -> Self {
        self.webhook = webhook;
        self
    }

    /// Replace the dunning schedule.
    #[must_use]
    pub fn with_dunning(mut self, dunning: DunningConfig) -> Self {
        self.dunning = dunning;
        self
    }

    /// Replace the activity options.
    #[must_use]
    pub fn with_activity(mut self, activity: ActivityOptions) -> Self {
        self.activity = activity;
        self
    }
}

impl WebhookConfig {
    /// Delay before redelivery round `attempt` (1-based), doubling up to `max_backoff`.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl DunningConfig {
    /// Number of collection attempts: `max_retries` clamped to `1..=4` and to the schedule.
    #[must_use]
    pub fn attempts(&self) -> usize {
        let requested = usize::try_from(self.max_retries.clamp(1, 4)).unwrap_or(4);
        requested.min(self.schedule.len().max(1))
    }

    /// Delay before attempt `index` (0-based).
    #[must_use]
    pub fn delay(&self, index: usize) -> Duration {
        self.schedule.get(index).copied().unwrap_or(Duration::ZERO)
    }
}

impl RetryPolicy {
    /// Backoff before retry `retry` (1-based), capped at `max_backoff`.
    #[must_use]
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        if secs.is_finite() && secs < self.max_backoff.as_secs_f64() {
            Duration::from_secs_f64(secs)
        } else {
            self.max_backoff
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

/// Parse a comma-separated list of hours ("0,24,72,168").
fn parse_hours(value: &str) -> Option<Vec<Duration>> {
    let hours: Option<Vec<u64>> = value
        .split(',')
        .map(|s| s.trim().parse().ok())
        .collect();
    hours
        .filter(|h| !h.is_empty())
        .map(|h| h.into_iter().map(|n| Duration::from_secs(n.saturating_mul(HOUR))).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dunning_attempts_are_clamped() {
        let mut dunning = DunningConfig::default();
        assert_eq!(dunning.attempts(), 4);

        dunning.max_retries = 0;
        assert_eq!(dunning.attempts(), 1);

        dunning.max_retries = 10;
        assert_eq!(dunning.attempts(), 4);

        dunning.schedule.truncate(2);
        assert_eq!(dunning.attempts(), 2);
        assert_eq!(dunning.delay(1), Duration::from_secs(24 * HOUR));
        assert_eq!(dunning.delay(7), Duration::ZERO);
    }

    #[test]
    fn retry_backoff_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
        assert_eq!(policy.backoff(50), Duration::from_secs(30));
    }

    #[test]
    fn webhook_backoff_doubles_to_max() {
        let webhook = WebhookConfig::default();
        assert_eq!(webhook.backoff(1), Duration::from_secs(30));
        assert_eq!(webhook.backoff(2), Duration::from_secs(60));
        assert_eq!(webhook.backoff(40), Duration::from_secs(HOUR));
    }

    #[test]
    fn parses_hour_lists() {
        assert_eq!(
            parse_hours("0, 12,48"),
            Some(vec![
                Duration::ZERO,
                Duration::from_secs(12 * HOUR),
                Duration::from_secs(48 * HOUR)
            ])
        );
        assert_eq!(parse_hours("1,x"), None);
    }

    #[test]
    fn builders_replace_fields() {
        let config = EngineConfig::default()
            .with_default_currency("EUR")
            .with_livemode(true);
        assert_eq!(config.default_currency, "eur");
        assert!(config.livemode);
        assert_eq!(config.dunning, DunningConfig::default());
    }
}
