//! Application configuration loaded from environment variables.

use std::time::Duration;

use saga::{RetryPolicy, SagaSettings};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Text
        }
    }
}

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST` / `PORT`: bind address (default: `"0.0.0.0"` / `3000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `LOG_FORMAT`: `text` or `json` (default: `text`)
/// - `DATABASE_URL`: PostgreSQL URL; the in-memory store is used when unset
/// - `SAGA_OUTBOUND_URL`: endpoint commands are POSTed to; the in-memory
///   bus is used when unset
/// - `SAGA_PAYMENT_TIMEOUT_SECS` (default: `900`)
/// - `SAGA_BOOKING_CONFIRMATION_TIMEOUT_SECS` (default: `30`)
/// - `SAGA_BOOKING_CONFIRMATION_RETRIES` (default: `0`)
/// - `SAGA_MAX_CONFLICT_RETRIES` (default: `5`)
/// - `SAGA_PUBLISH_MAX_ATTEMPTS` (default: `5`)
/// - `SAGA_PUBLISH_INITIAL_BACKOFF_MS` (default: `100`)
/// - `SAGA_TIMEOUT_POLL_INTERVAL_MS` (default: `1000`)
/// - `SAGA_TIMEOUT_BATCH_SIZE` (default: `100`)
/// - `SAGA_TIMEOUT_LEASE_MS`: how long a claimed timeout is reserved for
///   delivery (default: `30000`)
/// - `SAGA_OUTBOX_GRACE_MS`: age after which undelivered effects are swept
///   (default: `30000`)
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub outbound_url: Option<String>,
    pub saga: SagaSettings,
    pub timeout_poll_interval: Duration,
    pub timeout_batch_size: usize,
    pub timeout_lease: Duration,
    pub outbox_grace: Duration,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from an arbitrary key lookup.
    ///
    /// Unparseable numbers fall back to their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let number = |key: &str, default: u64| -> u64 {
            lookup(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let retry = RetryPolicy {
            max_attempts: number(
                "SAGA_PUBLISH_MAX_ATTEMPTS",
                defaults.saga.effect_retry.max_attempts.into(),
            ) as u32,
            initial_backoff: Duration::from_millis(number(
                "SAGA_PUBLISH_INITIAL_BACKOFF_MS",
                defaults.saga.effect_retry.initial_backoff.as_millis() as u64,
            )),
            ..defaults.saga.effect_retry
        };

        Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: lookup("PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: lookup("LOG_FORMAT")
                .map(|v| LogFormat::parse(&v))
                .unwrap_or(defaults.log_format),
            database_url: non_empty("DATABASE_URL"),
            outbound_url: non_empty("SAGA_OUTBOUND_URL"),
            saga: SagaSettings {
                payment_timeout: Duration::from_secs(number(
                    "SAGA_PAYMENT_TIMEOUT_SECS",
                    defaults.saga.payment_timeout.as_secs(),
                )),
                booking_confirmation_timeout: Duration::from_secs(number(
                    "SAGA_BOOKING_CONFIRMATION_TIMEOUT_SECS",
                    defaults.saga.booking_confirmation_timeout.as_secs(),
                )),
                max_booking_confirmation_retries: number(
                    "SAGA_BOOKING_CONFIRMATION_RETRIES",
                    defaults.saga.max_booking_confirmation_retries.into(),
                ) as u32,
                max_conflict_retries: number(
                    "SAGA_MAX_CONFLICT_RETRIES",
                    defaults.saga.max_conflict_retries.into(),
                ) as u32,
                effect_retry: retry,
            },
            timeout_poll_interval: Duration::from_millis(number(
                "SAGA_TIMEOUT_POLL_INTERVAL_MS",
                defaults.timeout_poll_interval.as_millis() as u64,
            )),
            timeout_batch_size: number(
                "SAGA_TIMEOUT_BATCH_SIZE",
                defaults.timeout_batch_size as u64,
            ) as usize,
            timeout_lease: Duration::from_millis(number(
                "SAGA_TIMEOUT_LEASE_MS",
                defaults.timeout_lease.as_millis() as u64,
            )),
            outbox_grace: Duration::from_millis(number(
                "SAGA_OUTBOX_GRACE_MS",
                defaults.outbox_grace.as_millis() as u64,
            )),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            database_url: None,
            outbound_url: None,
            saga: SagaSettings::default(),
            timeout_poll_interval: Duration::from_secs(1),
            timeout_batch_size: 100,
            timeout_lease: saga::poller::DEFAULT_LEASE,
            outbox_grace: saga::poller::DEFAULT_OUTBOX_GRACE,
        }
    }
}
