//! Client configuration sourced from `WAVESPEED_*` environment variables.

use log::warn;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://api.wavespeed.ai";

pub const ENV_API_KEY: &str = "WAVESPEED_API_KEY";
pub const ENV_BASE_URL: &str = "WAVESPEED_BASE_URL";
pub const ENV_CONNECTION_TIMEOUT: &str = "WAVESPEED_CONNECTION_TIMEOUT";
pub const ENV_TIMEOUT: &str = "WAVESPEED_TIMEOUT";
pub const ENV_MAX_RETRIES: &str = "WAVESPEED_MAX_RETRIES";
pub const ENV_MAX_CONNECTION_RETRIES: &str = "WAVESPEED_MAX_CONNECTION_RETRIES";
pub const ENV_RETRY_INTERVAL: &str = "WAVESPEED_RETRY_INTERVAL";
pub const ENV_POLL_INTERVAL: &str = "WAVESPEED_POLL_INTERVAL";

/// Client-level settings. Per-call options in [`crate::RunOptions`] take
/// precedence over these.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    /// Connect timeout for each HTTP request.
    pub connection_timeout: Duration,
    /// Overall timeout for each HTTP request.
    pub timeout: Duration,
    /// Whole-task restarts after a retryable failure.
    pub max_retries: u32,
    /// Per-request retries on connection-level failures.
    pub max_connection_retries: u32,
    /// Backoff unit; the n-th retry waits `retry_interval * n`.
    pub retry_interval: Duration,
    pub poll_interval: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            connection_timeout: Duration::from_secs(10),
            timeout: Duration::from_secs(36000),
            max_retries: 0,
            max_connection_retries: 5,
            retry_interval: Duration::from_secs(1),
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl ApiConfig {
    /// Loads the configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads the configuration from an arbitrary key lookup.
    /// Unset or unparseable values keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            api_key: lookup(ENV_API_KEY).filter(|key| !key.trim().is_empty()),
            base_url: lookup(ENV_BASE_URL)
                .filter(|url| !url.trim().is_empty())
                .unwrap_or(defaults.base_url),
            connection_timeout: seconds(
                &lookup,
                ENV_CONNECTION_TIMEOUT,
                defaults.connection_timeout,
            ),
            timeout: seconds(&lookup, ENV_TIMEOUT, defaults.timeout),
            max_retries: parsed(&lookup, ENV_MAX_RETRIES, defaults.max_retries),
            max_connection_retries: parsed(
                &lookup,
                ENV_MAX_CONNECTION_RETRIES,
                defaults.max_connection_retries,
            ),
            retry_interval: seconds(&lookup, ENV_RETRY_INTERVAL, defaults.retry_interval),
            poll_interval: seconds(&lookup, ENV_POLL_INTERVAL, defaults.poll_interval),
        }
    }

    /// Base URL without a trailing slash.
    pub fn normalized_base_url(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }
}

fn parsed<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Ignoring invalid value {:?} for {}", raw, key);
            default
        }),
        None => default,
    }
}

fn seconds<F>(lookup: &F, key: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return default;
    };
    match raw.trim().parse::<f64>().ok().map(Duration::try_from_secs_f64) {
        Some(Ok(duration)) => duration,
        _ => {
            warn!("Ignoring invalid value {:?} for {}", raw, key);
            default
        }
    }
}
