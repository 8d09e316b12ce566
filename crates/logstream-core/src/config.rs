//! Runtime configuration
//!
//! Every setting has a sensible default and can be overridden from the
//! environment via the `from_env` constructors.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const ENV_UPSTREAM_URL: &str = "LOGSTREAM_UPSTREAM_URL";
const ENV_UPSTREAM_USER: &str = "LOGSTREAM_UPSTREAM_USER";
const ENV_UPSTREAM_TOKEN: &str = "LOGSTREAM_UPSTREAM_TOKEN";
const ENV_UPSTREAM_TIMEOUT: &str = "LOGSTREAM_UPSTREAM_TIMEOUT_SECS";
const ENV_POLL_INTERVAL_MS: &str = "LOGSTREAM_POLL_INTERVAL_MS";
const ENV_SUBSCRIBER_TIMEOUT: &str = "LOGSTREAM_SUBSCRIBER_TIMEOUT_SECS";
const ENV_WORKERS: &str = "LOGSTREAM_POST_BUILD_WORKERS";
const ENV_QUEUE: &str = "LOGSTREAM_POST_BUILD_QUEUE";

/// Upstream CI server connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// CI server base URL, without a trailing slash
    pub base_url: String,
    /// User for basic auth (optional for anonymous read access)
    pub username: Option<String>,
    /// API token paired with `username`
    pub api_token: Option<String>,
    /// Per-request timeout
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        UpstreamConfig {
            base_url: "http://localhost:8080".to_string(),
            username: None,
            api_token: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl UpstreamConfig {
    /// Create config for a specific server
    pub fn new(base_url: &str) -> Self {
        UpstreamConfig {
            base_url: base_url.trim_end_matches('/').to_string(),
            ..Self::default()
        }
    }

    /// Set basic-auth credentials
    pub fn with_credentials(mut self, username: &str, api_token: &str) -> Self {
        self.username = Some(username.to_string());
        self.api_token = Some(api_token.to_string());
        self
    }

    /// Read settings from `LOGSTREAM_UPSTREAM_*`; the URL is required.
    pub fn from_env() -> Result<Self, ConfigError> {
        let base_url = std::env::var(ENV_UPSTREAM_URL)
            .map_err(|_| ConfigError::Missing(ENV_UPSTREAM_URL))?;
        let mut config = Self::new(&base_url);
        config.username = std::env::var(ENV_UPSTREAM_USER).ok();
        config.api_token = std::env::var(ENV_UPSTREAM_TOKEN).ok();
        if let Some(secs) = env_parse::<u64>(ENV_UPSTREAM_TIMEOUT)? {
            config.request_timeout = Duration::from_secs(secs);
        }
        Ok(config)
    }
}

/// Poll-loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Fixed sleep between upstream fetches
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,
    /// Opaque tag carried by the terminal `complete` event
    pub complete_tag: String,
    /// Longest time a viewer stays attached; it is detached afterwards and
    /// has to reconnect
    #[serde(with = "duration_secs")]
    pub subscriber_timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            poll_interval: Duration::from_secs(1),
            complete_tag: "done".to_string(),
            subscriber_timeout: Duration::from_secs(3600),
        }
    }
}

impl StreamConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(ms) = env_parse::<u64>(ENV_POLL_INTERVAL_MS)? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = env_parse::<u64>(ENV_SUBSCRIBER_TIMEOUT)? {
            config.subscriber_timeout = Duration::from_secs(secs);
        }
        Ok(config)
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_subscriber_timeout(mut self, timeout: Duration) -> Self {
        self.subscriber_timeout = timeout;
        self
    }
}

/// Post-build worker pool sizing
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PostBuildConfig {
    /// Number of worker tasks
    pub workers: usize,
    /// Jobs that may wait for a worker before submissions are rejected
    pub queue_capacity: usize,
}

impl Default for PostBuildConfig {
    fn default() -> Self {
        PostBuildConfig {
            workers: 2,
            queue_capacity: 32,
        }
    }
}

impl PostBuildConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(workers) = env_parse::<usize>(ENV_WORKERS)? {
            config.workers = workers;
        }
        if let Some(queue) = env_parse::<usize>(ENV_QUEUE)? {
            config.queue_capacity = queue;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid {
                key: ENV_WORKERS,
                value: "0".to_string(),
            });
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                key: ENV_QUEUE,
                value: "0".to_string(),
            });
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
        Err(_) => Ok(None),
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
