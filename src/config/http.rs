use std::{borrow::Cow, time::Duration};

use serde::{Deserialize, Serialize};

/// HTTP client configuration shared by the ARM, Graph and metadata clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "json-schema", derive(schemars::JsonSchema))]
#[serde(deny_unknown_fields)]
pub struct HttpClientConfig {
    /// Request timeout in seconds.
    #[serde(default = "default_http_client_timeout")]
    pub timeout_secs: u64,

    /// Enable verbose connection logging for debugging.
    #[serde(default)]
    pub verbose: bool,

    /// Connection timeout in seconds.
    #[serde(default = "default_http_client_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Maximum idle connections to keep per host.
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds.
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// TCP keepalive interval in seconds. 0 disables keepalive.
    #[serde(default = "default_tcp_keepalive")]
    pub tcp_keepalive_secs: u64,

    /// User-Agent header sent with ARM and Graph requests.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_http_client_timeout(),
            verbose: false,
            connect_timeout_secs: default_http_client_connect_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            tcp_keepalive_secs: default_tcp_keepalive(),
            user_agent: default_user_agent(),
        }
    }
}

impl HttpClientConfig {
    /// Build a reqwest Client from this configuration.
    pub fn build_client(&self) -> Result<reqwest::Client, reqwest::Error> {
        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .connection_verbose(self.verbose)
            .connect_timeout(Duration::from_secs(self.connect_timeout_secs))
            .pool_max_idle_per_host(self.pool_max_idle_per_host)
            .pool_idle_timeout(Duration::from_secs(self.pool_idle_timeout_secs))
            .user_agent(&self.user_agent);

        // TCP keepalive (0 means disabled)
        if self.tcp_keepalive_secs > 0 {
            builder = builder.tcp_keepalive(Duration::from_secs(self.tcp_keepalive_secs));
        }

        builder.build()
    }
}

// Management-plane calls are short; 60 seconds covers slow ARM writes.
fn default_http_client_timeout() -> u64 {
    60
}

fn default_http_client_connect_timeout() -> u64 {
    10
}

fn default_pool_max_idle_per_host() -> usize {
    4
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_tcp_keepalive() -> u64 {
    60
}

fn default_user_agent() -> String {
    format!("cti-provision/{}", env!("CARGO_PKG_VERSION"))
}

/// Retry configuration for ARM and Graph calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "json-schema", derive(schemars::JsonSchema))]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Whether retries are enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum number of retry attempts (not including the initial request).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial delay before first retry in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Multiplier for exponential backoff.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (percentage, 0.0-1.0).
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Status codes that should trigger a retry.
    /// Default: 429 (throttling), 500, 502, 503, 504.
    #[serde(default = "default_retryable_status_codes")]
    pub retryable_status_codes: Vec<u16>,

    /// Override max_retries for non-idempotent Graph POSTs (group creation,
    /// template instantiation, certificate attachment). Default: 1
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutation_max_retries: Option<u32>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: default_jitter(),
            retryable_status_codes: default_retryable_status_codes(),
            mutation_max_retries: None,
        }
    }
}

const MUTATION_MAX_RETRIES: u32 = 1;

impl RetryConfig {
    /// A config that never retries.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Check if a status code should trigger a retry.
    pub fn should_retry_status(&self, status: u16) -> bool {
        self.enabled && self.retryable_status_codes.contains(&status)
    }

    /// Calculate the delay for a given retry attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        backoff_delay(
            self.initial_delay_ms,
            self.max_delay_ms,
            self.backoff_multiplier,
            self.jitter,
            attempt,
        )
    }

    /// Retry config for POSTs that create a new object on every call.
    pub fn for_mutation(&self) -> Cow<'_, Self> {
        let target = self.mutation_max_retries.unwrap_or(MUTATION_MAX_RETRIES);
        if self.max_retries == target {
            Cow::Borrowed(self)
        } else {
            Cow::Owned(Self {
                max_retries: target,
                ..self.clone()
            })
        }
    }
}

/// Exponential backoff with a cap and symmetric jitter.
pub(crate) fn backoff_delay(
    initial_ms: u64,
    max_ms: u64,
    multiplier: f64,
    jitter: f64,
    attempt: u32,
) -> Duration {
    let base_delay = (initial_ms as f64) * multiplier.powi(attempt as i32);
    let capped_delay = base_delay.min(max_ms as f64);

    let jitter_range = capped_delay * jitter;
    let jitter = if jitter_range > 0.0 {
        use rand::Rng;
        rand::thread_rng().gen_range(-jitter_range..jitter_range)
    } else {
        0.0
    };

    let final_delay = (capped_delay + jitter).max(0.0);
    Duration::from_millis(final_delay as u64)
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.1
}

fn default_retryable_status_codes() -> Vec<u16> {
    vec![429, 500, 502, 503, 504]
}
