use std::{env, time::Duration};

use reqwest::Url;
use thiserror::Error;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:3000";
pub const DEFAULT_COMPLETION_PATH: &str = "/api/chat";
pub const DEFAULT_SUMMARY_PATH: &str = "/api/resumen";
pub const DEFAULT_STREAM_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_STREAM_MAX_RETRIES: u32 = 3;
pub const DEFAULT_STREAM_BACKOFF_STEP_MS: u64 = 1_000;
pub const DEFAULT_PAUSE_GRACE_MS: u64 = 60_000;
pub const DEFAULT_VISIBILITY_DEBOUNCE_MS: u64 = 500;
pub const MIN_VISIBILITY_DEBOUNCE_MS: u64 = 100;
pub const MAX_VISIBILITY_DEBOUNCE_MS: u64 = 500;
pub const DEFAULT_AUTH_RESYNC_MIN_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_RESUBSCRIBE_DELAY_MS: u64 = 100;
pub const DEFAULT_REGISTRY_SWEEP_INTERVAL_MS: u64 = 60_000;
pub const DEFAULT_REGISTRY_STALE_AFTER_MS: u64 = 300_000;
pub const DEFAULT_BOOTSTRAP_PROMPT: &str = "¿Me orientas en mi busqueda profesional? Primero cuentame como puedo empezar este ejercicio";
pub const DEFAULT_FAILURE_NOTICE: &str =
    "Error: No se pudo establecer la conexión. Por favor, intenta de nuevo.";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid RUTEA_CHAT_BASE_URL: {0}")]
    InvalidBaseUrl(String),
    #[error("invalid RUTEA_CHAT_COMPLETION_PATH: {0}")]
    InvalidCompletionPath(String),
    #[error("invalid RUTEA_CHAT_SUMMARY_PATH: {0}")]
    InvalidSummaryPath(String),
    #[error("invalid RUTEA_CHAT_STREAM_TIMEOUT_MS: {0}")]
    InvalidStreamTimeoutMs(String),
    #[error("invalid RUTEA_CHAT_STREAM_MAX_RETRIES: {0}")]
    InvalidStreamMaxRetries(String),
    #[error("invalid RUTEA_CHAT_STREAM_BACKOFF_STEP_MS: {0}")]
    InvalidStreamBackoffStepMs(String),
    #[error("invalid RUTEA_CHAT_LOADING_TIMEOUT_MS: {0}")]
    InvalidLoadingTimeoutMs(String),
    #[error("invalid RUTEA_CHAT_PAUSE_GRACE_MS: {0}")]
    InvalidPauseGraceMs(String),
    #[error("invalid RUTEA_CHAT_VISIBILITY_DEBOUNCE_MS: {0}")]
    InvalidVisibilityDebounceMs(String),
    #[error("invalid RUTEA_CHAT_AUTH_RESYNC_MIN_INTERVAL_MS: {0}")]
    InvalidAuthResyncMinIntervalMs(String),
    #[error("invalid RUTEA_CHAT_RESUBSCRIBE_DELAY_MS: {0}")]
    InvalidResubscribeDelayMs(String),
    #[error("invalid RUTEA_CHAT_REGISTRY_SWEEP_INTERVAL_MS: {0}")]
    InvalidRegistrySweepIntervalMs(String),
    #[error("invalid RUTEA_CHAT_REGISTRY_STALE_AFTER_MS: {0}")]
    InvalidRegistryStaleAfterMs(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    pub base_url: String,
    pub completion_path: String,
    pub summary_path: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            completion_path: DEFAULT_COMPLETION_PATH.to_string(),
            summary_path: DEFAULT_SUMMARY_PATH.to_string(),
        }
    }
}

impl EndpointConfig {
    pub fn new(base_url: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            base_url: normalize_base_url(base_url)?,
            ..Self::default()
        })
    }

    #[must_use]
    pub fn completion_url(&self) -> String {
        join_url(&self.base_url, &self.completion_path)
    }

    #[must_use]
    pub fn summary_url(&self) -> String {
        join_url(&self.base_url, &self.summary_path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    /// Ceiling for one attempt, from request to sentinel.
    pub timeout: Duration,
    pub max_retries: u32,
    pub backoff_step: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(DEFAULT_STREAM_TIMEOUT_MS),
            max_retries: DEFAULT_STREAM_MAX_RETRIES,
            backoff_step: Duration::from_millis(DEFAULT_STREAM_BACKOFF_STEP_MS),
        }
    }
}

impl StreamConfig {
    /// Delay before retry number `retry` (1-based): `retry * backoff_step`.
    #[must_use]
    pub fn backoff_for(&self, retry: u32) -> Duration {
        self.backoff_step.saturating_mul(retry)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleConfig {
    pub pause_grace: Duration,
    pub debounce: Duration,
    pub auth_resync_min_interval: Duration,
    pub resubscribe_delay: Duration,
    pub auto_resubscribe: bool,
    pub auth_resync: bool,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            pause_grace: Duration::from_millis(DEFAULT_PAUSE_GRACE_MS),
            debounce: Duration::from_millis(DEFAULT_VISIBILITY_DEBOUNCE_MS),
            auth_resync_min_interval: Duration::from_millis(DEFAULT_AUTH_RESYNC_MIN_INTERVAL_MS),
            resubscribe_delay: Duration::from_millis(DEFAULT_RESUBSCRIBE_DELAY_MS),
            auto_resubscribe: true,
            auth_resync: true,
        }
    }
}

impl LifecycleConfig {
    #[must_use]
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = clamp_debounce(debounce);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    pub sweep_interval: Duration,
    pub stale_after: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_millis(DEFAULT_REGISTRY_SWEEP_INTERVAL_MS),
            stale_after: Duration::from_millis(DEFAULT_REGISTRY_STALE_AFTER_MS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Sent automatically when an owner has no history.
    pub bootstrap_prompt: String,
    /// Shown in place of an assistant turn that could not be produced.
    pub failure_notice: String,
    pub loading_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            bootstrap_prompt: DEFAULT_BOOTSTRAP_PROMPT.to_string(),
            failure_notice: DEFAULT_FAILURE_NOTICE.to_string(),
            loading_timeout: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatClientConfig {
    pub endpoints: EndpointConfig,
    pub stream: StreamConfig,
    pub lifecycle: LifecycleConfig,
    pub registry: RegistryConfig,
    pub session: SessionConfig,
}

impl ChatClientConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| lookup(key).map(|value| value.trim().to_string());

        let base_url = normalize_base_url(
            &read("RUTEA_CHAT_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        )?;
        let completion_path = normalize_path(
            read("RUTEA_CHAT_COMPLETION_PATH")
                .unwrap_or_else(|| DEFAULT_COMPLETION_PATH.to_string()),
        )
        .ok_or_else(|| ConfigError::InvalidCompletionPath("empty path".to_string()))?;
        let summary_path = normalize_path(
            read("RUTEA_CHAT_SUMMARY_PATH").unwrap_or_else(|| DEFAULT_SUMMARY_PATH.to_string()),
        )
        .ok_or_else(|| ConfigError::InvalidSummaryPath("empty path".to_string()))?;

        let stream_timeout = read("RUTEA_CHAT_STREAM_TIMEOUT_MS")
            .unwrap_or_else(|| DEFAULT_STREAM_TIMEOUT_MS.to_string())
            .parse::<u64>()
            .map_err(|error| ConfigError::InvalidStreamTimeoutMs(error.to_string()))?;
        let max_retries = read("RUTEA_CHAT_STREAM_MAX_RETRIES")
            .unwrap_or_else(|| DEFAULT_STREAM_MAX_RETRIES.to_string())
            .parse::<u32>()
            .map_err(|error| ConfigError::InvalidStreamMaxRetries(error.to_string()))?;
        let backoff_step = read("RUTEA_CHAT_STREAM_BACKOFF_STEP_MS")
            .unwrap_or_else(|| DEFAULT_STREAM_BACKOFF_STEP_MS.to_string())
            .parse::<u64>()
            .map_err(|error| ConfigError::InvalidStreamBackoffStepMs(error.to_string()))?;
        let loading_timeout = read("RUTEA_CHAT_LOADING_TIMEOUT_MS")
            .filter(|value| !value.is_empty())
            .map(|value| value.parse::<u64>())
            .transpose()
            .map_err(|error| ConfigError::InvalidLoadingTimeoutMs(error.to_string()))?;
        let pause_grace = read("RUTEA_CHAT_PAUSE_GRACE_MS")
            .unwrap_or_else(|| DEFAULT_PAUSE_GRACE_MS.to_string())
            .parse::<u64>()
            .map_err(|error| ConfigError::InvalidPauseGraceMs(error.to_string()))?;
        let debounce = read("RUTEA_CHAT_VISIBILITY_DEBOUNCE_MS")
            .unwrap_or_else(|| DEFAULT_VISIBILITY_DEBOUNCE_MS.to_string())
            .parse::<u64>()
            .map_err(|error| ConfigError::InvalidVisibilityDebounceMs(error.to_string()))?;
        let auth_resync_min_interval = read("RUTEA_CHAT_AUTH_RESYNC_MIN_INTERVAL_MS")
            .unwrap_or_else(|| DEFAULT_AUTH_RESYNC_MIN_INTERVAL_MS.to_string())
            .parse::<u64>()
            .map_err(|error| ConfigError::InvalidAuthResyncMinIntervalMs(error.to_string()))?;
        let resubscribe_delay = read("RUTEA_CHAT_RESUBSCRIBE_DELAY_MS")
            .unwrap_or_else(|| DEFAULT_RESUBSCRIBE_DELAY_MS.to_string())
            .parse::<u64>()
            .map_err(|error| ConfigError::InvalidResubscribeDelayMs(error.to_string()))?;
        let sweep_interval = read("RUTEA_CHAT_REGISTRY_SWEEP_INTERVAL_MS")
            .unwrap_or_else(|| DEFAULT_REGISTRY_SWEEP_INTERVAL_MS.to_string())
            .parse::<u64>()
            .map_err(|error| ConfigError::InvalidRegistrySweepIntervalMs(error.to_string()))?;
        let stale_after = read("RUTEA_CHAT_REGISTRY_STALE_AFTER_MS")
            .unwrap_or_else(|| DEFAULT_REGISTRY_STALE_AFTER_MS.to_string())
            .parse::<u64>()
            .map_err(|error| ConfigError::InvalidRegistryStaleAfterMs(error.to_string()))?;
        if sweep_interval == 0 {
            return Err(ConfigError::InvalidRegistrySweepIntervalMs(
                "must be greater than zero".to_string(),
            ));
        }

        let bootstrap_prompt = read("RUTEA_CHAT_BOOTSTRAP_PROMPT")
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_BOOTSTRAP_PROMPT.to_string());

        Ok(Self {
            endpoints: EndpointConfig {
                base_url,
                completion_path,
                summary_path,
            },
            stream: StreamConfig {
                timeout: Duration::from_millis(stream_timeout.max(1)),
                max_retries,
                backoff_step: Duration::from_millis(backoff_step),
            },
            lifecycle: LifecycleConfig {
                pause_grace: Duration::from_millis(pause_grace),
                debounce: clamp_debounce(Duration::from_millis(debounce)),
                auth_resync_min_interval: Duration::from_millis(auth_resync_min_interval),
                resubscribe_delay: Duration::from_millis(resubscribe_delay),
                ..LifecycleConfig::default()
            },
            registry: RegistryConfig {
                sweep_interval: Duration::from_millis(sweep_interval),
                stale_after: Duration::from_millis(stale_after),
            },
            session: SessionConfig {
                bootstrap_prompt,
                loading_timeout: loading_timeout.map(Duration::from_millis),
                ..SessionConfig::default()
            },
        })
    }
}

fn clamp_debounce(debounce: Duration) -> Duration {
    debounce.clamp(
        Duration::from_millis(MIN_VISIBILITY_DEBOUNCE_MS),
        Duration::from_millis(MAX_VISIBILITY_DEBOUNCE_MS),
    )
}

pub(crate) fn normalize_base_url(base_url: &str) -> Result<String, ConfigError> {
    let trimmed = base_url.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(ConfigError::InvalidBaseUrl("empty base url".to_string()));
    }
    let parsed = Url::parse(trimmed).map_err(|error| ConfigError::InvalidBaseUrl(error.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(ConfigError::InvalidBaseUrl(format!(
            "expected http(s) url with host, got {trimmed}"
        )));
    }
    Ok(trimmed.to_string())
}

fn normalize_path(path: String) -> Option<String> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.starts_with('/') {
        Some(trimmed.to_string())
    } else {
        Some(format!("/{trimmed}"))
    }
}

fn join_url(base_url: &str, path: &str) -> String {
    if path.starts_with('/') {
        format!("{base_url}{path}")
    } else {
        format!("{base_url}/{path}")
    }
}
