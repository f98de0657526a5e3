// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::constants::{
    BACKUP_ROOT_NAME, DEFAULT_BUFFER_SIZE, DEFAULT_ENDPOINT_URL, DEFAULT_FILE_MAX_RECORDS,
    DEFAULT_FOLDER_MAX_SIZE_MB, DEFAULT_INTERVAL_TIME_MS, DEFAULT_LOG_TYPE, DEFAULT_MAX_RETRIES,
    DEFAULT_REQUEST_TIMEOUT_SECS, DEFAULT_RETRY_DELAY_MS, DEFAULT_THREAD_COUNT,
};
use crate::error::ConfigError;
use crate::flusher::RetryStrategy;

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Shape of the request body sent to the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// One POST per batch, newline-joined JSON documents.
    #[default]
    Batched,
    /// One POST per record.
    PerRecord,
}

impl FromStr for DeliveryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "batched" | "batch" => Ok(DeliveryMode::Batched),
            "per_record" | "per-record" | "record" => Ok(DeliveryMode::PerRecord),
            other => Err(format!("unknown delivery mode '{other}'")),
        }
    }
}

/// How the delay between delivery attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackoffKind {
    #[default]
    Exponential,
    Fixed,
}

impl FromStr for BackoffKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "exponential" | "exp" => Ok(BackoffKind::Exponential),
            "fixed" | "linear" => Ok(BackoffKind::Fixed),
            other => Err(format!("unknown backoff '{other}'")),
        }
    }
}

/// Shipper configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listener URL, without query string.
    pub endpoint_url: String,
    /// Logz.io shipping token, sent as the `token` query parameter.
    pub auth_token: String,
    /// Value of the `type` query parameter.
    pub log_type: String,
    /// Number of delivery workers.
    pub thread_count: usize,
    /// Records per batch before it is sealed.
    pub buffer_size: usize,
    /// Maximum age of an in-progress batch.
    pub interval_time: Duration,
    /// Total delivery attempts per batch, including the first.
    pub max_retries: u32,
    /// Base delay between attempts.
    pub retry_delay: Duration,
    pub backoff: BackoffKind,
    /// Randomize each backoff delay by up to half its length.
    pub jitter: bool,
    pub delivery_mode: DeliveryMode,
    /// Per-request timeout for the listener and the object store.
    pub request_timeout: Duration,
    pub folder_max_size_mb: u64,
    pub file_max_records: usize,
    /// Prune null, empty-string and empty-object fields during normalization.
    pub parse_empty_fields: bool,
    /// Root directory for staged backup folders.
    pub backup_dir: PathBuf,
    /// Azure Blob container URL. When unset, staged files are copied to
    /// `backup_upload_dir` instead.
    pub backup_container_url: Option<String>,
    pub backup_sas_token: Option<String>,
    pub backup_upload_dir: Option<PathBuf>,
    pub https_proxy: Option<String>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint_url: DEFAULT_ENDPOINT_URL.to_string(),
            auth_token: String::new(),
            log_type: DEFAULT_LOG_TYPE.to_string(),
            thread_count: DEFAULT_THREAD_COUNT,
            buffer_size: DEFAULT_BUFFER_SIZE,
            interval_time: Duration::from_millis(DEFAULT_INTERVAL_TIME_MS),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            backoff: BackoffKind::default(),
            jitter: false,
            delivery_mode: DeliveryMode::default(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            folder_max_size_mb: DEFAULT_FOLDER_MAX_SIZE_MB,
            file_max_records: DEFAULT_FILE_MAX_RECORDS,
            parse_empty_fields: true,
            backup_dir: env::temp_dir().join(BACKUP_ROOT_NAME),
            backup_container_url: None,
            backup_sas_token: None,
            backup_upload_dir: None,
            https_proxy: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup. Unset keys fall back to
    /// their defaults; `LOGZIO_TOKEN` is required.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|val| !val.trim().is_empty());

        let auth_token = get("LOGZIO_TOKEN").ok_or(ConfigError::Missing("LOGZIO_TOKEN"))?;

        let config = Self {
            endpoint_url: get("LOGZIO_ENDPOINT_URL").unwrap_or(defaults.endpoint_url),
            auth_token,
            log_type: get("LOGZIO_TYPE").unwrap_or(defaults.log_type),
            thread_count: parse_var(&get, "THREAD_COUNT", defaults.thread_count)?,
            buffer_size: parse_var(&get, "BUFFER_SIZE", defaults.buffer_size)?,
            interval_time: Duration::from_millis(parse_var(
                &get,
                "INTERVAL_TIME",
                DEFAULT_INTERVAL_TIME_MS,
            )?),
            max_retries: parse_var(&get, "MAX_RETRIES", defaults.max_retries)?,
            retry_delay: Duration::from_millis(parse_var(
                &get,
                "RETRY_DELAY_MS",
                DEFAULT_RETRY_DELAY_MS,
            )?),
            backoff: parse_var(&get, "RETRY_BACKOFF", defaults.backoff)?,
            jitter: parse_bool(&get, "RETRY_JITTER", defaults.jitter)?,
            delivery_mode: parse_var(&get, "DELIVERY_MODE", defaults.delivery_mode)?,
            request_timeout: Duration::from_secs(parse_var(
                &get,
                "REQUEST_TIMEOUT_SECS",
                DEFAULT_REQUEST_TIMEOUT_SECS,
            )?),
            folder_max_size_mb: parse_var(
                &get,
                "FOLDER_MAX_SIZE_MB",
                defaults.folder_max_size_mb,
            )?,
            file_max_records: parse_var(&get, "FILE_MAX_RECORDS", defaults.file_max_records)?,
            parse_empty_fields: parse_bool(
                &get,
                "PARSE_EMPTY_FIELDS",
                defaults.parse_empty_fields,
            )?,
            backup_dir: get("BACKUP_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.backup_dir),
            backup_container_url: get("AZURE_STORAGE_CONTAINER_URL"),
            backup_sas_token: get("AZURE_STORAGE_SAS_TOKEN"),
            backup_upload_dir: get("BACKUP_UPLOAD_DIR").map(PathBuf::from),
            https_proxy: get("HTTPS_PROXY"),
            log_level: get("LOGZIO_LOG_LEVEL")
                .map(|val| val.to_lowercase())
                .unwrap_or(defaults.log_level),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auth_token.trim().is_empty() {
            return Err(ConfigError::Missing("LOGZIO_TOKEN"));
        }

        if reqwest::Url::parse(&self.endpoint_url).is_err() {
            return Err(ConfigError::InvalidValue {
                key: "LOGZIO_ENDPOINT_URL",
                value: self.endpoint_url.clone(),
            });
        }

        if let Some(container_url) = &self.backup_container_url {
            if reqwest::Url::parse(container_url).is_err() {
                return Err(ConfigError::InvalidValue {
                    key: "AZURE_STORAGE_CONTAINER_URL",
                    value: container_url.clone(),
                });
            }
        }

        let positive = [
            ("thread_count", self.thread_count as u64),
            ("buffer_size", self.buffer_size as u64),
            ("max_retries", u64::from(self.max_retries)),
            ("folder_max_size_mb", self.folder_max_size_mb),
            ("file_max_records", self.file_max_records as u64),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be greater than 0")));
            }
        }

        if self.interval_time.is_zero() {
            return Err(ConfigError::Invalid(
                "interval_time must be greater than 0".to_string(),
            ));
        }

        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }

    /// Retry policy for delivery workers, derived from the retry settings.
    #[must_use]
    pub fn retry_strategy(&self) -> RetryStrategy {
        let delay_ms = u64::try_from(self.retry_delay.as_millis()).unwrap_or(u64::MAX);
        match self.backoff {
            BackoffKind::Exponential => RetryStrategy::ExponentialBackoff {
                attempts: self.max_retries,
                base_delay_ms: delay_ms,
                jitter: self.jitter,
            },
            BackoffKind::Fixed => RetryStrategy::FixedDelay {
                attempts: self.max_retries,
                delay_ms,
                jitter: self.jitter,
            },
        }
    }
}

fn parse_var<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidValue { key, value }),
        None => Ok(default),
    }
}

fn parse_bool<G>(get: &G, key: &'static str, default: bool) -> Result<bool, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(value) => match value.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(ConfigError::InvalidValue { key, value }),
        },
        None => Ok(default),
    }
}
