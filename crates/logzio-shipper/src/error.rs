// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

use reqwest::StatusCode;

/// Configuration could not be read or is inconsistent.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} environment variable is not set")]
    Missing(&'static str),

    #[error("Invalid value '{value}' for {key}")]
    InvalidValue { key: &'static str, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// A raw producer line that is not valid JSON. The line is dropped.
#[derive(Debug, thiserror::Error)]
#[error("Error parsing JSON on line {line}: {source}")]
pub struct ParseError {
    pub line: usize,
    #[source]
    pub source: serde_json::Error,
}

/// A single delivery attempt failed. Every variant is retryable.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Listener responded with {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Appending to or rotating the local backup failed. Data staged by the failing
/// call is lost.
#[derive(Debug, thiserror::Error)]
pub enum StagingError {
    #[error("Failed to write backup path {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Uploading a staged file to the object store failed. The file stays queued.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("Failed to read staged file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Object store rejected {key} with {status}")]
    Status { key: String, status: StatusCode },

    #[error("Object store transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Failed to write object {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors surfaced by the orchestrator itself. Per-event and per-batch failures
/// never surface here; they are logged and handled inside the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum ShipperError {
    #[error("Shipper is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to prepare backup store: {0}")]
    Backup(#[from] StagingError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let error = ConfigError::Missing("LOGZIO_TOKEN");
        assert_eq!(
            error.to_string(),
            "LOGZIO_TOKEN environment variable is not set"
        );

        let error = ConfigError::InvalidValue {
            key: "BUFFER_SIZE",
            value: "lots".to_string(),
        };
        assert_eq!(error.to_string(), "Invalid value 'lots' for BUFFER_SIZE");
    }

    #[test]
    fn test_parse_error_display() {
        let source = serde_json::from_str::<serde_json::Value>("not-json").unwrap_err();
        let error = ParseError { line: 2, source };
        assert!(error.to_string().starts_with("Error parsing JSON on line 2"));
    }

    #[test]
    fn test_delivery_error_status_display() {
        let error = DeliveryError::Status {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: "boom".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Listener responded with 500 Internal Server Error: boom"
        );
    }

    #[test]
    fn test_shipper_error_wraps_config_error() {
        let error: ShipperError = ConfigError::Invalid("thread_count must be > 0".into()).into();
        assert_eq!(
            error.to_string(),
            "Invalid configuration: thread_count must be > 0"
        );
    }
}
