use std::io;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

pub type AppResult<T> = Result<T, AppError>;

/// Failure raised by a review extractor, optionally with a screenshot of the page
/// at the moment it gave up.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ExtractionFailure {
    pub message: String,
    pub screenshot: Option<PathBuf>,
}

impl ExtractionFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            screenshot: None,
        }
    }

    pub fn with_screenshot(mut self, path: Option<PathBuf>) -> Self {
        self.screenshot = path;
        self
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("upstream fetch failed: {0}")]
    Extraction(#[from] ExtractionFailure),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("invalid config file: {0}")]
    ConfigFile(#[from] toml::de::Error),
    #[error("{0}")]
    Config(String),
}

/// Structured error body handed to request callers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEnvelope {
    pub code: &'static str,
    pub message: String,
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
}

impl AppError {
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Extraction(_) => "upstream_fetch_failed",
            AppError::Validation(_) => "validation_failed",
            AppError::NotFound(_) => "not_found",
            _ => "internal_error",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            AppError::Extraction(_) => 502,
            AppError::Validation(_) => 422,
            AppError::NotFound(_) => 404,
            _ => 500,
        }
    }

    pub fn is_internal(&self) -> bool {
        self.status_code() == 500
    }

    pub fn envelope(&self, request_id: &str) -> ErrorEnvelope {
        let (message, screenshot) = match self {
            AppError::Extraction(failure) => (
                failure.message.clone(),
                failure
                    .screenshot
                    .as_ref()
                    .map(|path| path.to_string_lossy().to_string()),
            ),
            AppError::Validation(message) | AppError::NotFound(message) => (message.clone(), None),
            other => {
                error!(request_id, error = ?other, "internal error while serving request");
                ("internal server error".to_string(), None)
            }
        };
        ErrorEnvelope {
            code: self.code(),
            message,
            request_id: request_id.to_string(),
            timestamp: Utc::now(),
            screenshot,
        }
    }
}
