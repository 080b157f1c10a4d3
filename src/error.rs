//! Error taxonomy for the pipeline.
//!
//! `PipelineError` is fatal for a region run. `EnrichmentError` is always
//! recovered locally into a per-record error string.

use thiserror::Error;

use crate::pipeline::Stage;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("required source {source_name} unavailable: {reason}")]
    SourceUnavailable { source_name: String, reason: String },

    #[error("no cached artifact for stage {0}; run the earlier stages first")]
    MissingCache(Stage),

    #[error("stage cache error: {0}")]
    Cache(#[from] sled::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl PipelineError {
    pub fn config(msg: impl Into<String>) -> Self {
        PipelineError::Configuration(msg.into())
    }

    pub fn unavailable(source_name: impl Into<String>, reason: impl Into<String>) -> Self {
        PipelineError::SourceUnavailable {
            source_name: source_name.into(),
            reason: reason.into(),
        }
    }

    /// Configuration errors stop every region; the rest end only the current one
    pub fn aborts_run(&self) -> bool {
        matches!(self, PipelineError::Configuration(_))
    }
}

#[derive(Error, Debug)]
pub enum EnrichmentError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {0}")]
    Status(u16),

    #[error("rate limited")]
    RateLimited,

    #[error("timed out")]
    Timeout,

    #[error("parse error: {0}")]
    Parse(String),

    #[error("no route found")]
    NoRoute,

    #[error("missing credential {0}")]
    MissingCredential(&'static str),
}

impl EnrichmentError {
    /// Transient failures worth another attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            EnrichmentError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            EnrichmentError::Status(code) => *code >= 500,
            EnrichmentError::RateLimited | EnrichmentError::Timeout => true,
            EnrichmentError::Parse(_)
            | EnrichmentError::NoRoute
            | EnrichmentError::MissingCredential(_) => false,
        }
    }

    /// Map a non-success HTTP status onto the taxonomy
    pub fn from_status(status: reqwest::StatusCode) -> Self {
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            EnrichmentError::RateLimited
        } else if status == reqwest::StatusCode::GATEWAY_TIMEOUT
            || status == reqwest::StatusCode::REQUEST_TIMEOUT
        {
            EnrichmentError::Timeout
        } else {
            EnrichmentError::Status(status.as_u16())
        }
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(EnrichmentError::RateLimited.is_retryable());
        assert!(EnrichmentError::Status(503).is_retryable());
        assert!(!EnrichmentError::Status(404).is_retryable());
        assert!(!EnrichmentError::Parse("bad".into()).is_retryable());
        assert!(!EnrichmentError::MissingCredential("GOOGLE_API_KEY").is_retryable());
    }

    #[test]
    fn test_only_configuration_aborts_run() {
        assert!(PipelineError::config("malformed perimeter").aborts_run());
        assert!(!PipelineError::unavailable("geonames", "HTTP 503").aborts_run());
        assert!(!PipelineError::MissingCache(Stage::Filter).aborts_run());
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            EnrichmentError::from_status(reqwest::StatusCode::TOO_MANY_REQUESTS),
            EnrichmentError::RateLimited
        ));
        assert!(matches!(
            EnrichmentError::from_status(reqwest::StatusCode::BAD_GATEWAY),
            EnrichmentError::Status(502)
        ));
    }
}
