pub mod auth;
pub mod compute;
pub mod config;
pub mod gcp;
pub mod metrics;
pub mod provision;
pub mod server;
pub mod sources;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Provider API error ({status}): {message}")]
    Provider { status: u16, message: String },
    #[error("Operation {operation} failed: {message}")]
    Operation { operation: String, message: String },
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Ambiguous match: {0}")]
    Ambiguous(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True when the provider reported that the resource already exists.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Provider { status: 409, .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_classification() {
        let conflict = Error::Provider { status: 409, message: "exists".into() };
        assert!(conflict.is_conflict());

        let missing = Error::Provider { status: 404, message: "gone".into() };
        assert!(!missing.is_conflict());
        assert!(!Error::Internal("boom".into()).is_conflict());
    }
}
