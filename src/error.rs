//! Error taxonomy for the ingestion pipeline

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The platform served a bot-verification challenge instead of content.
    #[error("blocked by {platform} bot verification while loading {url}")]
    Blocked { platform: String, url: String },

    /// A card or message could not be turned into the required fields.
    #[error("extraction failed: {0}")]
    Extraction(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("network error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("browser API error (status {status}): {message}")]
    Browser { status: u16, message: String },

    #[error("upstream API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("monitor stopped after {count} consecutive cycle failures")]
    ConsecutiveCycleFailure { count: u32 },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn extraction(msg: impl Into<String>) -> Self {
        Error::Extraction(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    /// Errors that must end the process rather than be logged and skipped.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Configuration(_) | Error::ConsecutiveCycleFailure { .. }
        )
    }
}
