//! Error types for k2filter.

use thiserror::Error;

/// Error type for k2filter operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Another filter already uses this name or URL
    #[error("filter with this name or URL already exists")]
    Duplicate,

    /// No filter with this URL in the registry
    #[error("filter {0} not found")]
    NotFound(String),

    /// Transport-level failure (DNS, connect, timeout)
    #[error("network error while downloading {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: Box<ureq::Transport>,
    },

    /// Server answered with something other than 200 or 304
    #[error("couldn't download filter from {url}: status code {status}")]
    HttpStatus { url: String, status: u16 },

    /// Payload contains control or binary bytes
    #[error("data contains non-printable characters")]
    NonPrintable,

    /// Payload looks like an HTML page
    #[error("data is HTML, not plain text")]
    HtmlContent,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether this failure happened at the transport level.
    ///
    /// The scheduler retries such filters after a short delay instead of
    /// waiting for the regular update interval.
    pub fn is_network(&self) -> bool {
        matches!(self, Error::Network { .. })
    }
}

/// Result type alias for k2filter operations.
pub type Result<T> = std::result::Result<T, Error>;
