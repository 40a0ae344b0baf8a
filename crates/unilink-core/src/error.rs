use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the engine's own API. Resolution failures never appear
/// here; they are recorded on the annotation as `state = error`.
#[derive(Debug, Error)]
pub enum UnilinkError {
    #[error("metrics registry error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("range {start}..{end} is not a valid position in text of {len} bytes")]
    InvalidRange { start: usize, end: usize, len: usize },

    #[error("no annotation with mark id {0}")]
    UnknownMark(String),

    #[error(transparent)]
    PageBackend(#[from] SearchError),

    #[error("malformed link element: {0}")]
    MalformedElement(String),

    #[error("failed to read persisted fragment: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Failure reported by a page search or page creation backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("page backend failure: {message}")]
pub struct SearchError {
    pub message: String,
}

impl SearchError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// `origin` is the file path, or `<inline>` for string input.
    #[error("failed to parse config {origin}: {source}")]
    Parse {
        origin: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

pub type Result<T, E = UnilinkError> = std::result::Result<T, E>;
