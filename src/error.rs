use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by a mirror operation.
///
/// Only a handful of these ever escape [`crate::MirrorSession`]: network and
/// filesystem failures of individual assets are recorded on the asset and the
/// run carries on.
#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("network error for {url}: {reason}")]
    Network { url: String, reason: String },

    #[error("malformed reference {reference:?}: {reason}")]
    MalformedReference { reference: String, reason: String },

    #[error("filesystem error at {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("failed to rewrite document: {0}")]
    Rewrite(String),

    #[error("failed to serialize manifest: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("mirror cancelled before the root document was retrieved")]
    Cancelled,
}

impl MirrorError {
    pub(crate) fn network(url: impl ToString, reason: impl ToString) -> Self {
        Self::Network {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn filesystem(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Filesystem {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T, E = MirrorError> = std::result::Result<T, E>;
