//! Error types shared by the release lifecycle engine.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failures reported by a [`ReleaseSource`](crate::github::ReleaseSource).
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },
    #[error("{url} responded with HTTP {status}")]
    Status { url: String, status: u16 },
}

impl RemoteError {
    pub fn status(&self) -> Option<u16> {
        match self {
            RemoteError::Status { status, .. } => Some(*status),
            RemoteError::Transport { .. } => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum RelmaError {
    #[error("malformed release reference '{input}': {reason}")]
    MalformedReference { input: String, reason: String },

    #[error("no release tag found for {owner}/{repo}: {reason}")]
    NotFound {
        owner: String,
        repo: String,
        reason: String,
        #[source]
        source: Option<RemoteError>,
    },

    #[error("failed to download {url}")]
    Download {
        url: String,
        #[source]
        source: RemoteError,
    },

    #[error("unsupported asset format for '{asset}': {reason}")]
    UnsupportedFormat { asset: String, reason: String },

    #[error("no installable executable found in '{asset}'")]
    NoInstallableFile { asset: String },

    #[error("{owner}/{repo} is not installed")]
    NotTracked { owner: String, repo: String },

    #[error("failed to {action} manifest {}", .path.display())]
    ManifestIo {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("filesystem operation failed on {}", .path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl RelmaError {
    pub(crate) fn filesystem(path: impl Into<PathBuf>, source: io::Error) -> Self {
        RelmaError::Filesystem {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn malformed(input: &str, reason: impl Into<String>) -> Self {
        RelmaError::MalformedReference {
            input: input.to_string(),
            reason: reason.into(),
        }
    }

    /// Short message class used when presenting the error.
    pub fn class(&self) -> &'static str {
        match self {
            RelmaError::MalformedReference { .. } => "reference",
            RelmaError::NotFound { .. } => "not-found",
            RelmaError::Download { .. } => "download",
            RelmaError::UnsupportedFormat { .. } => "format",
            RelmaError::NoInstallableFile { .. } => "no-executable",
            RelmaError::NotTracked { .. } => "not-installed",
            RelmaError::ManifestIo { .. } => "manifest",
            RelmaError::Filesystem { .. } => "filesystem",
        }
    }
}

pub type Result<T> = std::result::Result<T, RelmaError>;
