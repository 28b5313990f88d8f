//! Synthesis errors.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SynthError {
    #[error(transparent)]
    Core(#[from] infrakit_core::Error),

    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("bundling failed for asset '{asset}': {message}")]
    Bundling { asset: String, message: String },

    #[error("invalid cloud assembly: {0}")]
    InvalidAssembly(String),
}

impl SynthError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SynthError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type SynthResult<T> = std::result::Result<T, SynthError>;
