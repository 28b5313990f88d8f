//! Error types for infrakit.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("duplicate construct id '{id}' under '{parent}'")]
    DuplicateId { parent: String, id: String },

    #[error("invalid reference: {0}")]
    InvalidReference(String),

    #[error("cycle detected: {0}")]
    CycleDetected(String),

    #[error("secret error: {0}")]
    Secret(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("deployment failed: {0}")]
    DeploymentFailed(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
