use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("missing required dependencies: {}", .0.join(", "))]
    MissingDependencies(Vec<String>),

    #[error("source validation failed: {0}")]
    Validation(String),

    #[error("destination {path} is not empty. {remedy}")]
    UnsafeDestination { path: PathBuf, remedy: String },

    #[error("refusing to touch {}: {reason}", .path.display())]
    Refused { path: PathBuf, reason: String },

    #[error("{operation} failed after {attempts} attempt(s): {detail}")]
    Tool {
        operation: String,
        attempts: u32,
        detail: String,
    },

    #[error("transfer failed: {0}")]
    Transfer(String),

    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error("insufficient resources: {0}")]
    Resource(String),

    #[error("another conversion is already running (pid {pid}, lock {})", .path.display())]
    LockHeld { pid: i32, path: PathBuf },

    #[error("pre-flight check failed: {0}")]
    Preflight(String),

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl PipelineError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Attach a human-readable context to `std::io::Error` results.
pub trait IoContext<T> {
    fn io_context<C: Into<String>>(self, context: impl FnOnce() -> C) -> Result<T>;
}

impl<T> IoContext<T> for std::result::Result<T, std::io::Error> {
    fn io_context<C: Into<String>>(self, context: impl FnOnce() -> C) -> Result<T> {
        self.map_err(|e| PipelineError::io(context(), e))
    }
}
