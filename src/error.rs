use thiserror::Error;

/// Convenience type alias for Results with CosError
pub type Result<T> = std::result::Result<T, CosError>;

/// Main error type for the Chief-of-Staff supervisor
///
/// Variants map to the error taxonomy used at component boundaries:
/// addressing errors (`NotFound`), caller mistakes (`Validation`,
/// `Conflict`), recoverable environment failures (`Io`, `ChildProcess`,
/// `External`), and invariant violations (`Internal`).
#[derive(Error, Debug)]
pub enum CosError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Child process error: {message}")]
    ChildProcess { message: String },

    #[error("Agent error: {agent_id} - {message}")]
    Agent { agent_id: String, message: String },

    #[error("Task error: {task_id} - {message}")]
    Task { task_id: String, message: String },

    #[error("Git error: {message}")]
    Git { message: String },

    #[error("External tool error: {0}")]
    External(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Timeout: {message}")]
    Timeout { message: String },

    #[error("Queue is full")]
    QueueFull,

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl CosError {
    /// Errors of every kind except `Internal` are recorded or degraded at
    /// the component boundary rather than propagated to the scheduler.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, CosError::Internal(_))
    }

    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        CosError::Io {
            path: path.into(),
            source,
        }
    }
}
