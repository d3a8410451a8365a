//! Error taxonomy for sessions and requests.
//!
//! Construction-time failures abort before a session exists. Request-time
//! failures are split: anything before the first decoded token is an error,
//! anything after it becomes a [`crate::StopReason`] on a partial result.

use std::path::PathBuf;

use thiserror::Error;

use crate::engine::EngineError;

/// Weights could not be loaded.
#[derive(Debug, Error)]
pub enum ModelLoadError {
    #[error("model file not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("engine rejected model {}", path.display())]
    Rejected {
        path: PathBuf,
        #[source]
        source: EngineError,
    },
}

impl ModelLoadError {
    pub(crate) fn from_engine(path: PathBuf, err: EngineError) -> Self {
        match err {
            EngineError::InvalidPath(_) => ModelLoadError::NotFound { path },
            EngineError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => {
                ModelLoadError::NotFound { path }
            }
            source => ModelLoadError::Rejected { path, source },
        }
    }
}

/// A context could not be allocated on a loaded model.
#[derive(Debug, Error)]
pub enum ContextCreationError {
    #[error("insufficient memory for a context of {requested} positions")]
    OutOfMemory { requested: usize },

    #[error("engine failed to create a context")]
    Engine(#[source] EngineError),
}

impl From<EngineError> for ContextCreationError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::OutOfMemory { requested } => ContextCreationError::OutOfMemory { requested },
            other => ContextCreationError::Engine(other),
        }
    }
}

/// Failure of the one-call constructor, aggregating both acquisition steps.
#[derive(Debug, Error)]
pub enum ConstructionError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error(transparent)]
    ModelLoad(#[from] ModelLoadError),

    #[error(transparent)]
    ContextCreation(#[from] ContextCreationError),
}

/// An explicit model release was refused because sessions still use it.
#[derive(Debug, Error)]
#[error("model {} still referenced by {sessions} live session(s)", path.display())]
pub struct ModelInUse {
    pub path: PathBuf,
    pub sessions: usize,
}

/// Failures that abort a generate request before any text exists.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("session has been released")]
    SessionReleased,

    #[error("session is unusable after a failed evaluation; reconstruct it")]
    SessionPoisoned,

    #[error("failed to tokenize prompt")]
    Tokenization(#[source] EngineError),

    #[error("prompt needs {tokens} positions but the context holds {capacity}")]
    CapacityExceeded { tokens: usize, capacity: usize },

    #[error("failed to evaluate prompt")]
    Evaluation(#[source] EngineError),
}

impl GenerationError {
    /// Whether the session may serve further requests after this error.
    pub fn session_reusable(&self) -> bool {
        !matches!(
            self,
            GenerationError::SessionReleased
                | GenerationError::SessionPoisoned
                | GenerationError::Evaluation(_)
        )
    }
}

/// Configuration could not be assembled.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
