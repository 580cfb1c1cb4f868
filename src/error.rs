//! Error types for the flow controller

use thiserror::Error;

/// Result type for controller operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Comprehensive error types for the flow controller
#[derive(Error, Debug)]
pub enum EngineError {
    /// Malformed identifier, null where forbidden, or otherwise bad input
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation attempted from the wrong state
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// Component lookup failed
    #[error("Component {0} not found")]
    ComponentNotFound(String),

    /// Identifier already present somewhere in the graph
    #[error("Identifier {0} already exists in the flow")]
    DuplicateIdentifier(String),

    /// Plug-in type could not be resolved or its constructor failed
    #[error("Unable to instantiate {type_name}: {reason}")]
    Instantiation { type_name: String, reason: String },

    /// Failure surfaced by a delegated repository
    #[error("Repository error: {0}")]
    Repository(String),

    /// Cluster communication failure
    #[error("Communication error: {0}")]
    Communication(String),

    /// Replay precondition failed; the message is surfaced to the caller verbatim
    #[error("{0}")]
    Replay(String),

    /// Configuration could not be loaded or validated
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Controller has been shut down
    #[error("Flow controller has been terminated")]
    Terminated,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Repository(err.to_string())
    }
}
