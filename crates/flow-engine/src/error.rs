//! Error types for the flow engine

use thiserror::Error;

/// Result type alias using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur while configuring or executing flows
#[derive(Debug, Error)]
pub enum EngineError {
    /// Node configuration could not be loaded
    #[error("node configuration failed: {0}")]
    Config(String),

    /// A shared connector instance is missing or of the wrong type
    #[error("connector instance '{0}' is missing or has the wrong type")]
    Connector(String),

    /// The flow has nothing that can spawn an execution
    #[error("flow needs at least one trigger or wait node")]
    NoStartNode,

    /// Flow id not present in the manager registry
    #[error("unknown flow id '{0}'")]
    UnknownFlow(String),

    /// A node failed while processing a message
    #[error("node execution failed: {0}")]
    Execution(String),

    /// Variable lookup miss
    #[error("variable '{name}' not found in scope '{scope}'")]
    VariableNotFound { name: String, scope: String },

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Create a configuration error with a message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an execution error with a message
    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution(msg.into())
    }
}
