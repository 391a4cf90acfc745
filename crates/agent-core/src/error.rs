use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed or error-flagged response to a non-tool request.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Tool invocation error: {tool_name}: {message}")]
    ToolInvocation { tool_name: String, message: String },

    /// Every candidate model was rejected as unavailable by the backend.
    #[error("No available model (attempted: {})", attempted.join(", "))]
    ModelUnavailable { attempted: Vec<String> },

    #[error("Session closed before a response arrived")]
    SessionClosed,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Schema build error: {0}")]
    Schema(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;
