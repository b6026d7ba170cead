//! Error types for adflow.
//!
//! Errors carry a stable code so callers (CLI, schedulers, dashboards) can
//! branch on the failure class without parsing messages.

use thiserror::Error;

/// Result type alias for adflow operations.
pub type Result<T> = std::result::Result<T, Error>;

/// adflow error types.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Workflow error: {0}")]
    Workflow(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Workflow '{workflow}' is already running for customer '{customer_id}'")]
    AlreadyRunning {
        workflow: String,
        customer_id: String,
    },

    #[error("Context size {size} bytes exceeds limit of {limit} bytes")]
    ContextTooLarge { size: usize, limit: usize },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Output error: {0}")]
    Output(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Shutdown in progress")]
    ShuttingDown,

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get the error code for programmatic handling.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Workflow(_) => "WORKFLOW_ERROR",
            Error::Execution(_) => "EXECUTION_ERROR",
            Error::AlreadyRunning { .. } => "ALREADY_RUNNING",
            Error::ContextTooLarge { .. } => "CONTEXT_TOO_LARGE",
            Error::InvalidState(_) => "INVALID_STATE",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Output(_) => "OUTPUT_ERROR",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Parse(_) => "PARSE_ERROR",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::ShuttingDown => "SHUTTING_DOWN",
            Error::Database(_) => "DATABASE_ERROR",
            Error::Yaml(_) => "YAML_ERROR",
            Error::Json(_) => "JSON_ERROR",
            Error::Io(_) => "IO_ERROR",
        }
    }

    /// Convert to a JSON response (includes full error details).
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        })
    }
}
