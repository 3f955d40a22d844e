use thiserror::Error;

/// Main error type for the forecast pipeline
#[derive(Error, Debug)]
pub enum PipelineError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Suite definition error: {0}")]
    Suite(#[from] SuiteError),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Repository contract violation: {0}")]
    Repository(String),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Upstream error: {0}")]
    Upstream(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    // Experiment errors
    #[error("Experiment execution failed: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Normalization failed: {0}")]
    Normalize(#[from] NormalizeError),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for PipelineError
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Hard failure of a strategy invocation.
///
/// Aborts the event group currently being processed; every market of the group is
/// recorded as a processing failure and the run moves on to the next group.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ExecutionError {
    pub message: String,
}

impl ExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<LlmCallError> for ExecutionError {
    fn from(err: LlmCallError) -> Self {
        ExecutionError::new(err.to_string())
    }
}

impl From<serde_json::Error> for ExecutionError {
    fn from(err: serde_json::Error) -> Self {
        ExecutionError::new(format!("JSON error: {err}"))
    }
}

/// Transport used for a provider call attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Streaming,
    NonStreaming,
}

impl std::fmt::Display for TransportMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportMode::Streaming => write!(f, "streaming"),
            TransportMode::NonStreaming => write!(f, "non_streaming"),
        }
    }
}

/// Error class of a provider call, used for retry classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmErrorKind {
    Timeout,
    MalformedStream,
    Status,
    Connection,
    InvalidResponse,
    Configuration,
}

impl LlmErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LlmErrorKind::Timeout => "timeout",
            LlmErrorKind::MalformedStream => "malformed_stream",
            LlmErrorKind::Status => "http_status",
            LlmErrorKind::Connection => "connection",
            LlmErrorKind::InvalidResponse => "invalid_response",
            LlmErrorKind::Configuration => "configuration",
        }
    }
}

/// Terminal provider failure with a diagnostic summary
#[derive(Error, Debug, Clone)]
#[error(
    "LLM call failed ({}) after {attempts} attempt(s) via {transport}: status={}, request_id={}: {message}",
    .kind.as_str(),
    .status.map(|s| s.to_string()).unwrap_or_else(|| "none".to_string()),
    .request_id.as_deref().unwrap_or("none")
)]
pub struct LlmCallError {
    pub kind: LlmErrorKind,
    pub status: Option<u16>,
    pub request_id: Option<String>,
    pub attempts: u32,
    pub transport: TransportMode,
    pub message: String,
}

/// Errors raised while building or validating a suite
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SuiteError {
    #[error("Suite {suite_id} defines duplicate research strategy names: {name}")]
    DuplicateResearch { suite_id: String, name: String },

    #[error("Suite {suite_id} defines duplicate forecast strategy names: {name}")]
    DuplicateForecast { suite_id: String, name: String },

    #[error("Suite {suite_id} forecast {forecast} is missing research dependencies: {missing}")]
    MissingDependencies {
        suite_id: String,
        forecast: String,
        missing: String,
    },

    #[error("Suite {suite_id} references unknown {stage} strategy kind '{kind}'")]
    UnknownKind {
        suite_id: String,
        stage: String,
        kind: String,
    },

    #[error("Invalid strategy definition in suite {suite_id}: {reason}")]
    InvalidStrategy { suite_id: String, reason: String },

    #[error("No suites left after filtering")]
    NoneSelected,

    #[error("No experiment suites are registered")]
    EmptyRegistry,
}

/// Raw market payload could not be normalized
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("market payload is not a JSON object")]
    NotAnObject,

    #[error("market payload is missing an id")]
    MissingId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_llm_call_error_summary() {
        let err = LlmCallError {
            kind: LlmErrorKind::Status,
            status: Some(503),
            request_id: Some("req_123".to_string()),
            attempts: 5,
            transport: TransportMode::NonStreaming,
            message: "service unavailable".to_string(),
        };

        let text = err.to_string();
        assert!(text.contains("http_status"));
        assert!(text.contains("status=503"));
        assert!(text.contains("request_id=req_123"));
        assert!(text.contains("5 attempt(s)"));
        assert!(text.contains("non_streaming"));

        let exec: ExecutionError = err.into();
        assert_eq!(exec.message, text);
    }

    #[test]
    fn test_suite_error_messages() {
        let err = SuiteError::MissingDependencies {
            suite_id: "openai".to_string(),
            forecast: "gpt".to_string(),
            missing: "r1, r2".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Suite openai forecast gpt is missing research dependencies: r1, r2"
        );
        assert_eq!(SuiteError::NoneSelected.to_string(), "No suites left after filtering");
    }
}
