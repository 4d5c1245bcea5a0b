use std::time::Duration;

/// Convenient result alias for agent runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to callers of the agent runtime.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Agent, provider or settings were set up incorrectly.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    /// A tool signature could not be turned into a descriptor.
    #[error(transparent)]
    Schema(#[from] SchemaError),
    /// The completion service failed and retries did not help.
    #[error(transparent)]
    Provider(#[from] ProviderError),
    /// Tool failures only reach callers through [`crate::ToolRegistry::invoke`];
    /// the agent loop turns them into tool-result messages.
    #[error(transparent)]
    Tool(#[from] ToolError),
}

impl Error {
    /// Whether the error came from the completion service.
    pub fn is_provider(&self) -> bool {
        matches!(self, Error::Provider(_))
    }
}

/// Invalid agent, provider or settings.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("configuration error: {0}")]
pub struct ConfigurationError(pub String);

impl ConfigurationError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Raised at registration time when a tool cannot be described.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("tool `{tool}` has an invalid signature: {reason}")]
pub struct SchemaError {
    pub tool: String,
    pub reason: String,
}

impl SchemaError {
    pub fn new(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            reason: reason.into(),
        }
    }
}

/// Failures inside a single tool call. Never fatal to the tool loop.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    #[error("unknown tool: {name}")]
    NotFound { name: String },
    #[error("invalid arguments for tool `{tool}`: {reason}")]
    InvalidArguments { tool: String, reason: String },
    #[error("tool `{tool}` failed: {reason}")]
    Execution { tool: String, reason: String },
}

impl ToolError {
    pub fn invalid(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        ToolError::InvalidArguments {
            tool: tool.into(),
            reason: reason.into(),
        }
    }

    pub fn execution(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        ToolError::Execution {
            tool: tool.into(),
            reason: reason.into(),
        }
    }

    pub fn tool_name(&self) -> &str {
        match self {
            ToolError::NotFound { name } => name,
            ToolError::InvalidArguments { tool, .. } | ToolError::Execution { tool, .. } => tool,
        }
    }
}

/// Completion service failures.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Network hiccups, 5xx responses and similar.
    #[error("transient provider failure: {0}")]
    Transient(String),
    #[error("provider rate limit hit: {0}")]
    RateLimited(String),
    #[error("completion call timed out after {0:?}")]
    Timeout(Duration),
    #[error("provider rejected credentials: {0}")]
    Authentication(String),
    #[error("provider rejected the request: {0}")]
    InvalidRequest(String),
    /// Returned once the retry budget is spent on transient failures.
    #[error("completion failed after {attempts} attempts: {last}")]
    Exhausted { attempts: usize, last: Box<ProviderError> },
}

impl ProviderError {
    /// Transient failures are retried locally; everything else surfaces.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::Transient(_) | ProviderError::RateLimited(_) | ProviderError::Timeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_kinds_are_retryable() {
        assert!(ProviderError::Transient("503".into()).is_transient());
        assert!(ProviderError::RateLimited("429".into()).is_transient());
        assert!(ProviderError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!ProviderError::Authentication("bad key".into()).is_transient());
        assert!(!ProviderError::InvalidRequest("bad body".into()).is_transient());
    }

    #[test]
    fn tool_error_names_the_tool() {
        let err = ToolError::invalid("weather", "missing city");
        assert_eq!(err.tool_name(), "weather");
        assert_eq!(
            err.to_string(),
            "invalid arguments for tool `weather`: missing city"
        );
        let err = ToolError::NotFound {
            name: "nope".into(),
        };
        assert_eq!(err.to_string(), "unknown tool: nope");
    }

    #[test]
    fn exhausted_wraps_last_failure() {
        let err = ProviderError::Exhausted {
            attempts: 3,
            last: Box::new(ProviderError::Transient("connection reset".into())),
        };
        assert!(!err.is_transient());
        assert!(err.to_string().contains("3 attempts"));
        assert!(err.to_string().contains("connection reset"));
    }
}
