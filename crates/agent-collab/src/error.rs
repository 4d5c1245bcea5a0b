use agent_runtime::ConfigurationError;

use crate::context::StepError;
use crate::orchestrator::CollaborationResult;

pub type Result<T> = std::result::Result<T, CollabError>;

#[derive(thiserror::Error, Debug)]
pub enum CollabError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Planning(#[from] PlanningError),
    #[error(transparent)]
    Orchestration(#[from] OrchestrationError),
}

impl CollabError {
    /// Partial result of a run stopped by the fail-fast policy.
    pub fn partial_result(&self) -> Option<&CollaborationResult> {
        match self {
            CollabError::Orchestration(err) => err.partial_result(),
            _ => None,
        }
    }
}

/// No usable plan could be produced.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanningError {
    #[error("cannot plan without agents")]
    EmptyRoster,
    /// A caller-supplied plan failed validation.
    #[error("invalid plan: {0}")]
    InvalidPlan(String),
}

#[derive(thiserror::Error, Debug)]
pub enum OrchestrationError {
    /// Fail-fast stop. `partial` holds the steps completed so far plus the
    /// failing one.
    #[error("step `{key}` failed, stopping run: {error}")]
    StepFailed {
        key: String,
        error: StepError,
        partial: Box<CollaborationResult>,
    },
    #[error("step `{key}` was recorded twice")]
    DuplicateKey { key: String },
}

impl OrchestrationError {
    pub fn partial_result(&self) -> Option<&CollaborationResult> {
        match self {
            OrchestrationError::StepFailed { partial, .. } => Some(partial.as_ref()),
            OrchestrationError::DuplicateKey { .. } => None,
        }
    }
}
