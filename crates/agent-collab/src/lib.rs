//! Multi-agent collaboration on top of `agent-runtime`: a planner that maps a
//! task onto roster agents, and an orchestrator that runs the resulting plan
//! with context propagation, failure policies and optional parallelism.

pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod plan;
pub mod planner;

pub use config::{CollaborationConfig, ExecutionMode, FailurePolicy, PlannerSettings};
pub use context::{CollaborationContext, StepError, StepErrorKind, StepResult};
pub use error::{CollabError, OrchestrationError, PlanningError, Result};
pub use logging::init_logging;
pub use orchestrator::{CollaborationResult, Orchestrator, OrchestratorBuilder};
pub use plan::{Plan, PlanOrigin, Step};
pub use planner::{
    extract_json, fallback_plan, json_values, resolve_agent_name, validate_supplied, Planner,
};
pub use tokio_util::sync::CancellationToken;
