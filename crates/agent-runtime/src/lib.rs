//! Tool-calling LLM agents.
//!
//! Tools are async functions of one typed argument struct; their descriptors
//! are derived once at registration. An [`Agent`] runs the tool-call loop
//! against any [`CompletionService`], keeping a bounded [`Memory`].

pub mod agent;
pub mod completion;
pub mod error;
pub mod memory;
pub mod retry;
pub mod schema;
pub mod settings;
pub mod tool;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use agent::{
    Agent, AgentBuilder, AgentEvent, AgentProfile, ToolSummary, TurnOutcome, DEFAULT_AGENT_NAME,
};
pub use completion::{
    CompletionRequest, CompletionResponse, CompletionService, CompletionUsage, ToolCall,
};
pub use error::{ConfigurationError, Error, ProviderError, Result, SchemaError, ToolError};
pub use memory::{
    estimate_tokens, Memory, MemoryRecord, MemoryStats, Message, Role, SharedMemory,
};
pub use retry::complete_with_retry;
pub use schema::{ParamKind, ParameterSpec, SchemaGenerator, ToolDescriptor};
pub use settings::{AgentSettings, ModelOptions, RetryPolicy};
pub use tool::{FunctionTool, Tool, ToolRegistry};
