use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::completion::{CompletionRequest, CompletionService};
use crate::error::{ConfigurationError, Result};
use crate::memory::{Memory, MemoryStats, Message, SharedMemory};
use crate::retry::complete_with_retry;
use crate::settings::AgentSettings;
use crate::tool::{Tool, ToolRegistry};

pub const DEFAULT_AGENT_NAME: &str = "Agent";

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant. Use the available tools when they help answer the request.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    ModelResponse {
        iteration: usize,
        content: Option<String>,
        tool_calls: usize,
    },
    ToolCall {
        id: String,
        name: String,
        arguments: Value,
    },
    ToolResult {
        id: String,
        name: String,
        output: String,
    },
    ToolFailed {
        id: String,
        name: String,
        error: String,
    },
    IterationLimit {
        max_iterations: usize,
    },
}

/// Everything one chat turn produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnOutcome {
    pub answer: String,
    pub events: Vec<AgentEvent>,
    /// Completion calls made during the turn.
    pub iterations: usize,
    /// Set when the iteration ceiling ended the turn.
    pub halted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSummary {
    pub name: String,
    pub description: String,
}

/// What a planner needs to know about an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub name: String,
    pub system_prompt: String,
    pub tools: Vec<ToolSummary>,
}

pub struct AgentBuilder {
    name: String,
    service: Arc<dyn CompletionService>,
    system_prompt: String,
    settings: AgentSettings,
    tools: Vec<Arc<dyn Tool>>,
    memory: Option<SharedMemory>,
}

impl AgentBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn settings(mut self, settings: AgentSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn tool<T: Tool + 'static>(mut self, tool: T) -> Self {
        self.tools.push(Arc::new(tool));
        self
    }

    pub fn shared_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    /// Use an existing memory handle instead of a private one.
    pub fn shared_memory(mut self, memory: SharedMemory) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn build(self) -> Result<Agent> {
        let name = checked_name(&self.name)?;
        self.settings.validate()?;

        let mut tools = ToolRegistry::new();
        for tool in self.tools {
            tools.register(tool)?;
        }

        let memory = self
            .memory
            .unwrap_or_else(|| Memory::shared(self.settings.memory_size));

        Ok(Agent {
            name,
            system_prompt: self.system_prompt,
            tools,
            memory,
            service: self.service,
            settings: self.settings,
        })
    }
}

fn checked_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ConfigurationError::new("agent name must not be empty").into());
    }
    Ok(name.to_string())
}

/// An LLM-backed agent running the tool-call loop.
///
/// Turns on one agent never interleave: the memory lock is held from the
/// first completion call until the turn is committed.
pub struct Agent {
    name: String,
    system_prompt: String,
    tools: ToolRegistry,
    memory: SharedMemory,
    service: Arc<dyn CompletionService>,
    settings: AgentSettings,
}

impl Agent {
    pub fn builder(service: Arc<dyn CompletionService>) -> AgentBuilder {
        AgentBuilder {
            name: DEFAULT_AGENT_NAME.to_string(),
            service,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            settings: AgentSettings::default(),
            tools: Vec::new(),
            memory: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rename a built agent. The same rules as [`AgentBuilder::name`] apply.
    pub fn with_name(mut self, name: impl AsRef<str>) -> Result<Self> {
        self.name = checked_name(name.as_ref())?;
        Ok(self)
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn memory(&self) -> SharedMemory {
        Arc::clone(&self.memory)
    }

    pub fn profile(&self) -> AgentProfile {
        AgentProfile {
            name: self.name.clone(),
            system_prompt: self.system_prompt.clone(),
            tools: self
                .tools
                .descriptors()
                .into_iter()
                .map(|descriptor| ToolSummary {
                    name: descriptor.name,
                    description: descriptor.description,
                })
                .collect(),
        }
    }

    pub async fn memory_stats(&self) -> MemoryStats {
        self.memory.lock().await.stats()
    }

    pub async fn clear_memory(&self) {
        self.memory.lock().await.clear();
    }

    /// Blocking variant of [`Agent::achat`]. Fails when called from inside an
    /// async runtime.
    pub fn chat(&self, input: &str) -> Result<String> {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(ConfigurationError::new(
                "Agent::chat blocks and cannot run inside an async runtime; use achat",
            )
            .into());
        }
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| ConfigurationError::new(format!("failed to start runtime: {err}")))?;
        runtime.block_on(self.achat(input))
    }

    pub async fn achat(&self, input: &str) -> Result<String> {
        Ok(self.achat_detailed(input).await?.answer)
    }

    pub async fn achat_detailed(&self, input: &str) -> Result<TurnOutcome> {
        let mut memory = self.memory.lock().await;
        let started = Instant::now();
        info!(
            target: "agent_runtime::agent",
            agent = %self.name,
            input_len = input.len(),
            history = memory.len(),
            "turn started"
        );

        let mut turn = vec![Message::user(input)];
        let outcome = self.run_turn(&memory, &mut turn).await;
        memory.extend(turn);

        match &outcome {
            Ok(outcome) => info!(
                target: "agent_runtime::agent",
                agent = %self.name,
                iterations = outcome.iterations,
                halted = outcome.halted,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "turn finished"
            ),
            Err(err) => warn!(
                target: "agent_runtime::agent",
                agent = %self.name,
                error = %err,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "turn failed"
            ),
        }
        outcome
    }

    async fn run_turn(&self, history: &Memory, turn: &mut Vec<Message>) -> Result<TurnOutcome> {
        let tools = self.tools.descriptors();
        let max_iterations = self.settings.max_iterations;
        let mut events = Vec::new();

        for iteration in 1..=max_iterations {
            let request = CompletionRequest {
                system_prompt: self.system_prompt.clone(),
                messages: history.iter().chain(turn.iter()).cloned().collect(),
                tools: tools.clone(),
                options: self.settings.model.clone(),
            };
            let response = complete_with_retry(
                self.service.as_ref(),
                &request,
                &self.settings.retry,
                self.settings.request_timeout(),
            )
            .await?;

            events.push(AgentEvent::ModelResponse {
                iteration,
                content: response.content.clone(),
                tool_calls: response.tool_calls.len(),
            });

            if !response.requests_tools() {
                let answer = response.content.unwrap_or_default();
                turn.push(Message::assistant(answer.clone()));
                return Ok(TurnOutcome {
                    answer,
                    events,
                    iterations: iteration,
                    halted: false,
                });
            }

            debug!(
                target: "agent_runtime::agent",
                agent = %self.name,
                iteration,
                tool_calls = response.tool_calls.len(),
                "model requested tools"
            );
            turn.push(Message::assistant_tool_calls(
                response.content,
                response.tool_calls.clone(),
            ));

            for call in response.tool_calls {
                events.push(AgentEvent::ToolCall {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    arguments: call.arguments.clone(),
                });
                let output = match self
                    .tools
                    .invoke(&call.name, call.arguments, self.settings.tool_timeout())
                    .await
                {
                    Ok(output) => {
                        events.push(AgentEvent::ToolResult {
                            id: call.id.clone(),
                            name: call.name.clone(),
                            output: output.clone(),
                        });
                        output
                    }
                    Err(err) => {
                        warn!(
                            target: "agent_runtime::agent",
                            agent = %self.name,
                            tool = %call.name,
                            error = %err,
                            "tool call failed"
                        );
                        events.push(AgentEvent::ToolFailed {
                            id: call.id.clone(),
                            name: call.name.clone(),
                            error: err.to_string(),
                        });
                        format!("Error: {err}")
                    }
                };
                turn.push(Message::tool_result(call.id, call.name, output));
            }
        }

        warn!(
            target: "agent_runtime::agent",
            agent = %self.name,
            max_iterations,
            "iteration ceiling reached without a final answer"
        );
        let answer = format!(
            "Stopped: max iterations reached ({max_iterations}) before the model produced a final answer."
        );
        events.push(AgentEvent::IterationLimit { max_iterations });
        turn.push(Message::assistant(answer.clone()));
        Ok(TurnOutcome {
            answer,
            events,
            iterations: max_iterations,
            halted: true,
        })
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.name)
            .field("tools", &self.tools)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::{CompletionResponse, ToolCall};
    use crate::error::{Error, ProviderError};
    use crate::memory::Role;
    use crate::testing::ScriptedCompletionService;
    use crate::tool::FunctionTool;
    use schemars::JsonSchema;
    use serde::Deserialize;
    use serde_json::json;
    use std::time::Duration;

    #[derive(Deserialize, JsonSchema)]
    struct ForecastArgs {
        city: String,
        #[serde(default = "default_days")]
        days: i64,
    }

    fn default_days() -> i64 {
        3
    }

    async fn forecast_city(args: ForecastArgs) -> std::result::Result<String, String> {
        Ok(format!("{}: sunny for {} days", args.city, args.days))
    }

    fn forecast() -> Arc<dyn Tool> {
        Arc::new(FunctionTool::new("forecast", "Weather forecast", forecast_city).unwrap())
    }

    fn settings(max_iterations: usize, memory_size: usize) -> AgentSettings {
        AgentSettings {
            max_iterations,
            memory_size,
            ..AgentSettings::default()
        }
    }

    #[tokio::test]
    async fn plain_answer_is_returned_and_remembered() {
        let service = Arc::new(ScriptedCompletionService::texts(["Hello there."]));
        let agent = Agent::builder(service.clone()).build().unwrap();

        let answer = agent.achat("hi").await.unwrap();
        assert_eq!(answer, "Hello there.");
        assert_eq!(service.calls(), 1);

        let stats = agent.memory_stats().await;
        assert_eq!(stats.user, 1);
        assert_eq!(stats.assistant, 1);
    }

    #[tokio::test]
    async fn tool_results_are_fed_back_to_the_model() {
        let service = Arc::new(ScriptedCompletionService::new([
            Ok(CompletionResponse::tool_calls(vec![ToolCall::new(
                "call-1",
                "forecast",
                json!({ "city": "Oslo" }),
            )])),
            Ok(CompletionResponse::text("Oslo looks sunny.")),
        ]));
        let agent = Agent::builder(service.clone())
            .shared_tool(forecast())
            .build()
            .unwrap();

        let outcome = agent.achat_detailed("weather in Oslo?").await.unwrap();
        assert_eq!(outcome.answer, "Oslo looks sunny.");
        assert_eq!(outcome.iterations, 2);
        assert!(!outcome.halted);
        assert!(outcome.events.contains(&AgentEvent::ToolResult {
            id: "call-1".into(),
            name: "forecast".into(),
            output: "Oslo: sunny for 3 days".into(),
        }));

        let second = service.last_request().await.unwrap();
        assert_eq!(second.tools.len(), 1);
        let tool_message = second
            .messages
            .iter()
            .find(|m| m.role == Role::Tool)
            .unwrap();
        assert_eq!(tool_message.tool_call_id.as_deref(), Some("call-1"));
        assert_eq!(tool_message.content, "Oslo: sunny for 3 days");
    }

    #[tokio::test]
    async fn tool_failures_do_not_abort_the_turn() {
        let service = Arc::new(ScriptedCompletionService::new([
            Ok(CompletionResponse::tool_calls(vec![
                ToolCall::new("a", "teleport", json!({})),
                ToolCall::new("b", "forecast", json!({ "days": 2 })),
            ])),
            Ok(CompletionResponse::text("Sorry, I could not do that.")),
        ]));
        let agent = Agent::builder(service.clone())
            .shared_tool(forecast())
            .build()
            .unwrap();

        let outcome = agent.achat_detailed("go").await.unwrap();
        assert_eq!(outcome.answer, "Sorry, I could not do that.");
        let failures: Vec<_> = outcome
            .events
            .iter()
            .filter(|e| matches!(e, AgentEvent::ToolFailed { .. }))
            .collect();
        assert_eq!(failures.len(), 2);

        let request = service.last_request().await.unwrap();
        let tool_texts: Vec<_> = request
            .messages
            .iter()
            .filter(|m| m.role == Role::Tool)
            .map(|m| m.content.as_str())
            .collect();
        assert!(tool_texts[0].contains("unknown tool: teleport"));
        assert!(tool_texts[1].contains("missing required argument `city`"));
    }

    #[tokio::test]
    async fn stops_at_iteration_ceiling() {
        let service = Arc::new(ScriptedCompletionService::always_tool_call(ToolCall::new(
            "again",
            "forecast",
            json!({ "city": "Bergen" }),
        )));
        let agent = Agent::builder(service.clone())
            .shared_tool(forecast())
            .settings(settings(4, 20))
            .build()
            .unwrap();

        let outcome = agent.achat_detailed("loop forever").await.unwrap();
        assert_eq!(service.calls(), 4);
        assert_eq!(outcome.iterations, 4);
        assert!(outcome.halted);
        assert!(outcome.answer.contains("max iterations reached"));
        assert_eq!(
            outcome.events.last(),
            Some(&AgentEvent::IterationLimit { max_iterations: 4 })
        );
    }

    #[tokio::test]
    async fn memory_keeps_most_recent_entries() {
        let service = Arc::new(ScriptedCompletionService::texts([
            "a1", "a2", "a3", "a4", "a5",
        ]));
        let agent = Agent::builder(service)
            .settings(settings(8, 3))
            .build()
            .unwrap();
        for turn in 1..=5 {
            agent.achat(&format!("u{turn}")).await.unwrap();
        }
        let memory = agent.memory();
        let contents: Vec<_> = memory
            .lock()
            .await
            .iter()
            .map(|m| m.content.clone())
            .collect();
        assert_eq!(contents, vec!["a4", "u5", "a5"]);
    }

    #[tokio::test]
    async fn provider_failure_still_commits_the_input() {
        let service = Arc::new(ScriptedCompletionService::new([Err(
            ProviderError::Authentication("expired".into()),
        )]));
        let agent = Agent::builder(service).build().unwrap();

        let err = agent.achat("hello?").await.unwrap_err();
        assert!(err.is_provider());
        let records = agent.memory().lock().await.export();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].content, "hello?");
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_turns_are_serialized() {
        let service = Arc::new(
            ScriptedCompletionService::texts(["first", "second"])
                .with_delay(Duration::from_millis(50)),
        );
        let agent = Agent::builder(service.clone()).build().unwrap();

        let (a, b) = tokio::join!(agent.achat("one"), agent.achat("two"));
        assert_eq!(a.unwrap(), "first");
        assert_eq!(b.unwrap(), "second");

        let requests = service.requests().await;
        assert_eq!(requests[0].messages.len(), 1);
        assert_eq!(requests[1].messages.len(), 3);
    }

    #[tokio::test]
    async fn blocking_chat_refuses_inside_runtime() {
        let service = Arc::new(ScriptedCompletionService::texts(["unused"]));
        let agent = Agent::builder(service).build().unwrap();
        let err = agent.chat("hi").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn blocking_chat_outside_runtime() {
        let service = Arc::new(ScriptedCompletionService::texts(["pong"]));
        let agent = Agent::builder(service).build().unwrap();
        assert_eq!(agent.chat("ping").unwrap(), "pong");
    }

    #[tokio::test]
    async fn evicted_tool_turn_leaves_no_orphan_results() {
        let service = Arc::new(ScriptedCompletionService::new([
            Ok(CompletionResponse::tool_calls(vec![ToolCall::new(
                "c1",
                "forecast",
                json!({ "city": "Oslo" }),
            )])),
            Ok(CompletionResponse::text("done")),
            Ok(CompletionResponse::text("again")),
        ]));
        let agent = Agent::builder(service.clone())
            .shared_tool(forecast())
            .settings(settings(8, 2))
            .build()
            .unwrap();

        agent.achat("weather?").await.unwrap();
        agent.achat("and tomorrow?").await.unwrap();

        let request = service.last_request().await.unwrap();
        let roles: Vec<_> = request.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::Assistant, Role::User]);
        assert_eq!(request.messages[0].content, "done");
    }

    #[test]
    fn renaming_checks_the_name() {
        let service: Arc<dyn CompletionService> =
            Arc::new(ScriptedCompletionService::default());
        let agent = Agent::builder(service.clone()).build().unwrap();
        let renamed = agent.with_name("  Scout ").unwrap();
        assert_eq!(renamed.name(), "Scout");

        let err = Agent::builder(service)
            .build()
            .unwrap()
            .with_name("   ")
            .err()
            .unwrap();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn build_validates_configuration() {
        let service: Arc<dyn CompletionService> =
            Arc::new(ScriptedCompletionService::default());
        assert!(Agent::builder(service.clone()).name("  ").build().is_err());
        assert!(Agent::builder(service.clone())
            .settings(settings(0, 20))
            .build()
            .is_err());
        let err = Agent::builder(service.clone())
            .shared_tool(forecast())
            .shared_tool(forecast())
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        let agent = Agent::builder(service)
            .name("Forecaster")
            .shared_tool(forecast())
            .build()
            .unwrap();
        let profile = agent.profile();
        assert_eq!(profile.name, "Forecaster");
        assert_eq!(profile.tools[0].name, "forecast");
    }
}
