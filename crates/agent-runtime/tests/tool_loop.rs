//! End-to-end tool loop against a hand-written completion service.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use agent_runtime::{
    Agent, AgentEvent, AgentSettings, CompletionRequest, CompletionResponse, CompletionService,
    FunctionTool, ProviderError, Role, ToolCall,
};
use anyhow::{bail, Result};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::json;

/// Asks for `add` on a fresh user message and reports the last tool result
/// otherwise.
#[derive(Default)]
struct ArithmeticModel {
    calls: AtomicUsize,
}

#[async_trait]
impl CompletionService for ArithmeticModel {
    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> std::result::Result<CompletionResponse, ProviderError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let last = request
            .messages
            .last()
            .ok_or_else(|| ProviderError::InvalidRequest("empty conversation".into()))?;
        match last.role {
            Role::User => Ok(CompletionResponse::tool_calls(vec![ToolCall::new(
                format!("call-{n}"),
                "add",
                json!(r#"{"a": "2", "b": 3.0}"#),
            )])),
            Role::Tool => Ok(CompletionResponse::text(format!(
                "The sum is {}.",
                last.content
            ))),
            _ => Err(ProviderError::InvalidRequest("unexpected turn".into())),
        }
    }
}

#[derive(Deserialize, JsonSchema)]
struct AddArgs {
    a: i64,
    b: i64,
}

async fn add(args: AddArgs) -> Result<i64> {
    match args.a.checked_add(args.b) {
        Some(sum) => Ok(sum),
        None => bail!("overflow"),
    }
}

#[tokio::test]
async fn coerced_arguments_reach_the_tool() -> Result<()> {
    let model = Arc::new(ArithmeticModel::default());
    let agent = Agent::builder(model.clone())
        .name("Calculator")
        .system_prompt("You add numbers with the add tool.")
        .tool(FunctionTool::new("add", "Add two integers", add)?)
        .build()?;

    let outcome = agent.achat_detailed("what is 2 + 3?").await?;
    assert_eq!(outcome.answer, "The sum is 5.");
    assert_eq!(outcome.iterations, 2);
    assert!(outcome
        .events
        .iter()
        .any(|e| matches!(e, AgentEvent::ToolResult { output, .. } if output == "5")));
    assert_eq!(model.calls.load(Ordering::SeqCst), 2);

    let stats = agent.memory_stats().await;
    assert_eq!(stats.tools_used, vec!["add".to_string()]);
    assert_eq!(stats.entries, 4);
    Ok(())
}

#[tokio::test]
async fn memory_carries_across_turns_until_cleared() -> Result<()> {
    let model = Arc::new(ArithmeticModel::default());
    let agent = Agent::builder(model)
        .settings(AgentSettings {
            memory_size: 6,
            ..AgentSettings::default()
        })
        .tool(FunctionTool::new("add", "Add two integers", add)?)
        .build()?;

    agent.achat("first").await?;
    agent.achat("second").await?;
    let stats = agent.memory_stats().await;
    assert_eq!(stats.entries, 6);
    assert_eq!(stats.capacity, 6);

    agent.clear_memory().await;
    assert_eq!(agent.memory_stats().await.entries, 0);
    Ok(())
}
