use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use agent_runtime::{
    Agent, AgentProfile, CompletionService, ConfigurationError, Memory, MemoryStats, Message,
    SharedMemory, DEFAULT_AGENT_NAME,
};
use futures::stream::{FuturesUnordered, StreamExt};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{CollaborationConfig, ExecutionMode, FailurePolicy};
use crate::context::{truncate_chars, CollaborationContext, StepError, StepResult};
use crate::error::{OrchestrationError, Result};
use crate::plan::{Plan, PlanOrigin, Step};
use crate::planner::{validate_supplied, Planner};

/// Characters of each shared-memory entry shown to later steps.
const SHARED_MEMORY_PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollaborationResult {
    pub task: String,
    pub plan: Plan,
    /// Step results in plan order. Steps that never ran are absent.
    pub results: Vec<StepResult>,
    pub success: bool,
    pub cancelled: bool,
    pub shared_memory: Vec<Message>,
}

impl CollaborationResult {
    pub fn step(&self, key: &str) -> Option<&StepResult> {
        self.results.iter().find(|result| result.key == key)
    }

    pub fn failures(&self) -> impl Iterator<Item = &StepResult> {
        self.results.iter().filter(|result| !result.is_success())
    }

    /// Output of the last successful step.
    pub fn final_output(&self) -> Option<&str> {
        self.results
            .iter()
            .rev()
            .find(|result| result.is_success())
            .map(|result| result.output.as_str())
    }
}

pub struct OrchestratorBuilder {
    planner_service: Arc<dyn CompletionService>,
    agents: Vec<Agent>,
    config: CollaborationConfig,
}

impl OrchestratorBuilder {
    pub fn agent(mut self, agent: Agent) -> Self {
        self.agents.push(agent);
        self
    }

    pub fn agents(mut self, agents: impl IntoIterator<Item = Agent>) -> Self {
        self.agents.extend(agents);
        self
    }

    pub fn config(mut self, config: CollaborationConfig) -> Self {
        self.config = config;
        self
    }

    /// Unnamed agents become `Agent1`, `Agent2`, ... by roster position.
    pub fn build(self) -> Result<Orchestrator> {
        self.config.validate()?;
        if self.agents.is_empty() {
            return Err(ConfigurationError::new("a collaboration needs at least one agent").into());
        }

        let mut agents = IndexMap::with_capacity(self.agents.len());
        for (idx, agent) in self.agents.into_iter().enumerate() {
            let agent = if agent.name() == DEFAULT_AGENT_NAME {
                agent
                    .with_name(format!("{DEFAULT_AGENT_NAME}{}", idx + 1))
                    .map_err(|err| ConfigurationError::new(err.to_string()))?
            } else {
                agent
            };
            let name = agent.name().to_string();
            if agents.contains_key(&name) {
                return Err(ConfigurationError::new(format!(
                    "agent name `{name}` is used more than once"
                ))
                .into());
            }
            agents.insert(name, agent);
        }

        let shared_capacity = if self.config.shared_memory {
            self.config.shared_memory_size
        } else {
            0
        };
        let planner =
            Planner::new(self.planner_service).with_settings(self.config.planner.clone());

        Ok(Orchestrator {
            agents,
            planner,
            shared: Memory::shared(shared_capacity),
            config: self.config,
        })
    }
}

/// Plans a task across a roster of agents and runs the plan.
pub struct Orchestrator {
    agents: IndexMap<String, Agent>,
    planner: Planner,
    shared: SharedMemory,
    config: CollaborationConfig,
}

impl Orchestrator {
    /// `planner_service` answers the planning call; agents bring their own.
    pub fn builder(planner_service: Arc<dyn CompletionService>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            planner_service,
            agents: Vec::new(),
            config: CollaborationConfig::default(),
        }
    }

    pub fn config(&self) -> &CollaborationConfig {
        &self.config
    }

    pub fn agent(&self, name: &str) -> Option<&Agent> {
        self.agents.get(name)
    }

    pub fn agent_names(&self) -> impl Iterator<Item = &str> {
        self.agents.keys().map(String::as_str)
    }

    pub fn roster(&self) -> Vec<AgentProfile> {
        self.agents.values().map(Agent::profile).collect()
    }

    pub async fn plan(&self, task: &str) -> Result<Plan> {
        Ok(self.planner.plan(task, &self.roster()).await?)
    }

    pub async fn shared_memory(&self) -> Vec<Message> {
        self.shared.lock().await.messages()
    }

    pub async fn shared_memory_stats(&self) -> MemoryStats {
        self.shared.lock().await.stats()
    }

    pub async fn clear_shared_memory(&self) {
        self.shared.lock().await.clear();
    }

    /// Blocking variant of [`Orchestrator::aexecute`]. Fails when called from
    /// inside an async runtime.
    pub fn execute(&self, task: &str) -> Result<CollaborationResult> {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(ConfigurationError::new(
                "Orchestrator::execute blocks and cannot run inside an async runtime; use aexecute",
            )
            .into());
        }
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| ConfigurationError::new(format!("failed to start runtime: {err}")))?;
        runtime.block_on(self.aexecute(task))
    }

    pub async fn aexecute(&self, task: &str) -> Result<CollaborationResult> {
        self.aexecute_with_cancel(task, CancellationToken::new())
            .await
    }

    /// Plan and run `task`. Cancelling `cancel` drops every in-flight step and
    /// returns what finished so far with `cancelled` set.
    pub async fn aexecute_with_cancel(
        &self,
        task: &str,
        cancel: CancellationToken,
    ) -> Result<CollaborationResult> {
        let plan = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!(target: "agent_collab::orchestrator", "run cancelled during planning");
                let empty = Plan::new(Vec::new(), PlanOrigin::Fallback);
                return Ok(self.finish(task, &empty, CollaborationContext::new(task), true).await);
            }
            plan = self.plan(task) => plan?,
        };
        self.run(task, plan, cancel).await
    }

    /// Run a caller-supplied plan. Agent names are resolved against the
    /// roster; an invalid plan is a planning error.
    pub async fn aexecute_plan(&self, task: &str, plan: Plan) -> Result<CollaborationResult> {
        let plan = validate_supplied(plan, &self.roster())?;
        self.run(task, plan, CancellationToken::new()).await
    }

    async fn run(
        &self,
        task: &str,
        plan: Plan,
        cancel: CancellationToken,
    ) -> Result<CollaborationResult> {
        let started = Instant::now();
        info!(
            target: "agent_collab::orchestrator",
            steps = plan.len(),
            origin = %plan.origin,
            mode = %self.config.execution_mode,
            policy = %self.config.failure_policy,
            "collaboration started"
        );

        let mut context = CollaborationContext::new(task);
        let cancelled = match self.config.execution_mode {
            ExecutionMode::Sequential => {
                self.run_sequential(&plan, &mut context, &cancel).await?
            }
            ExecutionMode::Parallel => self.run_parallel(&plan, &mut context, &cancel).await?,
        };

        let result = self.finish(task, &plan, context, cancelled).await;
        info!(
            target: "agent_collab::orchestrator",
            success = result.success,
            cancelled = result.cancelled,
            completed = result.results.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "collaboration finished"
        );
        Ok(result)
    }

    /// Returns whether the run was cancelled.
    async fn run_sequential(
        &self,
        plan: &Plan,
        context: &mut CollaborationContext,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        for step in &plan.steps {
            let prompt = self.step_prompt(context, step).await;
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(true),
                result = self.run_step(step, prompt) => result,
            };
            self.record(plan, context, result).await?;
        }
        Ok(false)
    }

    /// Dispatches every step whose dependencies are recorded and whose agent
    /// is idle; results are recorded as they complete.
    ///
    /// An agent runs one step at a time, so a queued step never spends its
    /// step timeout waiting for the agent's previous turn.
    async fn run_parallel(
        &self,
        plan: &Plan,
        context: &mut CollaborationContext,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let mut dispatched = vec![false; plan.steps.len()];
        let mut busy: HashSet<&str> = HashSet::new();
        let mut in_flight = FuturesUnordered::new();

        loop {
            for (idx, step) in plan.steps.iter().enumerate() {
                if dispatched[idx]
                    || busy.contains(step.agent.as_str())
                    || !step.depends_on.iter().all(|dep| context.contains(dep))
                {
                    continue;
                }
                dispatched[idx] = true;
                busy.insert(step.agent.as_str());
                let prompt = self.step_prompt(context, step).await;
                in_flight.push(async move { (idx, self.run_step(step, prompt).await) });
            }
            if in_flight.is_empty() {
                return Ok(false);
            }

            let (idx, result) = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(true),
                Some(done) = in_flight.next() => done,
            };
            busy.remove(plan.steps[idx].agent.as_str());
            self.record(plan, context, result).await?;
        }
    }

    /// Store a finished step; under fail-fast a failure ends the run here.
    async fn record(
        &self,
        plan: &Plan,
        context: &mut CollaborationContext,
        result: StepResult,
    ) -> Result<()> {
        if result.is_success() {
            self.shared
                .lock()
                .await
                .push(Message::assistant(result.output.clone()).with_name(result.agent.clone()));
        }
        let failure = result
            .error
            .clone()
            .map(|error| (result.key.clone(), error));
        context.record(result)?;

        if let Some((key, error)) = failure {
            if self.config.failure_policy == FailurePolicy::FailFast {
                warn!(
                    target: "agent_collab::orchestrator",
                    step = %key,
                    error = %error,
                    "stopping run after failed step"
                );
                let partial = self.finish(context.task(), plan, context.clone(), false).await;
                return Err(OrchestrationError::StepFailed {
                    key,
                    error,
                    partial: Box::new(partial),
                }
                .into());
            }
        }
        Ok(())
    }

    async fn step_prompt(&self, context: &CollaborationContext, step: &Step) -> String {
        let mut prompt = context.render(self.config.context_char_limit);
        prompt.push_str(&format!("Step {}: {}", step.key, step.instruction));

        if self.config.shared_memory {
            let shared = self.shared.lock().await;
            if !shared.is_empty() {
                prompt.push_str("\n\nShared memory:\n");
                for entry in shared.iter() {
                    prompt.push_str(&format!(
                        "- {}: {}\n",
                        entry.name.as_deref().unwrap_or("agent"),
                        truncate_chars(&entry.content, SHARED_MEMORY_PREVIEW_CHARS)
                    ));
                }
            }
        }
        prompt
    }

    /// Never fails: errors and timeouts end up in the returned result.
    async fn run_step(&self, step: &Step, prompt: String) -> StepResult {
        let started = Instant::now();
        info!(
            target: "agent_collab::orchestrator",
            step = %step.key,
            agent = %step.agent,
            prompt_len = prompt.len(),
            "step started"
        );

        let outcome = match self.agents.get(&step.agent) {
            None => Err(StepError::from(&agent_runtime::Error::from(
                ConfigurationError::new(format!("agent `{}` is not in the roster", step.agent)),
            ))),
            Some(agent) => match self.config.step_timeout() {
                Some(limit) => match tokio::time::timeout(limit, agent.achat(&prompt)).await {
                    Ok(outcome) => outcome.map_err(|err| StepError::from(&err)),
                    Err(_) => Err(StepError::timeout(limit)),
                },
                None => agent
                    .achat(&prompt)
                    .await
                    .map_err(|err| StepError::from(&err)),
            },
        };

        let (output, error) = match outcome {
            Ok(output) => (output, None),
            Err(error) => {
                warn!(
                    target: "agent_collab::orchestrator",
                    step = %step.key,
                    agent = %step.agent,
                    error = %error,
                    "step failed"
                );
                (String::new(), Some(error))
            }
        };

        StepResult {
            key: step.key.clone(),
            agent: step.agent.clone(),
            instruction: step.instruction.clone(),
            output,
            error,
            duration: started.elapsed(),
        }
    }

    async fn finish(
        &self,
        task: &str,
        plan: &Plan,
        context: CollaborationContext,
        cancelled: bool,
    ) -> CollaborationResult {
        let mut recorded = context.into_results();
        let results: Vec<StepResult> = plan
            .steps
            .iter()
            .filter_map(|step| recorded.shift_remove(&step.key))
            .collect();
        let success = !cancelled && results.iter().all(StepResult::is_success);
        CollaborationResult {
            task: task.to_string(),
            plan: plan.clone(),
            results,
            success,
            cancelled,
            shared_memory: self.shared_memory().await,
        }
    }
}
