use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use agent_runtime::{ConfigurationError, ModelOptions, RetryPolicy};
use serde::{Deserialize, Serialize};

/// What the orchestrator does when a step fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailurePolicy {
    /// Record the failure and keep going.
    #[default]
    #[serde(rename = "continue")]
    Continue,
    /// Stop at the first failure.
    #[serde(rename = "fail-fast")]
    FailFast,
}

impl FailurePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Continue => "continue",
            Self::FailFast => "fail-fast",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "continue" => Some(Self::Continue),
            "fail-fast" | "fail_fast" | "failfast" => Some(Self::FailFast),
            _ => None,
        }
    }
}

impl FromStr for FailurePolicy {
    type Err = ConfigurationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
            .ok_or_else(|| ConfigurationError::new(format!("unknown failure policy: {value}")))
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Sequential,
    /// Independent steps run concurrently; dependents wait for their inputs.
    Parallel,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Parallel => "parallel",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "sequential" => Some(Self::Sequential),
            "parallel" => Some(Self::Parallel),
            _ => None,
        }
    }
}

impl FromStr for ExecutionMode {
    type Err = ConfigurationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
            .ok_or_else(|| ConfigurationError::new(format!("unknown execution mode: {value}")))
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Settings for the planning call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerSettings {
    pub model: ModelOptions,
    pub retry: RetryPolicy,
    pub request_timeout_ms: u64,
    /// Replaces the default planning preamble. Roster and name rules are
    /// always appended.
    pub planning_prompt: Option<String>,
}

impl Default for PlannerSettings {
    fn default() -> Self {
        Self {
            model: ModelOptions::default().with_temperature(0.3),
            retry: RetryPolicy::default(),
            request_timeout_ms: agent_runtime::settings::DEFAULT_REQUEST_TIMEOUT_MS,
            planning_prompt: None,
        }
    }
}

impl PlannerSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.request_timeout_ms == 0 {
            return Err(ConfigurationError::new(
                "planner request timeout must be positive",
            ));
        }
        self.model.validate()?;
        self.retry.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollaborationConfig {
    pub failure_policy: FailurePolicy,
    pub execution_mode: ExecutionMode,
    /// Keep a log of every step output and show it to later steps.
    pub shared_memory: bool,
    pub shared_memory_size: usize,
    pub step_timeout_ms: Option<u64>,
    /// Per-step character budget when rendering earlier outputs.
    pub context_char_limit: usize,
    pub planner: PlannerSettings,
}

impl Default for CollaborationConfig {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::Continue,
            execution_mode: ExecutionMode::Sequential,
            shared_memory: true,
            shared_memory_size: 50,
            step_timeout_ms: None,
            context_char_limit: 2_000,
            planner: PlannerSettings::default(),
        }
    }
}

impl CollaborationConfig {
    pub fn step_timeout(&self) -> Option<Duration> {
        self.step_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.step_timeout_ms == Some(0) {
            return Err(ConfigurationError::new("step timeout must be positive"));
        }
        self.planner.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_policies_and_modes() {
        assert_eq!("fail-fast".parse::<FailurePolicy>().unwrap(), FailurePolicy::FailFast);
        assert_eq!(FailurePolicy::parse("continue"), Some(FailurePolicy::Continue));
        assert!("explode".parse::<FailurePolicy>().is_err());
        assert_eq!("parallel".parse::<ExecutionMode>().unwrap(), ExecutionMode::Parallel);
        assert_eq!(ExecutionMode::Sequential.to_string(), "sequential");
    }

    #[test]
    fn defaults() {
        let config = CollaborationConfig::default();
        config.validate().unwrap();
        assert_eq!(config.failure_policy, FailurePolicy::Continue);
        assert_eq!(config.execution_mode, ExecutionMode::Sequential);
        assert_eq!(config.shared_memory_size, 50);
        assert_eq!(config.planner.model.temperature, 0.3);
    }

    #[test]
    fn deserializes_from_json() {
        let config: CollaborationConfig = serde_json::from_str(
            r#"{"failure_policy": "fail-fast", "execution_mode": "parallel", "step_timeout_ms": 500}"#,
        )
        .unwrap();
        assert_eq!(config.failure_policy, FailurePolicy::FailFast);
        assert_eq!(config.execution_mode, ExecutionMode::Parallel);
        assert_eq!(config.step_timeout(), Some(Duration::from_millis(500)));
        assert!(config.shared_memory);
    }
}
