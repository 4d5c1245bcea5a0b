use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

pub const DEFAULT_MAX_ITERATIONS: usize = 8;
pub const DEFAULT_MEMORY_SIZE: usize = 20;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Sampling options forwarded with every completion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelOptions {
    pub model: Option<String>,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            model: None,
            temperature: 0.7,
            max_tokens: None,
        }
    }
}

impl ModelOptions {
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigurationError::new(format!(
                "temperature must be between 0 and 2, got {}",
                self.temperature
            )));
        }
        if self.max_tokens == Some(0) {
            return Err(ConfigurationError::new("max_tokens must be positive"));
        }
        Ok(())
    }
}

/// Bounded retry with exponential backoff for transient provider failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: usize,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 250,
            max_backoff_ms: 2_000,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no waiting.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: usize) -> Duration {
        if self.initial_backoff_ms == 0 {
            return Duration::ZERO;
        }
        let initial = self.initial_backoff_ms;
        let cap = self.max_backoff_ms.max(initial);
        let shift = retry.saturating_sub(1).min(32) as u32;
        let ms = initial.saturating_mul(1u64 << shift).min(cap);
        Duration::from_millis(ms)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_attempts == 0 {
            return Err(ConfigurationError::new("retry max_attempts must be at least 1"));
        }
        Ok(())
    }
}

/// Per-agent settings, fixed at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Upper bound on completion calls per turn.
    pub max_iterations: usize,
    /// Maximum retained memory entries; 0 disables memory.
    pub memory_size: usize,
    pub request_timeout_ms: u64,
    pub tool_timeout_ms: Option<u64>,
    pub model: ModelOptions,
    pub retry: RetryPolicy,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            memory_size: DEFAULT_MEMORY_SIZE,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            tool_timeout_ms: None,
            model: ModelOptions::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl AgentSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn tool_timeout(&self) -> Option<Duration> {
        self.tool_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_iterations == 0 {
            return Err(ConfigurationError::new("max_iterations must be at least 1"));
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigurationError::new("request timeout must be positive"));
        }
        if self.tool_timeout_ms == Some(0) {
            return Err(ConfigurationError::new("tool timeout must be positive"));
        }
        self.model.validate()?;
        self.retry.validate()
    }
}
