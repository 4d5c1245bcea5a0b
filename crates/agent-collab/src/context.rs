use std::fmt;
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::OrchestrationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepErrorKind {
    Provider,
    Configuration,
    Schema,
    Tool,
    /// The step exceeded its time budget.
    Timeout,
}

/// Serializable failure attached to a [`StepResult`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepError {
    pub kind: StepErrorKind,
    pub message: String,
}

impl StepError {
    pub fn timeout(limit: Duration) -> Self {
        Self {
            kind: StepErrorKind::Timeout,
            message: format!("step timed out after {limit:?}"),
        }
    }
}

impl From<&agent_runtime::Error> for StepError {
    fn from(err: &agent_runtime::Error) -> Self {
        let kind = match err {
            agent_runtime::Error::Configuration(_) => StepErrorKind::Configuration,
            agent_runtime::Error::Schema(_) => StepErrorKind::Schema,
            agent_runtime::Error::Provider(_) => StepErrorKind::Provider,
            agent_runtime::Error::Tool(_) => StepErrorKind::Tool,
        };
        Self {
            kind,
            message: err.to_string(),
        }
    }
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for StepError {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResult {
    pub key: String,
    pub agent: String,
    pub instruction: String,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    pub duration: Duration,
}

impl StepResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Write-once record of step results for one run, keyed by step key.
#[derive(Debug, Clone, Default)]
pub struct CollaborationContext {
    task: String,
    results: IndexMap<String, StepResult>,
}

impl CollaborationContext {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            results: IndexMap::new(),
        }
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn record(&mut self, result: StepResult) -> Result<(), OrchestrationError> {
        if self.results.contains_key(&result.key) {
            return Err(OrchestrationError::DuplicateKey { key: result.key });
        }
        self.results.insert(result.key.clone(), result);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&StepResult> {
        self.results.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.results.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn has_failures(&self) -> bool {
        self.results.values().any(|result| !result.is_success())
    }

    /// Results in the order they were recorded.
    pub fn results(&self) -> impl Iterator<Item = &StepResult> {
        self.results.values()
    }

    pub fn into_results(self) -> IndexMap<String, StepResult> {
        self.results
    }

    /// Text view handed to the next agent: the original task followed by
    /// every recorded step, each output cut to `char_limit` characters.
    pub fn render(&self, char_limit: usize) -> String {
        let mut out = format!("Original task: {}\n\n", self.task);
        for result in self.results.values() {
            match &result.error {
                None => out.push_str(&format!(
                    "Step {} ({}): {}\n\n",
                    result.key,
                    result.agent,
                    truncate_chars(&result.output, char_limit)
                )),
                Some(err) => out.push_str(&format!(
                    "Step {} ({}) failed: {}\n\n",
                    result.key,
                    result.agent,
                    truncate_chars(&err.message, char_limit)
                )),
            }
        }
        out
    }
}

pub(crate) fn truncate_chars(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
