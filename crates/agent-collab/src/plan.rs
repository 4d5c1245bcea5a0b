use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// One unit of work assigned to a named agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    #[serde(default)]
    pub key: String,
    pub agent: String,
    pub instruction: String,
    /// Keys of earlier steps whose output this step needs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

impl Step {
    pub fn new(
        key: impl Into<String>,
        agent: impl Into<String>,
        instruction: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            agent: agent.into(),
            instruction: instruction.into(),
            depends_on: Vec::new(),
        }
    }

    pub fn depends_on<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = keys.into_iter().map(Into::into).collect();
        self
    }
}

/// Default key for the step at `index` (0-based).
pub fn default_step_key(index: usize) -> String {
    format!("step-{}", index + 1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanOrigin {
    /// Produced by the planning model.
    Model,
    /// Round-robin plan used when the model's plan was unusable.
    Fallback,
    /// Provided by the caller, e.g. from a plan file.
    Supplied,
}

impl PlanOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Model => "model",
            Self::Fallback => "fallback",
            Self::Supplied => "supplied",
        }
    }
}

impl fmt::Display for PlanOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub steps: Vec<Step>,
    pub origin: PlanOrigin,
}

#[derive(Serialize)]
struct PlanFileRef<'a> {
    steps: &'a [Step],
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PlanDocument {
    Wrapped { steps: Vec<Step> },
    Bare(Vec<Step>),
}

impl Plan {
    pub fn new(steps: Vec<Step>, origin: PlanOrigin) -> Self {
        Self { steps, origin }
    }

    pub fn supplied(steps: Vec<Step>) -> Self {
        Self::new(steps, PlanOrigin::Supplied)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step(&self, key: &str) -> Option<&Step> {
        self.steps.iter().find(|step| step.key == key)
    }

    /// Check key uniqueness and that dependencies only point backwards.
    pub fn check_structure(&self) -> std::result::Result<(), String> {
        if self.steps.is_empty() {
            return Err("plan has no steps".to_string());
        }
        let mut seen: HashSet<&str> = HashSet::new();
        for (idx, step) in self.steps.iter().enumerate() {
            let position = idx + 1;
            if step.key.trim().is_empty() {
                return Err(format!("step {position} has an empty key"));
            }
            if step.agent.trim().is_empty() {
                return Err(format!("step `{}` names no agent", step.key));
            }
            if step.instruction.trim().is_empty() {
                return Err(format!("step `{}` has no instruction", step.key));
            }
            for dep in &step.depends_on {
                if !seen.contains(dep.as_str()) {
                    return Err(format!(
                        "step `{}` depends on `{dep}`, which is not an earlier step",
                        step.key
                    ));
                }
            }
            if !seen.insert(step.key.as_str()) {
                return Err(format!("step key `{}` is used twice", step.key));
            }
        }
        Ok(())
    }

    /// Write the plan as `{"steps": [...]}`.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let body = serde_json::to_string_pretty(&PlanFileRef { steps: &self.steps })
            .context("failed to serialize plan")?;
        fs::write(path, body)
            .with_context(|| format!("failed to write plan file {}", path.display()))
    }

    /// Read a plan file. Both `{"steps": [...]}` and a bare array are
    /// accepted; missing keys become `step-N`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read plan file {}", path.display()))?;
        let document: PlanDocument = serde_json::from_str(&raw)
            .with_context(|| format!("plan file {} is not a valid plan", path.display()))?;
        let mut steps = match document {
            PlanDocument::Wrapped { steps } | PlanDocument::Bare(steps) => steps,
        };
        for (idx, step) in steps.iter_mut().enumerate() {
            if step.key.trim().is_empty() {
                step.key = default_step_key(idx);
            }
        }
        Ok(Self::supplied(steps))
    }
}
